//! Low-level reader for the NDGR binary wire format.
//!
//! The upstream schema is not published, so there is no generated code here:
//! buffers are walked field by field and the caller picks the field numbers it
//! knows about (see [`super::schema`]). Every routine degrades to "stop here"
//! instead of failing the whole stream.

use thiserror::Error;

/// Malformed wire bytes. Always recovered locally by the decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// A varint continued past its tenth byte
    #[error("varint starting at offset {offset} exceeds 64 bits")]
    VarintTooLong { offset: usize },

    /// The buffer ended in the middle of a value
    #[error("unexpected end of buffer at offset {offset}")]
    UnexpectedEof { offset: usize },

    /// Wire types 3/4 (groups) and 6/7 are not understood
    #[error("unknown wire type {wire_type} at offset {offset}")]
    UnknownWireType { wire_type: u8, offset: usize },
}

/// Wire type carried in the low three bits of a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    fn from_tag(tag: u32, offset: usize) -> Result<Self, FormatError> {
        match (tag & 0x7) as u8 {
            0 => Ok(Self::Varint),
            1 => Ok(Self::Fixed64),
            2 => Ok(Self::LengthDelimited),
            5 => Ok(Self::Fixed32),
            other => Err(FormatError::UnknownWireType {
                wire_type: other,
                offset,
            }),
        }
    }
}

/// Payload of a single field, borrowed from the message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u32),
    Fixed64(&'a [u8]),
    LengthDelimited(&'a [u8]),
    Fixed32(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub number: u32,
    pub value: FieldValue<'a>,
}

impl Field<'_> {
    pub fn wire_type(&self) -> WireType {
        match self.value {
            FieldValue::Varint(_) => WireType::Varint,
            FieldValue::Fixed64(_) => WireType::Fixed64,
            FieldValue::LengthDelimited(_) => WireType::LengthDelimited,
            FieldValue::Fixed32(_) => WireType::Fixed32,
        }
    }
}

/// Decode a base-128 little-endian varint starting at `offset`.
///
/// Returns the low 32 bits of the value and the number of bytes consumed.
/// Values wider than 64 bits and varints cut off by the end of the buffer are
/// reported as [`FormatError`].
pub fn read_varint(buf: &[u8], offset: usize) -> Result<(u32, usize), FormatError> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut pos = offset;

    loop {
        let Some(&byte) = buf.get(pos) else {
            return Err(FormatError::UnexpectedEof { offset: pos });
        };
        pos += 1;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(FormatError::VarintTooLong { offset });
        }
    }

    Ok((result as u32, pos - offset))
}

fn take(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], FormatError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or(FormatError::UnexpectedEof { offset })
}

fn read_field(buf: &[u8], offset: usize) -> Result<(Field<'_>, usize), FormatError> {
    let (tag, tag_len) = read_varint(buf, offset)?;
    let wire_type = WireType::from_tag(tag, offset)?;
    let mut pos = offset + tag_len;

    let value = match wire_type {
        WireType::Varint => {
            let (value, len) = read_varint(buf, pos)?;
            pos += len;
            FieldValue::Varint(value)
        }
        WireType::Fixed64 => {
            let bytes = take(buf, pos, 8)?;
            pos += 8;
            FieldValue::Fixed64(bytes)
        }
        WireType::LengthDelimited => {
            let (len, prefix_len) = read_varint(buf, pos)?;
            pos += prefix_len;
            let bytes = take(buf, pos, len as usize)?;
            pos += bytes.len();
            FieldValue::LengthDelimited(bytes)
        }
        WireType::Fixed32 => {
            let bytes = take(buf, pos, 4)?;
            pos += 4;
            FieldValue::Fixed32(bytes)
        }
    };

    Ok((
        Field {
            number: tag >> 3,
            value,
        },
        pos,
    ))
}

/// Decode the flat field list of one message.
///
/// Parsing halts at the first field that cannot be read (unknown wire type,
/// truncated payload); the fields decoded up to that point are returned.
pub fn parse_message(buf: &[u8]) -> Vec<Field<'_>> {
    let mut fields = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        match read_field(buf, offset) {
            Ok((field, next)) => {
                fields.push(field);
                offset = next;
            }
            Err(e) => {
                tracing::trace!("field parse halted after {} fields: {}", fields.len(), e);
                break;
            }
        }
    }

    fields
}

/// Split a stream of varint-length-prefixed messages.
///
/// Returns the complete messages and the number of bytes they occupy. A
/// trailing message whose prefix or payload runs past the end of `buf` is not
/// consumed; the caller keeps `buf[consumed..]` and prepends it to the next
/// chunk.
pub fn split_length_delimited(buf: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let Ok((len, prefix_len)) = read_varint(buf, offset) else {
            break;
        };
        let Ok(message) = take(buf, offset + prefix_len, len as usize) else {
            break;
        };
        messages.push(message);
        offset += prefix_len + message.len();
    }

    (messages, offset)
}

/// Reassembles length-delimited frames across network chunks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and hand every frame completed by it to `on_frame`, in
    /// stream order. Returns the number of frames emitted.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_frame: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        self.pending.extend_from_slice(chunk);
        let (frames, consumed) = split_length_delimited(&self.pending);
        let count = frames.len();
        for frame in frames {
            on_frame(frame);
        }
        self.pending.drain(..consumed);
        count
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_read_varint_single_byte() {
        assert_eq!(read_varint(&[0x08], 0), Ok((8, 1)));
        assert_eq!(read_varint(&[0x00], 0), Ok((0, 1)));
    }

    #[test]
    fn test_read_varint_multi_byte_with_offset() {
        // 300 = 0b1_0010_1100
        let buf = [0xff, 0xac, 0x02];
        assert_eq!(read_varint(&buf, 1), Ok((300, 2)));
    }

    #[test]
    fn test_read_varint_truncates_to_low_32_bits() {
        let value: u64 = (1 << 40) | 0x1234_5678;
        let buf = varint(value);
        let (decoded, len) = read_varint(&buf, 0).unwrap();
        assert_eq!(decoded, 0x1234_5678);
        assert_eq!(len, buf.len());
    }

    #[test]
    fn test_read_varint_max_u64_is_accepted() {
        let buf = varint(u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_varint(&buf, 0), Ok((u32::MAX, 10)));
    }

    #[test]
    fn test_read_varint_too_long() {
        let buf = [0xffu8; 11];
        assert_eq!(
            read_varint(&buf, 0),
            Err(FormatError::VarintTooLong { offset: 0 })
        );
    }

    #[test]
    fn test_read_varint_unexpected_eof() {
        assert_eq!(
            read_varint(&[0x80, 0x80], 0),
            Err(FormatError::UnexpectedEof { offset: 2 })
        );
        assert!(read_varint(&[], 0).is_err());
    }

    #[test]
    fn test_parse_message_all_wire_types() {
        let mut buf = varint_field(1, 150);
        buf.extend(varint((2 << 3) | 1));
        buf.extend([1, 2, 3, 4, 5, 6, 7, 8]);
        buf.extend(bytes_field(3, b"hello"));
        buf.extend(varint((4 << 3) | 5));
        buf.extend([9, 9, 9, 9]);

        let fields = parse_message(&buf);
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].value, FieldValue::Varint(150));
        assert_eq!(fields[1].wire_type(), WireType::Fixed64);
        assert_eq!(fields[2].number, 3);
        assert_eq!(fields[2].value, FieldValue::LengthDelimited(b"hello"));
        assert_eq!(fields[3].value, FieldValue::Fixed32(&[9, 9, 9, 9]));
    }

    #[test]
    fn test_parse_message_halts_on_unknown_wire_type() {
        let mut buf = varint_field(1, 7);
        // field 2, wire type 3 (start group)
        buf.extend(varint((2 << 3) | 3));
        buf.extend(varint_field(3, 9));

        let fields = parse_message(&buf);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, FieldValue::Varint(7));
    }

    #[test]
    fn test_parse_message_halts_on_truncated_payload() {
        let mut buf = varint_field(1, 1);
        let mut truncated = bytes_field(2, b"abcdef");
        truncated.truncate(truncated.len() - 2);
        buf.extend(truncated);

        let fields = parse_message(&buf);
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_split_length_delimited_complete() {
        let mut buf = frame(b"abc");
        buf.extend(frame(b""));
        buf.extend(frame(b"xy"));

        let (messages, consumed) = split_length_delimited(&buf);
        assert_eq!(messages, vec![&b"abc"[..], &b""[..], &b"xy"[..]]);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_split_length_delimited_keeps_partial_tail() {
        let first = frame(b"abc");
        let mut buf = first.clone();
        buf.extend(frame(b"partial message"));
        buf.truncate(first.len() + 4);

        let (messages, consumed) = split_length_delimited(&buf);
        assert_eq!(messages.len(), 1);
        assert_eq!(consumed, first.len());
    }

    #[test]
    fn test_split_length_delimited_split_prefix() {
        // 200-byte payload needs a two byte prefix; cut after the first one
        let payload = vec![0u8; 200];
        let full = frame(&payload);
        let (messages, consumed) = split_length_delimited(&full[..1]);
        assert!(messages.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_frame_buffer_reassembles_across_chunks() {
        let mut stream = frame(b"one");
        stream.extend(frame(b"two"));
        stream.extend(frame(b"three"));

        let mut buffer = FrameBuffer::new();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        for chunk in stream.chunks(2) {
            buffer.push(chunk, |f| frames.push(f.to_vec()));
        }

        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(buffer.pending_len(), 0);
    }
}
