//! Debug dump of unknown NDGR structures.
//!
//! Used when a pointer entry matches no known schema, so the field layout can
//! be read from the logs.

use super::wire::{parse_message, split_length_delimited, Field, FieldValue, WireType};

const MAX_DEPTH: usize = 3;
const MAX_MESSAGES: usize = 5;

fn looks_printable(text: &str) -> bool {
    !text.is_empty()
        && text.chars().all(|c| {
            matches!(c,
                '\u{20}'..='\u{7e}'
                | '\u{80}'..='\u{24f}'
                | '\u{3000}'..='\u{9fff}'
                | '\u{ff00}'..='\u{ffef}')
        })
}

fn describe_field(field: &Field<'_>) -> String {
    let n = field.number;
    match field.value {
        FieldValue::Varint(v) => format!("f{n}={v}"),
        FieldValue::LengthDelimited(bytes) => {
            if bytes.len() < 200 {
                if let Ok(text) = std::str::from_utf8(bytes) {
                    if looks_printable(text) {
                        let preview: String = text.chars().take(60).collect();
                        return format!("f{n}=\"{preview}\"");
                    }
                }
            }
            format!("f{n}(l:{}b)", bytes.len())
        }
        FieldValue::Fixed64(bytes) => format!("f{n}(64:{}b)", bytes.len()),
        FieldValue::Fixed32(bytes) => format!("f{n}(32:{}b)", bytes.len()),
    }
}

fn dump_message(buf: &[u8], label: &str, depth: usize, out: &mut Vec<String>) {
    let fields = parse_message(buf);
    let described: Vec<String> = fields.iter().map(describe_field).collect();
    out.push(format!(
        "{}{}({}b): {}",
        "  ".repeat(depth),
        label,
        buf.len(),
        described.join(", ")
    ));
    if depth >= MAX_DEPTH {
        return;
    }

    for field in &fields {
        if field.wire_type() != WireType::LengthDelimited {
            continue;
        }
        let FieldValue::LengthDelimited(bytes) = field.value else {
            continue;
        };
        if bytes.len() > 2 && !parse_message(bytes).is_empty() {
            dump_message(bytes, &format!("f{}", field.number), depth + 1, out);
        }
    }
}

/// Recursively describe the messages in `chunk` (first five, three levels).
///
/// A chunk without length-delimited framing is dumped as a single raw message.
pub fn debug_fields(chunk: &[u8]) -> Vec<String> {
    let (messages, _) = split_length_delimited(chunk);
    let mut out = Vec::new();

    if messages.is_empty() {
        out.push(format!("[raw chunk {}b, no LD framing]", chunk.len()));
        dump_message(chunk, "raw", 0, &mut out);
        return out;
    }

    for (i, message) in messages.iter().take(MAX_MESSAGES).enumerate() {
        dump_message(message, &format!("msg[{i}]"), 0, &mut out);
    }
    if messages.len() > MAX_MESSAGES {
        out.push(format!(
            "... and {} more messages",
            messages.len() - MAX_MESSAGES
        ));
    }
    out
}

/// Describe a single, already split message.
pub fn describe_message(message: &[u8]) -> String {
    let mut out = Vec::new();
    dump_message(message, "entry", 0, &mut out);
    out.join(" | ")
}
