//! NDGR (ニコ生コメント配信) デコーダー
//!
//! コメントは Length-Delimited 形式の独自バイナリで配信される。スキーマは公開されていないため、
//! [`wire`] の手書きパーサーでフィールドを読み、[`schema`] の番号表で意味を割り当てる。
//! 壊れたフィールドやメッセージは読み飛ばし、ストリーム全体を止めることはない。

pub mod dump;
pub mod schema;
pub mod wire;

use serde::{Deserialize, Serialize};
use wire::{Field, FieldValue, FrameBuffer};

pub use wire::{parse_message, read_varint, split_length_delimited, FormatError};

/// デコード済みコメント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedComment {
    /// コメント番号 (0 = 番号なし)
    pub no: u32,
    /// 本文
    pub content: String,
    pub user_id: Option<String>,
    /// 投稿時刻 (unix 秒)
    pub posted_at: Option<i64>,
    /// 再生位置 (1/100 秒)
    pub vpos: Option<u32>,
    pub premium: Option<bool>,
}

/// 視聴者数・コメント数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub viewers: u32,
    pub comments: u32,
}

/// セグメント1メッセージ分のデコード結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkedMessage {
    pub comments: Vec<DecodedComment>,
    pub statistics: Option<Statistics>,
}

impl ChunkedMessage {
    fn merge(&mut self, other: ChunkedMessage) {
        self.comments.extend(other.comments);
        if other.statistics.is_some() {
            self.statistics = other.statistics;
        }
    }
}

/// ネットワークチャンク1つ分のデコード結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdgrChunk<'a> {
    pub comments: Vec<DecodedComment>,
    pub statistics: Option<Statistics>,
    /// 未消費バイト。次のチャンクの先頭に連結する
    pub leftover: &'a [u8],
}

/// セグメントの出所
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSource {
    /// field 1: 配信中のセグメント
    Open,
    /// field 3: 直近に閉じたセグメント
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub uri: String,
    /// 開始時刻 (unix 秒)
    pub from: Option<i64>,
    /// 終了時刻 (unix 秒)
    pub until: Option<i64>,
    pub source: SegmentSource,
}

impl SegmentDescriptor {
    /// `now` の時点でまだデータが流れてくる可能性があるか
    pub fn is_live(&self, now: i64) -> bool {
        match self.until {
            Some(until) => now < until,
            None => self.from.is_some(),
        }
    }

    /// 終了時刻からの経過秒数
    pub fn age(&self, now: i64) -> Option<i64> {
        self.until.map(|until| now - until)
    }
}

/// 次のポインタ要求先
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum NextPointer {
    #[display("uri={_0}")]
    Uri(String),
    #[display("at={_0}")]
    At(i64),
}

/// ポインタストリームの1エントリ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewEntry {
    pub segment: Option<SegmentDescriptor>,
    pub next: Option<NextPointer>,
}

/// パース済みフィールド列。番号で引く。
struct FieldView<'a>(Vec<Field<'a>>);

impl<'a> FieldView<'a> {
    fn parse(buf: &'a [u8]) -> Self {
        Self(parse_message(buf))
    }

    fn first(&self, number: u32) -> Option<&Field<'a>> {
        self.0.iter().find(|f| f.number == number)
    }

    fn all(&self, number: u32) -> impl Iterator<Item = &Field<'a>> + '_ {
        self.0.iter().filter(move |f| f.number == number)
    }

    fn varint(&self, number: u32) -> Option<u32> {
        match self.first(number)?.value {
            FieldValue::Varint(v) => Some(v),
            _ => None,
        }
    }

    fn bytes(&self, number: u32) -> Option<&'a [u8]> {
        match self.first(number)?.value {
            FieldValue::LengthDelimited(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn string(&self, number: u32) -> Option<String> {
        self.bytes(number)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn message(&self, number: u32) -> Option<FieldView<'a>> {
        self.bytes(number).map(FieldView::parse)
    }

    /// Timestamp メッセージ、または素の varint を unix 秒として読む
    fn timestamp(&self, number: u32) -> Option<i64> {
        match self.first(number)?.value {
            FieldValue::Varint(v) => Some(i64::from(v)),
            FieldValue::LengthDelimited(bytes) => FieldView::parse(bytes)
                .varint(schema::timestamp::SECONDS)
                .map(i64::from),
            _ => None,
        }
    }
}

/// セグメントの `ChunkedMessage` を1つデコードする。未知のフィールドは無視。
pub fn decode_chunked_message(buf: &[u8]) -> ChunkedMessage {
    use schema::{chat, chunked_message, meta, nicolive_message, state};

    let fields = FieldView::parse(buf);
    let mut result = ChunkedMessage::default();

    let posted_at = fields
        .message(chunked_message::META)
        .and_then(|m| m.timestamp(meta::AT));

    for field in fields.all(chunked_message::MESSAGE) {
        let FieldValue::LengthDelimited(payload) = field.value else {
            continue;
        };
        let Some(chat_fields) = FieldView::parse(payload).message(nicolive_message::CHAT) else {
            continue;
        };
        let Some(content) = chat_fields.string(chat::CONTENT).filter(|c| !c.is_empty()) else {
            continue;
        };

        result.comments.push(DecodedComment {
            no: chat_fields.varint(chat::NO).unwrap_or(0),
            content,
            user_id: chat_fields.string(chat::USER_ID),
            posted_at,
            vpos: chat_fields.varint(chat::VPOS),
            premium: chat_fields
                .varint(chat::ACCOUNT_STATUS)
                .map(|s| s == chat::ACCOUNT_STATUS_PREMIUM),
        });
    }

    if let Some(state_fields) = fields.message(chunked_message::STATE) {
        if let Some(viewers) = state_fields.varint(state::VIEWERS) {
            result.statistics = Some(Statistics {
                viewers,
                comments: state_fields.varint(state::COMMENTS).unwrap_or(0),
            });
        }
    }

    result
}

/// 生のネットワークチャンクを分割・デコードする
///
/// 末尾の不完全なメッセージは `leftover` として返す。呼び出し側は次のチャンクの前に連結すること。
pub fn decode_ndgr_stream(chunk: &[u8]) -> NdgrChunk<'_> {
    let (messages, consumed) = split_length_delimited(chunk);
    let mut combined = ChunkedMessage::default();
    for message in messages {
        combined.merge(decode_chunked_message(message));
    }

    NdgrChunk {
        comments: combined.comments,
        statistics: combined.statistics,
        leftover: &chunk[consumed..],
    }
}

/// セグメントのバイトストリームを逐次デコードする
///
/// 到着したチャンクを [`feed`](Self::feed) するたびに、完成したメッセージ分のコメントを返す。
#[derive(Debug, Default)]
pub struct NdgrStreamDecoder {
    frames: FrameBuffer,
}

impl NdgrStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> ChunkedMessage {
        let mut combined = ChunkedMessage::default();
        self.frames
            .push(chunk, |frame| combined.merge(decode_chunked_message(frame)));
        combined
    }

    /// 次のチャンク待ちのバイト数
    pub fn pending_len(&self) -> usize {
        self.frames.pending_len()
    }
}

/// URI らしい文字列か (`ReadyForNext.at` の Timestamp と区別するため)
fn as_uri(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    text.contains("://").then(|| text.to_string())
}

/// ポインタストリームの1メッセージをパースする
///
/// field 1 (配信中セグメント) を優先し、無ければ field 3 (完了済みセグメント) を見る。
/// field 4 は次ポインタ。どれも無ければ `None` (呼び出し側はログを出して読み飛ばす)。
pub fn parse_single_view_entry(message: &[u8]) -> Option<ViewEntry> {
    use schema::{chunked_entry, message_segment, ready_for_next};

    let fields = FieldView::parse(message);
    let mut entry = ViewEntry::default();

    let segment = match fields.message(chunked_entry::SEGMENT) {
        Some(seg) => Some((seg, SegmentSource::Open)),
        None => fields
            .message(chunked_entry::PREVIOUS)
            .map(|seg| (seg, SegmentSource::Closed)),
    };
    if let Some((seg, source)) = segment {
        if let Some(uri) = seg.string(message_segment::URI).filter(|u| !u.is_empty()) {
            entry.segment = Some(SegmentDescriptor {
                uri,
                from: seg.timestamp(message_segment::FROM),
                until: seg.timestamp(message_segment::UNTIL),
                source,
            });
        }
    }

    if let Some(next) = fields.message(chunked_entry::NEXT) {
        entry.next = match next.bytes(ready_for_next::AT).and_then(as_uri) {
            Some(uri) => Some(NextPointer::Uri(uri)),
            None => next.timestamp(ready_for_next::AT).map(NextPointer::At),
        };
    }

    (entry.segment.is_some() || entry.next.is_some()).then_some(entry)
}
