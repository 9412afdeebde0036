//! Field-number tables for the NDGR messages this crate understands.
//!
//! The format is unversioned and was recovered from live traffic, so each
//! message kind is kept as a small table of constants instead of generated
//! bindings. Fields not listed here are skipped by the decoder.

/// Segment payload envelope (`ChunkedMessage`).
///
/// | no | field | shape |
/// |----|-------|-------|
/// | 1 | meta | [`meta`] |
/// | 2 | message | [`nicolive_message`], repeated |
/// | 4 | state | [`state`] |
/// | 5 | signal | varint (heartbeat) |
pub mod chunked_message {
    pub const META: u32 = 1;
    pub const MESSAGE: u32 = 2;
    pub const STATE: u32 = 4;
    pub const SIGNAL: u32 = 5;
}

/// `ChunkedMessage.meta`
pub mod meta {
    pub const ID: u32 = 1;
    /// `google.protobuf.Timestamp`
    pub const AT: u32 = 2;
}

/// `google.protobuf.Timestamp`. Some servers send a bare varint instead.
pub mod timestamp {
    pub const SECONDS: u32 = 1;
    pub const NANOS: u32 = 2;
}

/// `NicoliveMessage`; only the chat variant is decoded.
pub mod nicolive_message {
    pub const CHAT: u32 = 1;
}

/// `Chat`
///
/// | no | field | shape |
/// |----|-------|-------|
/// | 1 | content | string |
/// | 3 | no | varint |
/// | 6 | user id | string |
/// | 7 | account status | varint, 1 = premium |
/// | 8 | vpos | varint, 1/100 s |
pub mod chat {
    pub const CONTENT: u32 = 1;
    pub const NO: u32 = 3;
    pub const USER_ID: u32 = 6;
    pub const ACCOUNT_STATUS: u32 = 7;
    pub const VPOS: u32 = 8;

    pub const ACCOUNT_STATUS_PREMIUM: u32 = 1;
}

/// `ChunkedMessage.state` (statistics, flat)
pub mod state {
    pub const VIEWERS: u32 = 1;
    pub const COMMENTS: u32 = 2;
}

/// Pointer stream entry (`ChunkedEntry`, a oneof).
///
/// | no | field | shape |
/// |----|-------|-------|
/// | 1 | segment | [`message_segment`], currently open |
/// | 2 | backward | history, ignored for live |
/// | 3 | previous | [`message_segment`], recently closed |
/// | 4 | next | [`ready_for_next`] |
pub mod chunked_entry {
    pub const SEGMENT: u32 = 1;
    pub const BACKWARD: u32 = 2;
    pub const PREVIOUS: u32 = 3;
    pub const NEXT: u32 = 4;
}

/// `MessageSegment`
pub mod message_segment {
    pub const FROM: u32 = 1;
    pub const UNTIL: u32 = 2;
    pub const URI: u32 = 3;
}

/// `ReadyForNext`: field 1 is either a URI string or a timestamp.
pub mod ready_for_next {
    pub const AT: u32 = 1;
}
