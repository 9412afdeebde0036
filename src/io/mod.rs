//! 受信したコメントと状態のファイル出力

pub mod ndjson;

pub use ndjson::{parse_ndjson_file, NdjsonError, NdjsonWriter, OutputRecord, TimestampedEntry};
