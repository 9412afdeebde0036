//! NDJSON (Newline Delimited JSON) 形式の記録
//!
//! 1 行に 1 つ、受信時刻付きのレコードを書き出す。

use crate::bridge::{BridgeComment, BridgeState};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NdjsonError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error at line {line}: {source}")]
    JsonParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 受信時刻付きのエントリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEntry<T> {
    /// 受信時の unix 秒
    pub timestamp: u64,
    pub data: T,
}

/// 出力レコード
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputRecord<'a> {
    Comment(&'a BridgeComment),
    State(&'a BridgeState),
}

/// NDJSON ファイルへの書き込み
pub struct NdjsonWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl NdjsonWriter {
    /// ファイルを開く。`append` が偽なら既存の内容を捨てる
    pub fn create(path: impl AsRef<Path>, append: bool) -> Result<Self, NdjsonError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        tracing::info!("📁 Writing NDJSON to {}", path.display());

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// 現在時刻を付けて 1 行書き込む
    pub fn write_entry<T: Serialize>(&mut self, data: &T) -> Result<(), NdjsonError> {
        let timestamp = u64::try_from(crate::utils::unix_now()).unwrap_or_default();
        self.write_timestamped(&TimestampedEntry { timestamp, data })
    }

    pub fn write_timestamped<T: Serialize>(
        &mut self,
        entry: &TimestampedEntry<T>,
    ) -> Result<(), NdjsonError> {
        let line = serde_json::to_string(entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        // 途中で落ちても行単位で残るように毎回 flush する
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 受信時刻付きエントリの NDJSON ファイルを読み込む
///
/// 空行は読み飛ばす。
pub fn parse_ndjson_file<T>(path: impl AsRef<Path>) -> Result<Vec<TimestampedEntry<T>>, NdjsonError>
where
    T: for<'de> Deserialize<'de>,
{
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let entry = serde_json::from_str(&line).map_err(|e| NdjsonError::JsonParse {
            line: line_number + 1,
            source: e,
        })?;
        entries.push(entry);
    }

    Ok(entries)
}
