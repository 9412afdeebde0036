//! 重複排除・レート制限
//!
//! 1 セッション専用の状態。判定は次の順で行う:
//!
//! 1. システムコメント (空文字列・`/` で始まる) を除外
//! 2. 既出のコメント番号を除外 (番号 0 は対象外)
//! 3. 自分が最近投稿した本文 (エコー) を除外
//! 4. 古すぎるコメント (過去セグメントの補完データ) を除外
//! 5. 1 秒あたりの上限を超えた分を除外
//!
//! レートのカウントは受理したコメントだけが消費する。

use crate::api::ndgr::{DecodedComment, SegmentDescriptor};
use crate::config::BridgeConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// 上限付きの挿入順セット
///
/// 上限を超えると古いものから捨てる。
#[derive(Debug, Clone)]
pub struct BoundedSet<T> {
    items: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
    evict_half: bool,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    /// 上限超過時に最古の 1 件を捨てる
    pub fn evict_oldest(capacity: usize) -> Self {
        Self::with_policy(capacity, false)
    }

    /// 上限超過時に古い半分をまとめて捨てる
    pub fn evict_oldest_half(capacity: usize) -> Self {
        Self::with_policy(capacity, true)
    }

    fn with_policy(capacity: usize, evict_half: bool) -> Self {
        Self {
            items: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            evict_half,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// 追加する。既にあれば `false`
    pub fn insert(&mut self, item: T) -> bool {
        if !self.items.insert(item.clone()) {
            return false;
        }
        self.order.push_back(item);

        if self.order.len() > self.capacity {
            let evict = if self.evict_half {
                self.order.len() / 2
            } else {
                self.order.len() - self.capacity
            };
            for old in self.order.drain(..evict) {
                self.items.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
    }
}

/// コメント判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CommentVerdict {
    #[display("accepted")]
    Accepted,
    #[display("system")]
    System,
    #[display("duplicate")]
    Duplicate,
    #[display("echo")]
    Echo,
    #[display("stale")]
    Stale,
    #[display("rate-limited")]
    RateLimited,
}

/// セグメント判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SegmentVerdict {
    #[display("fetch")]
    Fetch,
    /// 終了から時間が経ちすぎている
    #[display("stale")]
    Stale,
    /// 取得済みの終了セグメント
    #[display("duplicate")]
    Duplicate,
}

/// 重複排除・レート制限の台帳
#[derive(Debug)]
pub struct Ledger {
    seen_comments: BoundedSet<u32>,
    seen_segments: BoundedSet<String>,
    sent_texts: HashMap<String, Instant>,
    sent_order: VecDeque<String>,
    echo_ttl: Duration,
    echo_capacity: usize,
    max_per_second: u32,
    window_start: Option<Instant>,
    window_count: u32,
    max_comment_age_secs: i64,
    max_segment_age_secs: i64,
    segments_fetched: u64,
}

impl Ledger {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            seen_comments: BoundedSet::evict_oldest_half(config.seen_comment_capacity),
            seen_segments: BoundedSet::evict_oldest(config.seen_segment_capacity),
            sent_texts: HashMap::new(),
            sent_order: VecDeque::new(),
            echo_ttl: config.echo_ttl(),
            echo_capacity: config.echo_capacity.max(1),
            max_per_second: config.max_comments_per_second,
            window_start: None,
            window_count: 0,
            max_comment_age_secs: config.max_comment_age_secs,
            max_segment_age_secs: config.max_segment_age_secs,
            segments_fetched: 0,
        }
    }

    /// コメントを転送してよいか
    pub fn should_accept(&mut self, comment: &DecodedComment) -> bool {
        self.check_comment(comment, Instant::now(), chrono::Utc::now().timestamp())
            == CommentVerdict::Accepted
    }

    /// 時刻を指定して判定する (`now_unix` は unix 秒)
    pub fn check_comment(
        &mut self,
        comment: &DecodedComment,
        now: Instant,
        now_unix: i64,
    ) -> CommentVerdict {
        if comment.content.is_empty() || comment.content.starts_with('/') {
            return CommentVerdict::System;
        }

        if comment.no > 0 && !self.seen_comments.insert(comment.no) {
            return CommentVerdict::Duplicate;
        }

        self.expire_sent(now);
        if self.sent_texts.contains_key(&comment.content) {
            return CommentVerdict::Echo;
        }

        let age = comment.posted_at.map(|t| now_unix - t).unwrap_or(0);
        if age > self.max_comment_age_secs {
            return CommentVerdict::Stale;
        }

        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < RATE_WINDOW => {}
            _ => {
                self.window_start = Some(now);
                self.window_count = 0;
            }
        }
        if self.window_count >= self.max_per_second {
            return CommentVerdict::RateLimited;
        }
        self.window_count += 1;

        CommentVerdict::Accepted
    }

    /// セグメントを取得すべきか
    pub fn should_fetch_segment(&mut self, segment: &SegmentDescriptor) -> bool {
        self.check_segment(segment, chrono::Utc::now().timestamp()) == SegmentVerdict::Fetch
    }

    /// 時刻を指定して判定する。終了済みセグメントは取得扱いで記録する
    pub fn check_segment(&mut self, segment: &SegmentDescriptor, now_unix: i64) -> SegmentVerdict {
        if segment.is_live(now_unix) {
            self.segments_fetched += 1;
            return SegmentVerdict::Fetch;
        }

        if segment
            .age(now_unix)
            .is_some_and(|age| age > self.max_segment_age_secs)
        {
            return SegmentVerdict::Stale;
        }

        if !self.seen_segments.insert(segment.uri.clone()) {
            return SegmentVerdict::Duplicate;
        }

        self.segments_fetched += 1;
        SegmentVerdict::Fetch
    }

    /// 自分の投稿を記録する (エコー抑制用)
    pub fn record_sent(&mut self, text: &str) {
        self.record_sent_at(text, Instant::now());
    }

    pub fn record_sent_at(&mut self, text: &str, now: Instant) {
        self.expire_sent(now);
        if self.sent_texts.insert(text.to_string(), now).is_none() {
            self.sent_order.push_back(text.to_string());
        }

        while self.sent_order.len() > self.echo_capacity {
            if let Some(oldest) = self.sent_order.pop_front() {
                self.sent_texts.remove(&oldest);
            }
        }
    }

    fn expire_sent(&mut self, now: Instant) {
        let ttl = self.echo_ttl;
        let before = self.sent_texts.len();
        self.sent_texts
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) <= ttl);
        if self.sent_texts.len() != before {
            let sent_texts = &self.sent_texts;
            self.sent_order.retain(|text| sent_texts.contains_key(text));
        }
    }

    /// ストリーム開始時に既出セットを空にする
    pub fn reset_stream_state(&mut self) {
        self.seen_comments.clear();
        self.seen_segments.clear();
        self.segments_fetched = 0;
    }

    /// 既出コメント番号の数
    pub fn unique_comment_count(&self) -> usize {
        self.seen_comments.len()
    }

    /// 取得対象にしたセグメント数
    pub fn segments_fetched(&self) -> u64 {
        self.segments_fetched
    }

    pub fn echo_len(&self) -> usize {
        self.sent_texts.len()
    }
}
