use std::time::Duration;

/// 再接続の指数バックオフ
///
/// `next_delay` を呼ぶたびに待ち時間が倍になり、上限で頭打ちになる。
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// 次の待ち時間を返し、その次の分を倍にする
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// 次に返す待ち時間
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// 最小値に戻す
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::new(Duration::from_secs(3), Duration::from_secs(60))
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = default_backoff();
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(6));
        assert_eq!(backoff.next_delay(), Duration::from_secs(12));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff = default_backoff();
        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[4], Duration::from_secs(48));
        assert_eq!(delays[5], Duration::from_secs(60));
        assert_eq!(delays[6], Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = default_backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }
}
