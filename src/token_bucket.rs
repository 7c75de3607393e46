use std::time::Duration;
use tokio::time::Instant;

/// Token bucket for a single rate-limit subject.
///
/// Uses tokio's clock so paused-time tests can drive refill deterministically.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    /// New buckets start full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Deducts `cost` tokens if available. A denied call deducts nothing.
    pub fn try_consume(&mut self, cost: u32) -> bool {
        self.refill();
        self.last_seen = Instant::now();

        if self.tokens >= cost as f64 {
            self.tokens -= cost as f64;
            true
        } else {
            false
        }
    }

    /// Returns tokens taken by a request that was later denied elsewhere.
    pub fn refund(&mut self, cost: u32) {
        self.tokens = (self.tokens + cost as f64).min(self.capacity as f64);
    }

    pub fn available_tokens(&mut self) -> u32 {
        self.refill();
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.last_seen)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed.is_zero() {
            return;
        }

        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
        // Never exceed capacity
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Time until `required_tokens` could be granted, or `None` if they already can.
    pub fn time_until_available(&mut self, required_tokens: u32) -> Option<Duration> {
        self.refill();

        if self.tokens >= required_tokens as f64 {
            return None;
        }

        if self.refill_rate <= 0.0 || required_tokens > self.capacity {
            return Some(Duration::MAX);
        }

        let tokens_needed = required_tokens as f64 - self.tokens;
        Some(Duration::try_from_secs_f64(tokens_needed / self.refill_rate).unwrap_or(Duration::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_creation() {
        let bucket = TokenBucket::new(10, 2.0);
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.refill_rate(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_consumption() {
        let mut bucket = TokenBucket::new(10, 2.0);
        assert!(bucket.try_consume(5));
        assert_eq!(bucket.available_tokens(), 5);
        assert!(bucket.try_consume(5));
        assert_eq!(bucket.available_tokens(), 0);
        assert!(!bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_consume_deducts_nothing() {
        let mut bucket = TokenBucket::new(3, 1.0);
        assert!(bucket.try_consume(2));
        assert!(!bucket.try_consume(2));
        assert_eq!(bucket.available_tokens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_overflow_prevention() {
        let mut bucket = TokenBucket::new(5, 1000.0);
        bucket.try_consume(3);

        tokio::time::advance(Duration::from_millis(10)).await;

        // Even with a high refill rate, tokens never exceed capacity
        assert_eq!(bucket.available_tokens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_is_capped() {
        let mut bucket = TokenBucket::new(2, 0.0);
        assert!(bucket.try_consume(1));
        bucket.refund(5);
        assert_eq!(bucket.available_tokens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_available() {
        let mut bucket = TokenBucket::new(4, 2.0);
        assert!(bucket.try_consume(4));
        assert_eq!(bucket.time_until_available(1), Some(Duration::from_millis(500)));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(bucket.time_until_available(1), None);

        let mut frozen = TokenBucket::new(1, 0.0);
        assert!(frozen.try_consume(1));
        assert_eq!(frozen.time_until_available(1), Some(Duration::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_saturates_wait() {
        let mut bucket = TokenBucket::new(1, f64::MIN_POSITIVE);
        assert!(bucket.try_consume(1));
        assert_eq!(bucket.time_until_available(1), Some(Duration::MAX));
    }
}
