use std::time::{Duration, Instant};

/// Invalidate a prefetch after 0.1sec
pub const DEFAULT_PREFETCH_TTL: Duration = Duration::from_millis(100);

/// State of request prefetching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefetch {
    /// No prefetch
    None,
    /// Something touched the EC since, ignore whatever was prefetched
    Junk,
    /// Row with these anchors was requested at `at`
    Fetched { arg0: u8, arg_f: u8, at: Instant },
}

/// Single-entry cache remembering the most recent prefetch.
///
/// To keep things simple only the first and last args are compared;
/// in practice this suffices.
#[derive(Debug)]
pub struct PrefetchCache {
    state: Prefetch,
    ttl: Duration,
}

impl PrefetchCache {
    /// Starts out as junk: nobody knows what the EC did before we got here
    pub fn new(ttl: Duration) -> Self {
        PrefetchCache {
            state: Prefetch::Junk,
            ttl,
        }
    }

    /// Is the row with these anchors currently prefetched and still fresh?
    pub fn is_fetched(&self, arg0: u8, arg_f: u8) -> bool {
        match self.state {
            Prefetch::Fetched {
                arg0: a0,
                arg_f: af,
                at,
            } => a0 == arg0 && af == arg_f && at.elapsed() < self.ttl,
            Prefetch::None | Prefetch::Junk => false,
        }
    }

    /// Whether no request at all is outstanding.
    /// Used to tell a stray pending readout apart from an unread prefetch.
    pub fn is_none(&self) -> bool {
        self.state == Prefetch::None
    }

    pub fn store(&mut self, arg0: u8, arg_f: u8) {
        self.state = Prefetch::Fetched {
            arg0,
            arg_f,
            at: Instant::now(),
        };
    }

    /// The prefetched row was read, it can't be read twice
    pub fn consume(&mut self) {
        self.state = Prefetch::None;
    }

    pub fn invalidate(&mut self) {
        self.state = Prefetch::Junk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_as_junk() {
        let cache = PrefetchCache::new(DEFAULT_PREFETCH_TTL);
        assert!(!cache.is_none());
        assert!(!cache.is_fetched(0x01, 0x01));
    }

    #[test]
    fn matches_both_anchors() {
        let mut cache = PrefetchCache::new(DEFAULT_PREFETCH_TTL);
        cache.store(0x11, 0x01);
        assert!(cache.is_fetched(0x11, 0x01));
        assert!(!cache.is_fetched(0x11, 0x00));
        assert!(!cache.is_fetched(0x10, 0x01));
    }

    #[test]
    fn second_store_evicts_first() {
        let mut cache = PrefetchCache::new(DEFAULT_PREFETCH_TTL);
        cache.store(0x11, 0x01);
        cache.store(0x13, 0x01);
        assert!(!cache.is_fetched(0x11, 0x01));
        assert!(cache.is_fetched(0x13, 0x01));
    }

    #[test]
    fn expires_after_ttl() {
        let mut cache = PrefetchCache::new(Duration::from_millis(5));
        cache.store(0x11, 0x01);
        thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_fetched(0x11, 0x01));
    }

    #[test]
    fn consume_and_invalidate() {
        let mut cache = PrefetchCache::new(DEFAULT_PREFETCH_TTL);
        cache.store(0x11, 0x01);
        cache.consume();
        assert!(cache.is_none());
        assert!(!cache.is_fetched(0x11, 0x01));

        cache.store(0x11, 0x01);
        cache.invalidate();
        assert!(!cache.is_none());
        assert!(!cache.is_fetched(0x11, 0x01));
    }
}
