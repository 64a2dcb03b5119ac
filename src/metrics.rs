use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters updated from session tasks without further
/// synchronisation, mirroring the four observability signals this server
/// commits to: live connections, accepted messages, protocol warnings, and
/// hard errors.
pub struct Metrics {
    pub connections_current: AtomicU64,
    pub received_total: AtomicU64,
    pub warns_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            connections_current: AtomicU64::new(0),
            received_total: AtomicU64::new(0),
            warns_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn received(&self, count: u64) {
        self.received_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn warn(&self) {
        self.warns_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_gauge_tracks_opens_and_closes() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.connections_current.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.received(3);
        metrics.warn();
        metrics.error();
        assert_eq!(metrics.received_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.warns_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 1);
    }
}
