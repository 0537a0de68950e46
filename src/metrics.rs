use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

/// Live engine buffers above which the leak audit fires
pub const LIVE_BUFFER_HARD_LIMIT: usize = 4096;

static BUFFERS_LEASED: AtomicUsize = AtomicUsize::new(0);
static BUFFERS_RELEASED: AtomicUsize = AtomicUsize::new(0);
static BUFFERS_ORPHANED: AtomicUsize = AtomicUsize::new(0);

/// Counts of engine buffers handed out and returned
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferMetrics {
    pub leased: usize,
    /// Returned to a live context
    pub released: usize,
    /// Dropped after their context had closed and freed them
    pub orphaned: usize,
}

impl BufferMetrics {
    #[must_use]
    pub fn live(&self) -> usize {
        self.leased
            .saturating_sub(self.released)
            .saturating_sub(self.orphaned)
    }
}

#[must_use]
pub fn snapshot() -> BufferMetrics {
    BufferMetrics {
        leased: BUFFERS_LEASED.load(Ordering::Relaxed),
        released: BUFFERS_RELEASED.load(Ordering::Relaxed),
        orphaned: BUFFERS_ORPHANED.load(Ordering::Relaxed),
    }
}

fn audit_live_buffers() {
    let metrics = snapshot();
    let live = metrics.live();

    if live > LIVE_BUFFER_HARD_LIMIT {
        if cfg!(debug_assertions) && !std::thread::panicking() {
            panic!(
                "Buffer leak audit failed: live={live}, limit={LIVE_BUFFER_HARD_LIMIT}, leased={}, released={}, orphaned={}",
                metrics.leased, metrics.released, metrics.orphaned
            );
        } else {
            warn!(
                "Buffer leak audit warning: live={} limit={} leased={} released={} orphaned={}",
                live, LIVE_BUFFER_HARD_LIMIT, metrics.leased, metrics.released, metrics.orphaned
            );
        }
    }
}

pub(crate) fn record_lease() {
    BUFFERS_LEASED.fetch_add(1, Ordering::Relaxed);
    audit_live_buffers();
}

pub(crate) fn record_release() {
    BUFFERS_RELEASED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_orphaned() {
    BUFFERS_ORPHANED.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_count_never_underflows() {
        let m = BufferMetrics {
            leased: 2,
            released: 3,
            orphaned: 1,
        };
        assert_eq!(m.live(), 0);
        let m = BufferMetrics {
            leased: 10,
            released: 4,
            orphaned: 1,
        };
        assert_eq!(m.live(), 5);
    }
}
