use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Global emergency-stop latch.
///
/// Engaging it halts new order flow system-wide: the risk engine rejects all
/// signals, the order manager cancels live orders, and the strategy host
/// suppresses signal emission. Only an explicit operator reset clears it.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    engaged: Arc<AtomicBool>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the stop. Returns `true` if this call engaged it (it was not
    /// already latched).
    pub fn engage(&self) -> bool {
        !self.engaged.swap(true, Ordering::SeqCst)
    }

    /// Operator action: clear the latch.
    pub fn reset(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_latches_once() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_engaged());
        assert!(stop.engage());
        assert!(!stop.engage()); // already latched
        assert!(stop.is_engaged());
    }

    #[test]
    fn reset_clears() {
        let stop = EmergencyStop::new();
        stop.engage();
        stop.reset();
        assert!(!stop.is_engaged());
    }

    #[test]
    fn clones_share_state() {
        let stop = EmergencyStop::new();
        let other = stop.clone();
        stop.engage();
        assert!(other.is_engaged());
    }
}
