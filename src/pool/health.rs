//! Edge-triggered health flag shared by both pool kinds.

use crate::error::Error;

/// Tri-state health: unknown until the first report, then healthy or not.
///
/// Only transitions are reported so that observers are not flooded with
/// repeats of the same state.
#[derive(Debug, Clone, Default)]
pub struct HealthLatch {
    healthy: Option<bool>,
    last_error: Option<Error>,
}

impl HealthLatch {
    pub fn get(&self) -> Option<bool> {
        self.healthy
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Back to unknown, without reporting.
    pub fn reset(&mut self) {
        self.healthy = None;
        self.last_error = None;
    }

    /// Record `healthy`; returns whether the value flipped.
    pub fn set(&mut self, healthy: bool, error: Option<&Error>) -> bool {
        if !healthy {
            self.last_error = error.cloned();
        }
        if self.healthy == Some(healthy) {
            return false;
        }
        self.healthy = Some(healthy);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transitions_are_reported() {
        let mut latch = HealthLatch::default();
        assert_eq!(latch.get(), None);
        assert!(latch.set(true, None));
        assert!(!latch.set(true, None));
        assert!(latch.set(false, Some(&Error::closed())));
        assert!(!latch.set(false, None));
        assert_eq!(latch.get(), Some(false));

        latch.reset();
        assert_eq!(latch.get(), None);
        assert!(latch.last_error().is_none());
        assert!(latch.set(false, None));
    }
}
