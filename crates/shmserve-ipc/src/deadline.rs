use std::time::{Duration, Instant};

/// Absolute point in time by which a blocking wait must give up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(self) -> Instant {
        self.0
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(self) -> Option<Duration> {
        self.0
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }

    pub fn is_expired(self) -> bool {
        self.remaining().is_none()
    }

    /// This deadline pushed out by `grace`, for waits that must outlast a
    /// peer that is itself honoring `self`.
    pub fn extended(self, grace: Duration) -> Self {
        Self(self.0 + grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_has_no_remaining_time() {
        let d = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(d.is_expired());
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn future_deadline_counts_down() {
        let d = Deadline::after(Duration::from_secs(60));
        let left = d.remaining().unwrap();
        assert!(left <= Duration::from_secs(60));
        assert!(left > Duration::from_secs(59));
        assert!(d.extended(Duration::from_secs(1)) > d);
    }
}
