use chrono::{DateTime, FixedOffset, Local};

/// Wall-clock source in the station's local timezone.
///
/// Attendance dates are calendar days where the station stands, so every
/// timestamp carries the local offset.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Clock pinned to one instant.
#[cfg(test)]
pub struct FixedClock(pub DateTime<FixedOffset>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}
