//! Task accounting snapshot returned by `Task::basic_info()`.

use std::time::Duration;

/// Seconds plus microseconds, as reported by `MACH_TASK_BASIC_INFO`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeValue
{
    pub seconds: i32,
    pub microseconds: i32,
}

impl TimeValue
{
    #[must_use]
    pub const fn new(seconds: i32, microseconds: i32) -> Self
    {
        Self { seconds, microseconds }
    }

    /// Convert to a [`Duration`]; negative components clamp to zero.
    #[must_use]
    pub fn as_duration(&self) -> Duration
    {
        let seconds = u64::try_from(self.seconds).unwrap_or(0);
        let micros = u64::try_from(self.microseconds).unwrap_or(0);
        Duration::from_secs(seconds) + Duration::from_micros(micros)
    }
}

/// Accounting information for an attached task.
///
/// `suspend_count` is the task-level suspend count, not the sum over threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskBasicInfo
{
    pub suspend_count: i32,
    pub virtual_size: u64,
    pub resident_size: u64,
    pub user_time: TimeValue,
    pub system_time: TimeValue,
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn time_value_converts_to_duration()
    {
        assert_eq!(TimeValue::new(2, 500_000).as_duration(), Duration::from_millis(2500));
        assert_eq!(TimeValue::new(-1, -1).as_duration(), Duration::ZERO);
    }
}
