//! Kernel services consumed by the stack
//!
//! - `WaitOption`: how long a service may suspend the calling thread
//! - `EventFlags`: the helper thread's wake-up word, safe to set from any context
//! - `SuspensionList`: threads parked on a correlation key

pub mod event;
pub mod suspend;

use std::time::Duration;

pub use event::{EventFlags, IpEvents};
pub use suspend::{SuspensionList, WaitHandle};

/// Suspension policy of a blocking service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOption {
    /// Return immediately with a status
    NoWait,
    /// Suspend until the condition is met
    Forever,
    /// Suspend for at most the given time
    Timeout(Duration),
}

impl WaitOption {
    pub fn is_no_wait(&self) -> bool {
        matches!(self, WaitOption::NoWait)
    }

    pub fn from_millis(ms: u64) -> Self {
        WaitOption::Timeout(Duration::from_millis(ms))
    }
}
