//! Operation priority.

use std::ops::Add;

/// The priority an operation is admitted at by [`crate::queue::PriorityQueue`].
///
/// Higher values are admitted first; among equal priorities, admission is
/// FIFO. `HttpScheduler::schedule` adds a caller-supplied priority to
/// `HttpSchedulerOptions::priority_base` before enqueuing (spec step 4.2.4),
/// so arithmetic on `Priority` is a plain `i32` addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Prefetches and other work that may never be needed.
    pub const SPECULATIVE: Priority = Priority(10);
    /// Work that should happen eventually but has no deadline.
    pub const BACKGROUND: Priority = Priority(20);
    /// Background work the caller still expects to complete.
    pub const BACKGROUND_GUARANTEED: Priority = Priority(30);
    /// Work blocking a visible user action.
    pub const USER_INITIATED: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Self::BACKGROUND
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl Add for Priority {
    type Output = Priority;

    fn add(self, rhs: Self) -> Self::Output {
        Priority(self.0 + rhs.0)
    }
}

impl Add<i32> for Priority {
    type Output = Priority;

    fn add(self, rhs: i32) -> Self::Output {
        Priority(self.0 + rhs)
    }
}
