//! Stage timing
//!
//! One timer value per measurement, started on the stack and consumed where
//! the stage ends. Replaces the kind of global start/diff pair that breaks
//! as soon as two threads measure at once.

use std::time::Instant;

/// Stack-scoped microsecond timer.
#[derive(Debug, Clone, Copy)]
pub struct StageTimer(Instant);

impl StageTimer {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    /// Microseconds elapsed since `start()`.
    pub fn elapsed_us(&self) -> i64 {
        self.0.elapsed().as_micros() as i64
    }
}
