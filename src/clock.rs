//! Wall-clock source for every timestamp the engine records.
//!
//! Control loops compare against [`Clock::now`] rather than calling
//! [`Utc::now`] directly, so a single tick can be driven from tests.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use crate::common::lock;

pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestingClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestingClock {
    pub fn new(init: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(init)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Default for TestingClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[test]
fn testing_clock_clones_share_time() {
    let clock = TestingClock::default();
    let other = clock.clone();
    let before = clock.now();
    other.advance(Duration::seconds(31));
    assert_eq!(clock.now() - before, Duration::seconds(31));
}
