use chrono::{DateTime, Utc};

/// Wall-clock source used for schedule math and log timestamps.
///
/// Injected so tests can drive time explicitly instead of sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    /// Manually advanced clock for deterministic tests.
    pub struct FakeClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl FakeClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            FakeClock {
                now: Mutex::new(now),
            }
        }

        pub fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now = *now + Duration::seconds(secs);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
