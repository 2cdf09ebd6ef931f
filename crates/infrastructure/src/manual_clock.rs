use std::time::Duration;

use async_trait::async_trait;
use fleetward_application::Clock;
use tokio::sync::watch;

/// Virtual clock that only moves when [`ManualClock::advance`] is called.
///
/// Sleepers wake once the clock reaches their deadline, rounded up to whole
/// seconds, so loops driven by this clock step deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<i64>,
}

impl ManualClock {
    /// Creates a clock reading `start` unix seconds.
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self {
            now: watch::Sender::new(start),
        }
    }

    /// Moves the clock forward and wakes due sleepers.
    pub fn advance(&self, duration: Duration) {
        let seconds = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        self.now
            .send_modify(|now| *now = now.saturating_add(seconds));
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        *self.now.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let mut seconds = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        if duration.subsec_nanos() > 0 || seconds == 0 {
            seconds = seconds.saturating_add(1);
        }

        let mut receiver = self.now.subscribe();
        let deadline = receiver.borrow_and_update().saturating_add(seconds);
        let _ = receiver.wait_for(|now| *now >= deadline).await;
    }
}
