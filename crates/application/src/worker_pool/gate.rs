use std::sync::Arc;

use fleetward_core::{AppError, AppResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Process-wide bound on in-flight work units, shared by every pool.
#[derive(Debug)]
pub struct ConcurrencyGate {
    max_in_flight: usize,
    in_flight: watch::Sender<usize>,
}

impl ConcurrencyGate {
    /// Creates a gate admitting at most `max_in_flight` units.
    pub fn new(max_in_flight: usize) -> AppResult<Self> {
        if max_in_flight == 0 {
            return Err(AppError::Validation(
                "max in-flight work units must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            max_in_flight,
            in_flight: watch::Sender::new(0),
        })
    }

    /// Configured bound.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Units currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Takes a slot if one is free.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<InFlightPermit> {
        let max_in_flight = self.max_in_flight;
        let mut acquired = false;
        self.in_flight.send_if_modified(|in_flight| {
            if *in_flight < max_in_flight {
                *in_flight += 1;
                acquired = true;
            }
            acquired
        });

        acquired.then(|| InFlightPermit {
            gate: Arc::clone(self),
        })
    }

    /// Blocks until a slot is free, or returns `None` once `stop` fires.
    pub async fn wait_for_slot(
        self: &Arc<Self>,
        stop: &CancellationToken,
    ) -> Option<InFlightPermit> {
        let mut receiver = self.in_flight.subscribe();
        let max_in_flight = self.max_in_flight;

        loop {
            if let Some(permit) = self.try_acquire() {
                return Some(permit);
            }

            let slot_freed = async {
                receiver
                    .wait_for(|in_flight| *in_flight < max_in_flight)
                    .await
                    .is_ok()
            };

            tokio::select! {
                biased;
                () = stop.cancelled() => return None,
                freed = slot_freed => {
                    if !freed {
                        return None;
                    }
                }
            }
        }
    }

    /// Resolves once no unit holds a permit.
    pub async fn wait_idle(&self) {
        let mut receiver = self.in_flight.subscribe();
        let _ = receiver.wait_for(|in_flight| *in_flight == 0).await;
    }
}

/// Slot held by one work unit; dropping it frees the slot and wakes waiters.
#[derive(Debug)]
pub struct InFlightPermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.gate
            .in_flight
            .send_modify(|in_flight| *in_flight = in_flight.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::ConcurrencyGate;

    fn gate(max_in_flight: usize) -> Arc<ConcurrencyGate> {
        Arc::new(ConcurrencyGate::new(max_in_flight).unwrap_or_else(|_| unreachable!()))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ConcurrencyGate::new(0).is_err());
    }

    #[test]
    fn permits_are_bounded_and_released_on_drop() {
        let gate = gate(2);
        let first = gate.try_acquire();
        let second = gate.try_acquire();

        assert!(first.is_some() && second.is_some());
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);

        drop(first);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_when_a_slot_frees() {
        let gate = gate(1);
        let held = gate.try_acquire();
        assert!(held.is_some());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let stop = CancellationToken::new();
                gate.wait_for_slot(&stop).await.is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(matches!(waiter.await, Ok(true)));
    }

    #[tokio::test]
    async fn stop_releases_a_blocked_waiter() {
        let gate = gate(1);
        let _held = gate.try_acquire();
        let stop = CancellationToken::new();
        stop.cancel();

        assert!(gate.wait_for_slot(&stop).await.is_none());
    }

    #[tokio::test]
    async fn wait_idle_returns_after_last_permit() {
        let gate = gate(3);
        let permit = gate.try_acquire();
        let idle = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_idle().await })
        };

        drop(permit);
        assert!(idle.await.is_ok());
        assert_eq!(gate.in_flight(), 0);
    }
}
