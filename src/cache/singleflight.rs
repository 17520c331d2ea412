//! Single-flight deduplication of upstream exchanges.
//!
//! At most one exchange per question fingerprint is outstanding at any
//! instant. The first caller becomes the leader and performs the
//! exchange; concurrent callers for the same fingerprint wait on the
//! leader's notifier and share its result. A leader that is cancelled
//! publishes a failure so waiters never hang on a dead flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::dns::Fingerprint;
use crate::error::ExchangeError;

/// What a flight resolves to: the response plus the address of the
/// upstream that produced it.
pub type FlightResult = Result<(Message, String), ExchangeError>;

struct Flight {
    done: Notify,
    slot: Mutex<Option<FlightResult>>,
}

/// The per-fingerprint flight table.
#[derive(Default)]
pub struct SingleFlight {
    flights: Mutex<HashMap<Fingerprint, Arc<Flight>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `exchange` under single-flight semantics for `key`.
    ///
    /// Followers wait at most `wait_timeout` for the leader; on expiry
    /// they receive a timeout error and drop their reference to the
    /// flight without keeping it alive.
    pub async fn run<F, Fut>(
        &self,
        key: &Fingerprint,
        wait_timeout: Duration,
        exchange: F,
    ) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult>,
    {
        let (flight, is_leader) = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        done: Notify::new(),
                        slot: Mutex::new(None),
                    });
                    flights.insert(key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if is_leader {
            let guard = LeaderGuard {
                table: self,
                key,
                flight: &flight,
            };
            let result = exchange().await;
            guard.publish(result.clone());
            return result;
        }

        // Register for the notification before re-checking the slot, so a
        // completion between the check and the await is not missed.
        let notified = flight.done.notified();
        if let Some(result) = flight.slot.lock().clone() {
            return result;
        }
        match tokio::time::timeout(wait_timeout, notified).await {
            Ok(()) => flight
                .slot
                .lock()
                .clone()
                .unwrap_or_else(|| Err(ExchangeError::timeout("single-flight leader"))),
            Err(_) => Err(ExchangeError::timeout("single-flight wait")),
        }
    }

    /// Number of outstanding flights, for tests and introspection.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

/// Removes the flight from the table and wakes waiters, even when the
/// leader future is dropped mid-exchange.
struct LeaderGuard<'a> {
    table: &'a SingleFlight,
    key: &'a Fingerprint,
    flight: &'a Arc<Flight>,
}

impl LeaderGuard<'_> {
    fn publish(self, result: FlightResult) {
        *self.flight.slot.lock() = Some(result);
        // Dropping self removes the table entry and notifies.
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.flight.slot.lock();
        if slot.is_none() {
            *slot = Some(Err(ExchangeError::connection(
                "single-flight leader",
                "exchange cancelled",
            )));
        }
        drop(slot);

        self.table.flights.lock().remove(self.key);
        self.flight.done.notify_waiters();
    }
}
