//! In-memory event subscriptions for `subscribe` / `nextEvent`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use skein_core::{EventFilter, FilterError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subscription_id: String,
    pub connection: String,
    pub data: Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NextEventError {
    #[error("no event arrived within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("unknown subscription {subscription_id}")]
    UnknownSubscription { subscription_id: String },

    #[error("nextEvent needs at least one subscription id")]
    NoSubscriptions,
}

#[derive(Debug)]
struct Subscription {
    runner_id: String,
    connection: String,
    filter: EventFilter,
    queue: VecDeque<Value>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    arrivals: Notify,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscription owned by `runner_id` and returns its id.
    pub fn subscribe(
        &self,
        runner_id: &str,
        connection: &str,
        filter: &str,
    ) -> Result<String, FilterError> {
        let filter = EventFilter::parse(filter)?;
        let subscription_id = format!("sub-{}", Uuid::new_v4());
        debug!(runner_id, connection, %subscription_id, filter = filter.as_str(), "subscribed");
        self.lock().insert(
            subscription_id.clone(),
            Subscription {
                runner_id: runner_id.to_string(),
                connection: connection.to_string(),
                filter,
                queue: VecDeque::new(),
            },
        );
        Ok(subscription_id)
    }

    /// Returns whether `runner_id` owned the subscription.
    pub fn unsubscribe(&self, runner_id: &str, subscription_id: &str) -> bool {
        let removed = {
            let mut subscriptions = self.lock();
            let owned = subscriptions
                .get(subscription_id)
                .is_some_and(|s| s.runner_id == runner_id);
            owned && subscriptions.remove(subscription_id).is_some()
        };
        if removed {
            self.arrivals.notify_waiters();
        }
        removed
    }

    /// Drops every subscription of `runner_id`. Returns how many were dropped.
    pub fn release_runner(&self, runner_id: &str) -> usize {
        let released = {
            let mut subscriptions = self.lock();
            let before = subscriptions.len();
            subscriptions.retain(|_, s| s.runner_id != runner_id);
            before - subscriptions.len()
        };
        if released > 0 {
            debug!(runner_id, released, "released subscriptions");
            self.arrivals.notify_waiters();
        }
        released
    }

    /// Queues `data` on every subscription to `connection` whose filter
    /// matches. Returns the number of subscriptions it was queued on.
    pub fn deliver(&self, connection: &str, data: &Value) -> usize {
        let delivered = {
            let mut subscriptions = self.lock();
            let mut delivered = 0;
            for subscription in subscriptions.values_mut() {
                if subscription.connection == connection && subscription.filter.matches(data) {
                    subscription.queue.push_back(data.clone());
                    delivered += 1;
                }
            }
            delivered
        };
        trace!(connection, delivered, "event delivered");
        if delivered > 0 {
            self.arrivals.notify_waiters();
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn take(
        &self,
        runner_id: &str,
        subscription_ids: &[String],
    ) -> Result<Option<Event>, NextEventError> {
        let mut subscriptions = self.lock();
        for id in subscription_ids {
            let subscription = subscriptions
                .get_mut(id)
                .filter(|s| s.runner_id == runner_id)
                .ok_or_else(|| NextEventError::UnknownSubscription {
                    subscription_id: id.clone(),
                })?;
            if let Some(data) = subscription.queue.pop_front() {
                return Ok(Some(Event {
                    subscription_id: id.clone(),
                    connection: subscription.connection.clone(),
                    data,
                }));
            }
        }
        Ok(None)
    }

    /// Waits for the next event on any of `subscription_ids`, earlier ids
    /// first. Without a timeout this waits until an event arrives or one of
    /// the subscriptions goes away. Subscriptions of other runners count as
    /// unknown.
    pub async fn next_event(
        &self,
        runner_id: &str,
        subscription_ids: &[String],
        timeout: Option<Duration>,
    ) -> Result<Event, NextEventError> {
        if subscription_ids.is_empty() {
            return Err(NextEventError::NoSubscriptions);
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(event) = self.take(runner_id, subscription_ids)? {
                return Ok(event);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                        return Err(NextEventError::Timeout {
                            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                        });
                    }
                }
                None => arrival.await,
            }
        }
    }
}
