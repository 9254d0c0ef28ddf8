//! Subscriber registry and broadcast fan-out
//!
//! Every subscriber sits in the global set; a subscriber that asked for one
//! driver additionally sits in that driver's set. Deliveries go into bounded
//! per-subscriber queues with `try_send`, so the registry lock is only held
//! while membership is read or changed, never while a subscriber is slow.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

pub type SubscriberId = u64;

/// A serialized outbound message, shared between all recipients
pub type Message = Arc<str>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    QueueFull,

    #[error("subscriber channel is closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub subscriber: SubscriberId,
    pub result: Result<(), DeliveryError>,
}

/// Per-subscriber outcomes of one broadcast call
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    pub outcomes: Vec<DeliveryOutcome>,
    /// Subscribers removed because of repeated delivery failures
    pub evicted: Vec<SubscriberId>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    pub fn outcome_for(&self, subscriber: SubscriberId) -> Option<&DeliveryOutcome> {
        self.outcomes.iter().find(|o| o.subscriber == subscriber)
    }
}

struct Subscriber {
    tx: mpsc::Sender<Message>,
    driver_id: Option<String>,
    consecutive_failures: u32,
}

#[derive(Default)]
struct Members {
    subscribers: HashMap<SubscriberId, Subscriber>,
    by_driver: HashMap<String, HashSet<SubscriberId>>,
}

impl Members {
    fn remove(&mut self, id: SubscriberId) -> Option<Subscriber> {
        let subscriber = self.subscribers.remove(&id)?;
        if let Some(driver_id) = subscriber.driver_id.as_deref() {
            self.unindex(driver_id, id);
        }
        Some(subscriber)
    }

    fn unindex(&mut self, driver_id: &str, id: SubscriberId) {
        if let Some(set) = self.by_driver.get_mut(driver_id) {
            set.remove(&id);
            if set.is_empty() {
                self.by_driver.remove(driver_id);
            }
        }
    }
}

/// Live subscribers, globally and by driver of interest
#[derive(Clone)]
pub struct SubscriberRegistry {
    members: Arc<Mutex<Members>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
    max_failures: u32,
}

impl SubscriberRegistry {
    /// Create a registry whose subscribers buffer up to `queue_capacity`
    /// messages and are evicted after `max_failures` consecutive failed
    /// deliveries (0 disables eviction)
    pub fn new(queue_capacity: usize, max_failures: u32) -> Self {
        Self {
            members: Arc::new(Mutex::new(Members::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
            max_failures,
        }
    }

    /// Register a new subscriber in the global set
    ///
    /// Returns its id and the receiving end of its delivery queue.
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let total = {
            let mut members = self.members.lock();
            members.subscribers.insert(
                id,
                Subscriber {
                    tx,
                    driver_id: None,
                    consecutive_failures: 0,
                },
            );
            members.subscribers.len()
        };

        info!("Subscriber {} connected. Total subscribers: {}", id, total);
        (id, rx)
    }

    /// Additionally register a subscriber under one driver
    ///
    /// Idempotent. A subscriber follows at most one driver; subscribing to a
    /// different driver moves it.
    pub fn connect_to_entity(&self, id: SubscriberId, driver_id: &str) -> Result<(), RegistryError> {
        let mut members = self.members.lock();
        let previous = {
            let subscriber = members
                .subscribers
                .get_mut(&id)
                .ok_or(RegistryError::UnknownSubscriber(id))?;
            if subscriber.driver_id.as_deref() == Some(driver_id) {
                return Ok(());
            }
            subscriber.driver_id.replace(driver_id.to_string())
        };

        if let Some(previous) = previous {
            members.unindex(&previous, id);
        }
        members
            .by_driver
            .entry(driver_id.to_string())
            .or_default()
            .insert(id);
        drop(members);

        info!("Subscriber {} following driver {}", id, driver_id);
        Ok(())
    }

    /// Remove a subscriber from the global set and from its driver's set
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let (removed, total) = {
            let mut members = self.members.lock();
            let removed = members.remove(id).is_some();
            (removed, members.subscribers.len())
        };

        if removed {
            info!("Subscriber {} disconnected. Total subscribers: {}", id, total);
        }
        removed
    }

    /// Deliver to every registered subscriber
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        let targets: Vec<_> = {
            let members = self.members.lock();
            members
                .subscribers
                .iter()
                .map(|(id, s)| (*id, s.tx.clone()))
                .collect()
        };
        self.deliver(targets, message)
    }

    /// Deliver to the subscribers following one driver
    pub fn broadcast_to_entity(&self, message: &Message, driver_id: &str) -> BroadcastReport {
        let targets: Vec<_> = {
            let members = self.members.lock();
            let Some(ids) = members.by_driver.get(driver_id) else {
                return BroadcastReport::default();
            };
            ids.iter()
                .filter_map(|id| members.subscribers.get(id).map(|s| (*id, s.tx.clone())))
                .collect()
        };
        self.deliver(targets, message)
    }

    /// Deliver to one subscriber
    pub fn send_to(&self, id: SubscriberId, message: &Message) -> Result<(), DeliveryError> {
        let tx = {
            let members = self.members.lock();
            members.subscribers.get(&id).map(|s| s.tx.clone())
        };
        let Some(tx) = tx else {
            return Err(DeliveryError::Closed);
        };
        let report = self.deliver(vec![(id, tx)], message);
        report
            .outcomes
            .into_iter()
            .next()
            .map_or(Err(DeliveryError::Closed), |o| o.result)
    }

    fn deliver(
        &self,
        targets: Vec<(SubscriberId, mpsc::Sender<Message>)>,
        message: &Message,
    ) -> BroadcastReport {
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let outcomes: Vec<DeliveryOutcome> = targets
            .into_iter()
            .map(|(subscriber, tx)| {
                let result = tx.try_send(message.clone()).map_err(|e| match e {
                    TrySendError::Full(_) => DeliveryError::QueueFull,
                    TrySendError::Closed(_) => DeliveryError::Closed,
                });
                if let Err(e) = &result {
                    warn!("Error delivering to subscriber {}: {}", subscriber, e);
                }
                DeliveryOutcome { subscriber, result }
            })
            .collect();

        let evicted = self.record_outcomes(&outcomes);
        BroadcastReport { outcomes, evicted }
    }

    /// Update failure counters and evict subscribers over the limit
    fn record_outcomes(&self, outcomes: &[DeliveryOutcome]) -> Vec<SubscriberId> {
        let mut evicted = Vec::new();
        let mut members = self.members.lock();

        for outcome in outcomes {
            let Some(subscriber) = members.subscribers.get_mut(&outcome.subscriber) else {
                continue;
            };
            match outcome.result {
                Ok(()) => subscriber.consecutive_failures = 0,
                Err(_) => {
                    subscriber.consecutive_failures += 1;
                    if self.max_failures > 0 && subscriber.consecutive_failures >= self.max_failures {
                        members.remove(outcome.subscriber);
                        evicted.push(outcome.subscriber);
                    }
                }
            }
        }
        drop(members);

        for id in &evicted {
            warn!("Evicted subscriber {} after repeated delivery failures", id);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.members.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.members.lock().subscribers.contains_key(&id)
    }

    /// The driver a subscriber follows, if any
    pub fn entity_of(&self, id: SubscriberId) -> Option<String> {
        self.members.lock().subscribers.get(&id)?.driver_id.clone()
    }

    pub fn entity_subscriber_count(&self, driver_id: &str) -> usize {
        self.members
            .lock()
            .by_driver
            .get(driver_id)
            .map_or(0, |set| set.len())
    }

    /// Subscriber counts per followed driver
    pub fn entity_counts(&self) -> BTreeMap<String, usize> {
        self.members
            .lock()
            .by_driver
            .iter()
            .map(|(driver, set)| (driver.clone(), set.len()))
            .collect()
    }
}
