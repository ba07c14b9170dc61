/// Channels - named fan-out points with their subscriber lists
///
/// All mutations of one channel's subscriber list happen under that
/// channel's own lock. Fan-out holds the lock for the whole pass so two
/// concurrent publishes on one channel reach every subscriber in the same
/// order; publishes on different channels never contend.
use super::message::Message;
use super::subscription::{Delivery, Interest, SubscriptionInner};
use crate::bridge::Mapping;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Who receives a channel-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Response listeners only (bus errors, producer failures)
    Listeners,
    /// Every subscription, request listeners included (connection failures)
    All,
}

pub struct Channel {
    name: String,
    subscribers: Mutex<Vec<Arc<SubscriptionInner>>>,
    mapping: RwLock<Option<Arc<Mapping>>>,
    destroyed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            subscribers: Mutex::new(Vec::new()),
            mapping: RwLock::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open subscriptions currently attached
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| s.is_accepting())
            .count()
    }

    pub fn is_galactic(&self) -> bool {
        self.mapping.read().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Remote destination this channel is bridged to, if any
    pub fn destination(&self) -> Option<String> {
        self.mapping.read().as_ref().map(|m| m.destination().to_string())
    }

    pub(crate) fn mapping(&self) -> Option<Arc<Mapping>> {
        self.mapping.read().clone()
    }

    /// Install a mapping if the channel is still local
    pub(crate) fn install_mapping(&self, mapping: Arc<Mapping>) -> Result<(), Arc<Mapping>> {
        let mut slot = self.mapping.write();
        match slot.as_ref() {
            Some(existing) => Err(Arc::clone(existing)),
            None => {
                *slot = Some(mapping);
                Ok(())
            }
        }
    }

    pub(crate) fn take_mapping(&self) -> Option<Arc<Mapping>> {
        self.mapping.write().take()
    }

    /// Clear the mapping only if it is still the given one
    pub(crate) fn clear_mapping(&self, mapping: &Arc<Mapping>) -> bool {
        let mut slot = self.mapping.write();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, mapping) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Add a subscription; one attached to a destroyed channel is cancelled at once
    pub(crate) fn attach(&self, subscription: Arc<SubscriptionInner>) {
        let mut subscribers = self.subscribers.lock();
        if self.is_destroyed() {
            drop(subscribers);
            subscription.offer(Delivery::Terminal(BusError::Cancelled(self.name.clone())));
            return;
        }
        subscribers.push(subscription);
    }

    /// Local delivery to every interested open subscription, in registration order
    ///
    /// Returns the number of subscriptions the message was offered to.
    pub(crate) fn fan_out(&self, message: Arc<Message>) -> usize {
        let mut offered = 0;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if !sub.interest().accepts(message.direction) {
                return sub.is_accepting();
            }
            offered += 1;
            sub.offer(Delivery::Message(Arc::clone(&message)))
        });
        drop(subscribers);

        if logger::is_debug_enabled(LogTag::Bus) {
            logger::debug(
                LogTag::Bus,
                &format!(
                    "'{}': {} {} offered to {} subscriber(s)",
                    self.name, message.direction, message.id, offered
                ),
            );
        }
        offered
    }

    /// Deliver an error to the subscriptions in scope
    pub(crate) fn fan_out_error(&self, err: &BusError, scope: ErrorScope) -> usize {
        let mut offered = 0;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if scope == ErrorScope::Listeners && sub.interest() != Interest::Responses {
                return sub.is_accepting();
            }
            offered += 1;
            sub.offer(Delivery::Error(err.clone()))
        });
        offered
    }

    /// Force-close every subscription with a cancellation reason
    pub(crate) fn teardown(&self) {
        let subscribers = {
            let mut subscribers = self.subscribers.lock();
            self.destroyed.store(true, Ordering::Release);
            std::mem::take(&mut *subscribers)
        };
        let reason = BusError::Cancelled(self.name.clone());
        for sub in subscribers {
            sub.offer(Delivery::Terminal(reason.clone()));
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .field("galactic", &self.is_galactic())
            .finish()
    }
}
