/// Channel registry - owns every named channel
///
/// The registry map is only locked for lookup, insert and removal; fan-out
/// and subscription changes use the channel's own lock.
use super::channel::{Channel, ErrorScope};
use super::message::Message;
use super::subscription::{Cardinality, Interest, Subscription, SubscriptionInner};
use crate::bridge::BrokerConnection;
use crate::config::BusConfig;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    config: BusConfig,
    next_subscription_id: AtomicU64,
}

impl ChannelManager {
    pub fn new(config: BusConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
            next_subscription_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create a channel, or return the existing one
    pub fn create_channel(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.channels.read().get(name) {
            return Arc::clone(channel);
        }

        let mut channels = self.channels.write();
        let channel = channels
            .entry(name.to_string())
            .or_insert_with(|| {
                logger::debug(LogTag::Bus, &format!("Channel '{}' created", name));
                Channel::new(name)
            });
        Arc::clone(channel)
    }

    /// Create a channel that must not exist yet
    pub fn create_channel_exclusive(&self, name: &str) -> Result<Arc<Channel>, BusError> {
        let mut channels = self.channels.write();
        if channels.contains_key(name) {
            return Err(BusError::ChannelExists(name.to_string()));
        }
        let channel = Channel::new(name);
        channels.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub fn channel_exists(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look a channel up, auto-creating it unless strict mode is on
    pub(crate) fn resolve(&self, name: &str) -> Result<Arc<Channel>, BusError> {
        if self.config.strict_channels {
            self.get_channel(name)
                .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))
        } else {
            Ok(self.create_channel(name))
        }
    }

    /// Remove a channel, force-closing its subscriptions first
    ///
    /// A galactic channel's mapping is released in the background.
    pub fn destroy_channel(&self, name: &str) -> Result<(), BusError> {
        let channel = self
            .get_channel(name)
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;

        if let Some(mapping) = channel.take_mapping() {
            mapping.release_in_background();
        }
        channel.teardown();
        self.channels.write().remove(name);

        logger::debug(LogTag::Bus, &format!("Channel '{}' destroyed", name));
        Ok(())
    }

    /// Publish onto a channel
    ///
    /// Galactic channels forward to their remote destination instead of
    /// delivering locally; the broker echo is the local delivery. Returns
    /// once the message is handed off.
    pub fn publish(&self, name: &str, mut message: Message) -> Result<(), BusError> {
        let channel = self.resolve(name)?;
        message.channel = name.to_string();

        if let Some(mapping) = channel.mapping() {
            match mapping.forward(message) {
                Ok(()) => return Ok(()),
                // Mapping is being released: fall back to local delivery
                Err(returned) => message = returned,
            }
        }

        channel.fan_out(Arc::new(message));
        Ok(())
    }

    /// Deliver an error to the response listeners of a channel (local only)
    pub fn publish_error(&self, name: &str, err: BusError) -> Result<(), BusError> {
        let channel = self.resolve(name)?;
        channel.fan_out_error(&err, ErrorScope::Listeners);
        Ok(())
    }

    pub(crate) fn subscribe(
        &self,
        name: &str,
        cardinality: Cardinality,
        interest: Interest,
    ) -> Result<Subscription, BusError> {
        let channel = self.resolve(name)?;
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let inner = SubscriptionInner::new(
            id,
            name,
            cardinality,
            interest,
            self.config.subscription_buffer,
        );
        channel.attach(Arc::clone(&inner));
        Ok(Subscription::from_inner(inner))
    }

    // ========================================================================
    // GALACTIC MAPPINGS
    // ========================================================================

    /// Bridge a channel to a remote destination over a broker connection
    ///
    /// Re-marking with the same destination and connection is a no-op; any
    /// other existing mapping is a `MappingConflict`.
    pub async fn mark_galactic(
        &self,
        name: &str,
        destination: &str,
        connection: &BrokerConnection,
    ) -> Result<(), BusError> {
        let channel = self.resolve(name)?;
        connection.map_channel(&channel, destination).await?;
        logger::info(
            LogTag::Bridge,
            &format!(
                "Channel '{}' marked galactic -> '{}' (connection {})",
                name,
                destination,
                connection.id()
            ),
        );
        Ok(())
    }

    /// Stop bridging a channel
    ///
    /// Drains frames already handed to the forwarder or accepted by the
    /// transport before the mapping is removed. Local channels are a no-op.
    pub async fn mark_local(&self, name: &str) -> Result<(), BusError> {
        let channel = self
            .get_channel(name)
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;

        let Some(mapping) = channel.take_mapping() else {
            return Ok(());
        };

        let destination = mapping.destination().to_string();
        mapping.release().await?;
        logger::info(
            LogTag::Bridge,
            &format!("Channel '{}' marked local (was '{}')", name, destination),
        );
        Ok(())
    }
}
