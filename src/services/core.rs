/// Per-service handle on the host's facilities
///
/// Passed to `Service::init`. Everything is scoped to the service's own
/// channel.
use super::rest::{RestClient, RestServiceRequest};
use super::scheduler::ScheduledProducer;
use crate::bus::{EventBus, Payload};
use crate::errors::BusError;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Clone)]
pub struct ServiceCore {
    bus: EventBus,
    channel: String,
    rest: RestClient,
}

impl ServiceCore {
    pub fn new(bus: EventBus, channel: &str, rest: RestClient) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            rest,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish a JSON value to every listener on the service channel
    pub fn broadcast<T: Serialize>(&self, value: &T) -> Result<(), BusError> {
        self.bus.publish(&self.channel, Payload::json(value)?)
    }

    pub fn broadcast_error(&self, err: BusError) -> Result<(), BusError> {
        self.bus.send_error(&self.channel, err)
    }

    /// A producer bound to the service channel
    pub fn scheduled_producer(&self) -> ScheduledProducer {
        ScheduledProducer::new(self.bus.clone(), &self.channel)
    }

    pub fn rest_client(&self) -> &RestClient {
        &self.rest
    }

    pub async fn rest_request<T: DeserializeOwned>(
        &self,
        request: &RestServiceRequest,
    ) -> Result<T, BusError> {
        self.rest.execute(request).await
    }
}

impl std::fmt::Debug for ServiceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCore")
            .field("channel", &self.channel)
            .finish()
    }
}
