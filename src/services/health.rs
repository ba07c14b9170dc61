use super::ServiceState;

/// Service health status
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceHealth {
    /// Service is operating normally
    Healthy,

    /// Service is running on a fallback or with reduced function
    Degraded(String),

    /// Service has failed
    Unhealthy(String),

    /// Service is starting up
    Starting,

    /// Service is shutting down
    Stopping,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceHealth::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ServiceHealth::Degraded(_))
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, ServiceHealth::Unhealthy(_))
    }

    /// Default health for a lifecycle state when the service reports none
    pub fn from_state(state: ServiceState) -> Self {
        match state {
            ServiceState::Registered | ServiceState::Initializing | ServiceState::AwaitingReady => {
                ServiceHealth::Starting
            }
            ServiceState::Running => ServiceHealth::Healthy,
            ServiceState::ShuttingDown => ServiceHealth::Stopping,
            ServiceState::Stopped => ServiceHealth::Unhealthy("stopped".to_string()),
            ServiceState::Failed => ServiceHealth::Unhealthy("startup failed".to_string()),
        }
    }
}
