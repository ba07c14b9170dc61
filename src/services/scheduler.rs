/// Scheduled producer - publishes a generated value onto a channel every period
///
/// At most one timer runs per producer. `stop` is idempotent, may be called
/// before `start` or from another task, and no publish begins after it
/// returns. A failing generator skips its tick and reports the failure to the
/// channel's listeners; the timer keeps running.
use crate::bus::{EventBus, Payload};
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub type Generator = Arc<dyn Fn() -> Result<Payload, BusError> + Send + Sync>;

struct Run {
    /// Held while a tick publishes; `stop` flips `active` under it
    gate: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

pub struct ScheduledProducer {
    bus: EventBus,
    channel: String,
    run: Mutex<Option<Run>>,
}

impl ScheduledProducer {
    pub fn new(bus: EventBus, channel: &str) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            run: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .map(|run| *run.gate.lock() && !run.task.is_finished())
            .unwrap_or(false)
    }

    /// Start ticking; a running timer is replaced
    ///
    /// The first tick fires one `period` after start. Must be called within a
    /// Tokio runtime.
    pub fn start<F>(&self, period: Duration, generator: F)
    where
        F: Fn() -> Result<Payload, BusError> + Send + Sync + 'static,
    {
        self.stop();

        let period = period.max(Duration::from_millis(1));
        let gate = Arc::new(Mutex::new(true));
        let tick_gate = Arc::clone(&gate);
        let generator: Generator = Arc::new(generator);
        let bus = self.bus.clone();
        let channel = self.channel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let outcome = {
                    let active = tick_gate.lock();
                    if !*active {
                        break;
                    }
                    match generator() {
                        Ok(payload) => bus.publish(&channel, payload),
                        Err(e) => {
                            logger::debug(
                                LogTag::Scheduler,
                                &format!("'{}': tick skipped: {}", channel, e),
                            );
                            bus.send_error(&channel, e)
                        }
                    }
                };

                if let Err(e) = outcome {
                    logger::warning(
                        LogTag::Scheduler,
                        &format!("'{}': tick not delivered: {}", channel, e),
                    );
                }
            }
        });

        *self.run.lock() = Some(Run { gate, task });
        logger::debug(
            LogTag::Scheduler,
            &format!(
                "Producer on '{}' started ({}ms period)",
                self.channel,
                period.as_millis()
            ),
        );
    }

    /// Cancel the timer
    pub fn stop(&self) {
        let Some(run) = self.run.lock().take() else {
            return;
        };
        *run.gate.lock() = false;
        run.task.abort();
        logger::debug(
            LogTag::Scheduler,
            &format!("Producer on '{}' stopped", self.channel),
        );
    }
}

impl Drop for ScheduledProducer {
    fn drop(&mut self) {
        self.stop();
    }
}
