/// Subscription handler - one consumer's interest in a channel
///
/// Publishers never wait on subscribers. Each subscription owns a bounded
/// queue; `offer` pushes without blocking and a per-subscription delivery
/// task drains the queue into the attached callbacks. Overflow is counted and
/// surfaced to `on_error` as `SlowConsumer`, never pushed back onto the
/// publisher.
///
/// Messages that arrive before `handle` attaches callbacks wait in the queue.
use super::message::{Direction, Message};
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::Notify;

/// Opaque subscription handle id
pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one outcome, then auto-close
    Once,
    /// Every message until closed
    Stream,
}

/// Which message direction a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Responses,
    Requests,
}

impl Interest {
    pub fn accepts(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Interest::Responses, Direction::Response) | (Interest::Requests, Direction::Request)
        )
    }
}

/// One queued outcome
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Message(Arc<Message>),
    /// Non-terminal for streams, terminal for once subscriptions
    Error(BusError),
    /// Delivered to on_error, then the subscription closes
    Terminal(BusError),
}

type SuccessFn = Arc<dyn Fn(&Message) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&BusError) + Send + Sync>;

struct State {
    open: bool,
    /// No further offers accepted (once consumed or terminal queued)
    sealed: bool,
    queue: VecDeque<Delivery>,
    dropped: u64,
    callbacks: Option<(SuccessFn, ErrorFn)>,
    task_started: bool,
}

pub(crate) struct SubscriptionInner {
    id: SubscriptionId,
    channel: String,
    cardinality: Cardinality,
    interest: Interest,
    capacity: usize,
    state: Mutex<State>,
    /// Held while a callback runs; close() takes it to wait out in-flight delivery.
    /// Reentrant so a callback may close its own subscription.
    gate: ReentrantMutex<()>,
    wake: Notify,
}

impl SubscriptionInner {
    pub(crate) fn new(
        id: SubscriptionId,
        channel: &str,
        cardinality: Cardinality,
        interest: Interest,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            channel: channel.to_string(),
            cardinality,
            interest,
            capacity: capacity.max(1),
            state: Mutex::new(State {
                open: true,
                sealed: false,
                queue: VecDeque::new(),
                dropped: 0,
                callbacks: None,
                task_started: false,
            }),
            gate: ReentrantMutex::new(()),
            wake: Notify::new(),
        })
    }

    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Whether this subscription should stay in the channel's list
    pub(crate) fn is_accepting(&self) -> bool {
        let state = self.state.lock();
        state.open && !state.sealed
    }

    /// Queue a delivery without blocking
    ///
    /// Returns false once the subscription accepts nothing further, so the
    /// channel can drop it from its list.
    pub(crate) fn offer(&self, delivery: Delivery) -> bool {
        let mut state = self.state.lock();
        if !state.open || state.sealed {
            return false;
        }

        if matches!(delivery, Delivery::Message(_)) && state.queue.len() >= self.capacity {
            state.dropped += 1;
            drop(state);
            self.wake.notify_one();
            return true;
        }

        let terminal =
            self.cardinality == Cardinality::Once || matches!(delivery, Delivery::Terminal(_));
        if terminal {
            state.sealed = true;
        }
        state.queue.push_back(delivery);
        drop(state);

        self.wake.notify_one();
        !terminal
    }

    /// Mark closed and discard anything queued
    fn shut(&self) {
        {
            let mut state = self.state.lock();
            state.open = false;
            state.sealed = true;
            state.queue.clear();
            state.callbacks = None;
        }
        self.wake.notify_one();
    }

    fn close(&self) {
        self.shut();
        // Wait for a callback running on another thread; re-entry from our own callback passes.
        let _gate = self.gate.lock();
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if !state.open {
                    return;
                }
                if state.dropped > 0 {
                    let dropped = std::mem::take(&mut state.dropped);
                    Some(Delivery::Error(BusError::SlowConsumer {
                        channel: self.channel.clone(),
                        dropped,
                    }))
                } else {
                    state.queue.pop_front()
                }
            };

            match next {
                Some(delivery) => self.deliver(delivery),
                None => self.wake.notified().await,
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let _gate = self.gate.lock();

        let (on_success, on_error) = {
            let state = self.state.lock();
            if !state.open {
                return;
            }
            match &state.callbacks {
                Some((ok, err)) => (Arc::clone(ok), Arc::clone(err)),
                None => return,
            }
        };

        let finished = match &delivery {
            Delivery::Message(message) => {
                self.guarded(|| on_success(message));
                self.cardinality == Cardinality::Once
            }
            Delivery::Error(err) => {
                self.guarded(|| on_error(err));
                self.cardinality == Cardinality::Once
            }
            Delivery::Terminal(err) => {
                self.guarded(|| on_error(err));
                true
            }
        };

        if finished {
            self.shut();
        }
    }

    /// A panicking callback must not take the delivery task down with it
    fn guarded(&self, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            logger::error(
                LogTag::Bus,
                &format!(
                    "Subscription {} on '{}': callback panicked",
                    self.id, self.channel
                ),
            );
        }
    }
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

/// Handle to one subscription
///
/// Cloning the handle does not create a new subscription. Dropping it does
/// not close the subscription; call [`Subscription::close`].
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub(crate) fn from_inner(inner: Arc<SubscriptionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn cardinality(&self) -> Cardinality {
        self.inner.cardinality
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    /// Queued deliveries not yet handed to callbacks
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Attach (or replace) the success/error callbacks
    ///
    /// Starts the delivery task on first attach; must be called from within a
    /// Tokio runtime. Anything queued so far is delivered in order.
    pub fn handle<S, E>(&self, on_success: S, on_error: E)
    where
        S: Fn(&Message) + Send + Sync + 'static,
        E: Fn(&BusError) + Send + Sync + 'static,
    {
        let spawn = {
            let mut state = self.inner.state.lock();
            if !state.open {
                return;
            }
            state.callbacks = Some((Arc::new(on_success), Arc::new(on_error)));
            !std::mem::replace(&mut state.task_started, true)
        };

        if spawn {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(Arc::clone(&self.inner).run());
                }
                Err(_) => {
                    self.inner.state.lock().task_started = false;
                    logger::error(
                        LogTag::Bus,
                        &format!(
                            "Subscription {} on '{}': handle() called outside a Tokio runtime, deliveries stay queued",
                            self.inner.id, self.inner.channel
                        ),
                    );
                    return;
                }
            }
        }

        self.inner.wake.notify_one();
    }

    /// Close the subscription
    ///
    /// Safe to call concurrently with delivery and from inside a callback.
    /// Once this returns, no callback of this subscription runs again.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("cardinality", &self.inner.cardinality)
            .field("closed", &self.is_closed())
            .finish()
    }
}
