use std::sync::Arc;
use std::time::{Duration, Instant};

use node_bus::LocalBus;

use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    dispatcher: Arc<Dispatcher>,
    bus: LocalBus,
    default_timeout: Duration,
    dispatch_retries: u32,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        bus: LocalBus,
        default_timeout: Duration,
        dispatch_retries: u32,
    ) -> Self {
        Self {
            start: Instant::now(),
            dispatcher,
            bus,
            default_timeout,
            dispatch_retries,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Hub that agent websocket connections attach to.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn dispatch_retries(&self) -> u32 {
        self.dispatch_retries
    }
}
