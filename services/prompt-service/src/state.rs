use promptflow_common::Shutdown;
use std::{sync::Arc, time::Duration};

use crate::ai::ContentGenerator;
use crate::dispatch::Dispatcher;
use crate::store::TaskStore;
use crate::worker::Worker;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub dispatcher: Dispatcher,
    pub worker: Worker,
    pub ai: Arc<dyn ContentGenerator>,
    pub stream_interval: Duration,
    pub shutdown: Shutdown,
}

/// In-memory wiring with a canned model answer.
#[cfg(test)]
pub(crate) struct TestHarness {
    pub state: AppState,
    pub store: Arc<crate::store::MemoryTaskStore>,
    pub queue: Arc<crate::dispatch::MemoryDispatchQueue>,
    pub ai: Arc<crate::ai::tests::FakeGenerator>,
}

#[cfg(test)]
impl TestHarness {
    pub(crate) fn new() -> Self {
        Self::with_step_delay(Duration::ZERO)
    }

    pub(crate) fn with_step_delay(step_delay: Duration) -> Self {
        use crate::worker::SimulatedStep;

        let store = Arc::new(crate::store::MemoryTaskStore::new());
        let queue = Arc::new(crate::dispatch::MemoryDispatchQueue::new());
        let ai = Arc::new(crate::ai::tests::FakeGenerator::answering("canned answer"));
        let worker = Worker::new(
            store.clone(),
            Arc::new(SimulatedStep::new(step_delay)),
            5,
        );
        let state = AppState {
            store: store.clone(),
            dispatcher: Dispatcher::new(queue.clone(), "http://127.0.0.1:8080"),
            worker,
            ai: ai.clone(),
            stream_interval: Duration::from_millis(10),
            shutdown: Shutdown::new(),
        };
        Self {
            state,
            store,
            queue,
            ai,
        }
    }
}
