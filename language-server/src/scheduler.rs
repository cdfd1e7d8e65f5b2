use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    state: SchedulerState,
    handle: Option<JoinHandle<()>>,
}

/// Single cancelable timer. Scheduling again before the delay elapses drops
/// the pending task and restarts the wait.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Arc<Mutex<Duration>>,
    slot: Arc<Mutex<Slot>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: Arc::new(Mutex::new(delay)),
            slot: Arc::new(Mutex::new(Slot {
                generation: 0,
                state: SchedulerState::Idle,
                handle: None,
            })),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn state(&self) -> SchedulerState {
        self.slot.lock().state
    }

    /// Runs `task` once the delay passes without another call to `schedule`.
    /// A task that already started is left to finish.
    pub fn schedule<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = *self.delay.lock();
        let mut slot = self.slot.lock();
        if slot.state == SchedulerState::Scheduled {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
        slot.generation += 1;
        slot.state = SchedulerState::Scheduled;

        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);
        slot.handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut slot = shared.lock();
                if slot.generation != generation {
                    return;
                }
                slot.state = SchedulerState::Running;
            }
            task().await;
            let mut slot = shared.lock();
            if slot.generation == generation {
                slot.state = SchedulerState::Idle;
                slot.handle = None;
            }
        }));
    }

    /// Drops a pending task. A running one is not interrupted.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        if slot.state == SchedulerState::Scheduled {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
        slot.generation += 1;
        slot.state = SchedulerState::Idle;
    }
}
