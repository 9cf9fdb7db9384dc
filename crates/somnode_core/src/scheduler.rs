// Single-processor priority gate and the task threads that share it.

use crate::error::CoreError;
use somnode_types::TaskSpec;
use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Task threads never get less stack than this.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

struct Waiter {
    priority: u8,
    seq: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number (arrival order).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct GateState {
    busy: bool,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

/// The one processor every task competes for.
///
/// A task holds it for a slice of work and gives it back (by dropping the
/// guard) before every blocking call. Pending acquisitions are granted strictly
/// by priority, and in arrival order among equal priorities.
#[derive(Clone, Default)]
pub struct Processor {
    state: Arc<Mutex<GateState>>,
}

impl Processor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, priority: u8) -> ProcessorGuard {
        loop {
            let rx = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.busy {
                    state.busy = true;
                    return ProcessorGuard { processor: self.clone() };
                }
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiters.push(Waiter { priority, seq, grant: tx });
                rx
            };

            let mut pending = PendingGrant::new(rx, self.clone());
            if (&mut pending.rx).await.is_ok() {
                pending.granted = true;
                return ProcessorGuard { processor: self.clone() };
            }
            // Sender dropped without a grant; queue again.
        }
    }

    /// Number of tasks currently waiting for the processor.
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).waiters.len()
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(waiter) = state.waiters.pop() {
            if waiter.grant.send(()).is_ok() {
                // Ownership passes directly to the waiter; `busy` stays set.
                return;
            }
        }
        state.busy = false;
    }
}

/// Held while a task is running on the processor.
pub struct ProcessorGuard {
    processor: Processor,
}

impl Drop for ProcessorGuard {
    fn drop(&mut self) {
        self.processor.release();
    }
}

struct PendingGrant {
    rx: oneshot::Receiver<()>,
    processor: Processor,
    granted: bool,
}

impl PendingGrant {
    fn new(rx: oneshot::Receiver<()>, processor: Processor) -> Self {
        Self { rx, processor, granted: false }
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        // Cancelled while waiting. If the grant already arrived, pass it on.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.processor.release();
        }
    }
}

/// Handle to one task thread.
pub struct TaskHandle {
    name: String,
    thread: thread::JoinHandle<io::Result<()>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread. A task whose runtime never came up is an error,
    /// as is one that panicked.
    pub fn join(self) -> Result<(), CoreError> {
        match self.thread.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(CoreError::TaskRuntimeError { name: self.name, source }),
            Err(_) => Err(CoreError::TaskPanicked(self.name)),
        }
    }
}

/// Starts every task on its own OS thread with its configured stack.
#[derive(Clone, Default)]
pub struct Scheduler {
    processor: Processor,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processor(&self) -> Processor {
        self.processor.clone()
    }

    /// Runs `make_task(processor)` to completion on a dedicated thread with a
    /// current-thread runtime.
    pub fn spawn<F, Fut>(&self, spec: &TaskSpec, make_task: F) -> Result<TaskHandle, CoreError>
    where
        F: FnOnce(Processor) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let stack_size = if spec.stack_size < MIN_STACK_SIZE {
            warn!(
                task = %spec.name,
                requested = spec.stack_size,
                floor = MIN_STACK_SIZE,
                "Stack size below floor, raising it."
            );
            MIN_STACK_SIZE
        } else {
            spec.stack_size
        };

        let name = spec.name.clone();
        let processor = self.processor.clone();
        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || -> io::Result<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        error!(task = %thread_name, "Failed to build task runtime: {}", e);
                        e
                    })?;
                runtime.block_on(make_task(processor));
                debug!(task = %thread_name, "Task returned.");
                Ok(())
            })
            .map_err(|source| CoreError::TaskSpawnError {
                name: name.clone(),
                source,
            })?;

        info!(task = %name, priority = spec.priority, stack_size, "Task created.");
        Ok(TaskHandle { name, thread })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn free_processor_is_granted_immediately() {
        let processor = Processor::new();
        let guard = processor.acquire(1).await;
        drop(guard);
        let _again = processor.acquire(1).await;
    }

    #[tokio::test]
    async fn higher_priority_wins_under_simultaneous_readiness() {
        let processor = Processor::new();
        let held = processor.acquire(0).await;
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        // Motion queues first, audio second; audio must still run first.
        for (queued, (name, priority)) in [("motion", 5u8), ("audio", 6u8)].into_iter().enumerate() {
            let task_processor = processor.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _guard = task_processor.acquire(priority).await;
                order_tx.send(name).expect("order channel");
            });
            while processor.waiting() <= queued {
                tokio::task::yield_now().await;
            }
        }
        drop(held);

        assert_eq!(order_rx.recv().await, Some("audio"));
        assert_eq!(order_rx.recv().await, Some("motion"));
    }

    #[tokio::test]
    async fn equal_priorities_are_served_in_arrival_order() {
        let processor = Processor::new();
        let held = processor.acquire(9).await;
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        for id in 0..3u32 {
            let task_processor = processor.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _guard = task_processor.acquire(4).await;
                order_tx.send(id).expect("order channel");
            });
            while processor.waiting() < (id as usize + 1) {
                tokio::task::yield_now().await;
            }
        }
        drop(held);

        for expected in 0..3u32 {
            assert_eq!(order_rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_swallow_the_processor() {
        let processor = Processor::new();
        let held = processor.acquire(1).await;

        let abandoned = {
            let processor = processor.clone();
            tokio::spawn(async move {
                let _guard = processor.acquire(7).await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        };
        while processor.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;
        drop(held);

        tokio::time::timeout(Duration::from_secs(1), processor.acquire(1))
            .await
            .expect("processor must be free after the waiter was cancelled");
    }

    #[test]
    fn join_reports_a_task_whose_runtime_failed() {
        let handle = TaskHandle {
            name: "no_runtime".to_string(),
            thread: thread::spawn(|| Err(io::Error::new(io::ErrorKind::Other, "timer driver unavailable"))),
        };
        assert_matches!(
            handle.join(),
            Err(CoreError::TaskRuntimeError { name, .. }) if name == "no_runtime"
        );
    }

    #[test]
    fn join_reports_a_panicked_task() {
        let handle = TaskHandle {
            name: "crashy".to_string(),
            thread: thread::spawn(|| -> io::Result<()> { panic!("task blew up") }),
        };
        assert_matches!(handle.join(), Err(CoreError::TaskPanicked(name)) if name == "crashy");
    }

    #[test]
    fn scheduler_runs_task_on_named_thread_with_floor_stack() {
        let scheduler = Scheduler::new();
        let spec = TaskSpec::new("tiny_task", 3, 1024);
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = scheduler
            .spawn(&spec, move |processor| async move {
                let _guard = processor.acquire(3).await;
                let name = thread::current().name().map(str::to_string);
                tx.send(name).expect("report thread name");
            })
            .expect("spawn");

        assert_eq!(handle.name(), "tiny_task");
        handle.join().expect("join");
        assert_eq!(rx.recv().expect("thread name"), Some("tiny_task".to_string()));
    }
}
