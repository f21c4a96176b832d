//! Fixed-size pool of async executors draining one bounded work channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default capacity of a pool's work channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A unit of deferred work
pub type WorkItem = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Channels {
    work: mpsc::Receiver<WorkItem>,
    cancel: mpsc::UnboundedReceiver<()>,
}

enum Next {
    Run(WorkItem),
    Stop,
}

/// Pool of `n` executors sharing a bounded FIFO of work items
///
/// Items run to completion inside the executor that drew them, so the
/// worker count bounds how many items of this pool run at once. With more
/// than one worker there is no ordering between items beyond the FIFO draw.
pub struct WorkerPool {
    name: String,
    worker_count: usize,
    work_tx: mpsc::Sender<WorkItem>,
    cancel_tx: mpsc::UnboundedSender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool with `worker_count` executors and a work channel of
    /// `capacity` items. Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, worker_count: usize, capacity: usize) -> Self {
        let name = name.into();
        let (work_tx, work_rx) = mpsc::channel(capacity);
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();

        let channels = Arc::new(tokio::sync::Mutex::new(Channels {
            work: work_rx,
            cancel: cancel_rx,
        }));

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(name.clone(), id, Arc::clone(&channels))))
            .collect();

        info!(
            "{} pool started: {} worker(s), queue capacity {}",
            name, worker_count, capacity
        );

        Self {
            name,
            worker_count,
            work_tx,
            cancel_tx,
            workers: Mutex::new(workers),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue `item`, waiting for channel space if the queue is full
    pub async fn add_blocking(&self, item: WorkItem) {
        if self.work_tx.send(item).await.is_err() {
            // Only possible once every executor has been cancelled
            error!("{} pool: all workers stopped, work item dropped", self.name);
        }
    }

    /// Queue `item` if there is space right now
    ///
    /// Returns `false` without queueing when the channel is full. Callers
    /// must then undo whatever they prepared for the item.
    pub fn add_if_space(&self, item: WorkItem) -> bool {
        match self.work_tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("{} pool: all workers stopped, work item rejected", self.name);
                false
            }
        }
    }

    /// Send one cancellation signal
    ///
    /// Exactly one executor receives each signal and stops after its current
    /// item, abandoning nothing else. Stopping every executor takes
    /// `worker_count` calls, see [`Self::shutdown`].
    pub fn cancel(&self) {
        // Fails only when every executor has already stopped
        let _ = self.cancel_tx.send(());
    }

    /// Number of executors that have not stopped yet
    pub fn active_workers(&self) -> usize {
        self.lock_workers()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Stop every executor and wait for in-flight items to finish
    ///
    /// Items still queued when an executor picks up its cancellation are
    /// abandoned.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_workers());
        info!(
            "{} pool shutting down ({} worker(s))",
            self.name,
            handles.len()
        );

        for _ in 0..handles.len() {
            self.cancel();
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("{} pool: worker ended abnormally: {}", self.name, e);
            }
        }

        info!("{} pool stopped", self.name);
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop(pool: String, id: usize, channels: Arc<tokio::sync::Mutex<Channels>>) {
    debug!("{} worker {} started", pool, id);

    loop {
        let next = {
            let mut guard = channels.lock().await;
            let Channels { work, cancel } = &mut *guard;

            tokio::select! {
                biased;
                // A closed cancel channel means the pool itself is gone
                _ = cancel.recv() => Next::Stop,
                item = work.recv() => match item {
                    Some(item) => Next::Run(item),
                    None => Next::Stop,
                },
            }
        };

        match next {
            Next::Run(item) => {
                // Run on a separate task so a panicking item costs one job,
                // not the executor.
                if let Err(e) = tokio::spawn(item).await {
                    error!("{} worker {}: work item panicked: {}", pool, id, e);
                }
            }
            Next::Stop => break,
        }
    }

    debug!("{} worker {} stopped", pool, id);
}
