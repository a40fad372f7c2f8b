
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::engine::Communicator;

pub const MIN_RATE_HZ: i32 = 1;
pub const MAX_RATE_HZ: i32 = 1000;

/// Identifier a task is created without when the caller does not want to
/// address it later.
pub const AUTO_TASK_ID: i32 = -1;

/// Failure modes of the scheduler, carrying the numeric codes the boundary
/// functions report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("rate must be within {MIN_RATE_HZ}..={MAX_RATE_HZ} Hz")]
    InvalidRate,
    #[error("payload must not be empty")]
    InvalidData,
    #[error("destination address is invalid")]
    InvalidAddress,
    #[error("no payload generator supplied")]
    InvalidGenerator,
    #[error("task id is already registered")]
    DuplicateId,
    #[error("failed to register task")]
    CreateFailed,
    #[error("failed to spawn task worker")]
    ThreadFailed,
    #[error("task id is not registered")]
    NotFound,
}

impl TaskError {
    pub fn code(&self) -> i32 {
        match self {
            TaskError::InvalidRate => -1,
            TaskError::InvalidData => -2,
            TaskError::InvalidAddress => -3,
            TaskError::InvalidGenerator => -4,
            TaskError::DuplicateId => -5,
            TaskError::CreateFailed => -6,
            TaskError::ThreadFailed => -7,
            TaskError::NotFound => -1,
        }
    }
}

/// Produces the payload for one period. Runs on the task worker.
pub type PayloadGenerator = Box<dyn Fn() -> Bytes + Send + Sync>;

struct TaskRecord {
    running: Arc<AtomicBool>,
    close_tx: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

/// Rate-driven send tasks, one worker per task. Internal ids increase
/// monotonically from 1 and are never reused; callers may additionally map
/// their own external id onto a task to remove it later.
pub struct PeriodicScheduler {
    communicator: Arc<Communicator>,
    next_task_id: AtomicI32,
    /// External id to internal id.
    task_ids: Mutex<HashMap<i32, i32>>,
    /// Internal id to task record.
    tasks: Mutex<HashMap<i32, TaskRecord>>,
}

impl PeriodicScheduler {
    pub fn new(communicator: Arc<Communicator>) -> Self {
        PeriodicScheduler {
            communicator,
            next_task_id: AtomicI32::new(1),
            task_ids: Mutex::default(),
            tasks: Mutex::default(),
        }
    }

    /// Registers a task that sends a fixed payload `rate_hz` times per
    /// second. The payload is copied once; the caller's buffer is free to
    /// go away once this returns.
    pub fn add_send_task(
        &self,
        ip: &str,
        port: u16,
        data: &[u8],
        rate_hz: i32,
        external_id: i32,
    ) -> Result<i32, TaskError> {
        if !(MIN_RATE_HZ..=MAX_RATE_HZ).contains(&rate_hz) {
            return Err(TaskError::InvalidRate);
        }
        if data.is_empty() {
            return Err(TaskError::InvalidData);
        }
        if ip.is_empty() || port == 0 {
            return Err(TaskError::InvalidAddress);
        }

        let payload = Bytes::copy_from_slice(data);
        let interval = Duration::from_millis(1000 / rate_hz as u64);
        self.add_task(
            interval,
            ip,
            port,
            external_id,
            Box::new(move || payload.clone()),
        )
    }

    /// Registers a task with a caller-supplied payload generator.
    pub fn add_task(
        &self,
        interval: Duration,
        ip: &str,
        port: u16,
        external_id: i32,
        generator: PayloadGenerator,
    ) -> Result<i32, TaskError> {
        let mut task_ids = self.task_ids.lock();
        if external_id != AUTO_TASK_ID && task_ids.contains_key(&external_id) {
            return Err(TaskError::DuplicateId);
        }

        let internal_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let running = Arc::new(AtomicBool::new(true));
        let (close_tx, close_rx) = mpsc::channel(1);

        let worker = tokio::spawn(run_task(
            Arc::clone(&self.communicator),
            Arc::clone(&running),
            close_rx,
            ip.to_owned(),
            port,
            interval,
            generator,
            internal_id,
        ));

        self.tasks.lock().insert(
            internal_id,
            TaskRecord {
                running,
                close_tx,
                worker,
            },
        );
        if external_id != AUTO_TASK_ID {
            task_ids.insert(external_id, internal_id);
        }

        log::info!("Added periodic task {internal_id} ({ip}:{port}, every {interval:?})");
        Ok(internal_id)
    }

    /// Cancels the task registered under `external_id` and waits for its
    /// worker to exit. Tasks created with [`AUTO_TASK_ID`] cannot be
    /// removed individually; they are joined at shutdown.
    pub async fn remove_task(&self, external_id: i32) -> Result<(), TaskError> {
        let internal_id = self
            .task_ids
            .lock()
            .remove(&external_id)
            .ok_or(TaskError::NotFound)?;
        let record = self
            .tasks
            .lock()
            .remove(&internal_id)
            .ok_or(TaskError::NotFound)?;

        stop_task(record).await;
        log::info!("Removed periodic task {internal_id}");
        Ok(())
    }

    /// Cancels every task and waits for the workers.
    pub async fn shutdown(&self) {
        self.task_ids.lock().clear();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (_, record) in tasks {
            stop_task(record).await;
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

async fn stop_task(record: TaskRecord) {
    record.running.store(false, Ordering::Release);
    let _ = record.close_tx.try_send(());
    drop(record.close_tx);
    let _ = record.worker.await;
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    communicator: Arc<Communicator>,
    running: Arc<AtomicBool>,
    mut close_rx: mpsc::Receiver<()>,
    ip: String,
    port: u16,
    interval: Duration,
    generator: PayloadGenerator,
    task_id: i32,
) {
    log::debug!("Worker for periodic task {task_id} started");

    while running.load(Ordering::Acquire) {
        let started = Instant::now();

        let payload = match catch_unwind(AssertUnwindSafe(|| generator())) {
            Ok(payload) => payload,
            Err(_) => {
                log::error!("Payload generator of task {task_id} panicked, stopping the task");
                break;
            }
        };

        if !payload.is_empty() {
            if let Err(err) = communicator.send(&ip, port, &payload).await {
                log::warn!("Periodic task {task_id} failed to send to {ip}:{port}: {err}");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= interval {
            log::warn!(
                "Periodic task {task_id} overran its interval ({elapsed:?} > {interval:?})"
            );
            continue;
        }

        tokio::select! {
            _ = sleep(interval - elapsed) => {}
            _ = close_rx.recv() => break,
        }
    }

    log::debug!("Worker for periodic task {task_id} exiting");
}
