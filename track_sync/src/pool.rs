//! Fixed pool of worker threads evaluating conditions.
//!
//! Every sweep step is a scatter/gather round: the coordinator queues the
//! step's tasks followed by one `Idle` marker per worker. A worker that
//! dequeues its marker reports everything it accumulated and then blocks on its
//! control channel, so no worker can start on the next step before all of them
//! have reported. The coordinator collects exactly one report per worker and
//! resumes them.

use std::collections::BTreeMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::condition::{Condition, ConditionOutput};
use crate::point::SpatialPoint;
use crate::session::SessionSnapshot;
use crate::{DriverId, SyncError};

/// Evaluate condition `condition` for `driver` at `candidate`.
#[derive(Clone, Debug)]
pub struct SolverTask {
    pub condition: usize,
    pub driver: DriverId,
    pub candidate: SpatialPoint,
}

enum Task {
    Evaluate(SolverTask),
    Idle,
    Exit,
}

enum Control {
    Resume,
    Exit,
}

enum Report {
    Idle {
        worker: usize,
        results: BTreeMap<usize, ConditionOutput>,
    },
    /// Last message of a worker that stopped abnormally.
    Stopped {
        worker: usize,
        panicked: bool,
        reason: String,
    },
}

/// Outcome of one scatter/gather round.
#[derive(Clone, Debug, Default)]
pub struct StepReport {
    pub tasks: usize,
    /// Number of idle reports received; always equals the pool size.
    pub reports: usize,
    /// Outputs of all tasks, merged by condition index.
    pub merged: BTreeMap<usize, ConditionOutput>,
}

pub struct WorkerPool {
    tasks: Sender<Task>,
    reports: Receiver<Report>,
    controls: Vec<Sender<Control>>,
    handles: Vec<JoinHandle<Result<(), SyncError>>>,
}

impl WorkerPool {
    /// Start `workers` threads sharing the read-only session and conditions.
    pub fn spawn(
        workers: usize,
        session: Arc<SessionSnapshot>,
        conditions: Arc<[Arc<dyn Condition>]>,
    ) -> Result<Self, SyncError> {
        if workers == 0 {
            return Err(SyncError::InvalidParameter(
                "worker pool needs at least one worker".into(),
            ));
        }
        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (report_tx, report_rx) = mpsc::channel::<Report>();

        let mut pool = Self {
            tasks: task_tx,
            reports: report_rx,
            controls: Vec::with_capacity(workers),
            handles: Vec::with_capacity(workers),
        };
        for id in 0..workers {
            let (control_tx, control_rx) = mpsc::channel::<Control>();
            let worker = Worker {
                id,
                tasks: Arc::clone(&task_rx),
                reports: report_tx.clone(),
                control: control_rx,
                session: Arc::clone(&session),
                conditions: Arc::clone(&conditions),
            };
            let handle = thread::Builder::new()
                .name(format!("sync-worker-{}", id))
                .spawn(move || worker.run_reporting_failure())
                .map_err(|e| SyncError::PoolProtocol(format!("failed to spawn worker {}: {}", id, e)))?;
            pool.controls.push(control_tx);
            pool.handles.push(handle);
        }
        debug!("Started {} workers", workers);
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.controls.len()
    }

    /// Run one barrier-synchronised round over `tasks`.
    pub fn run_step<I>(&self, tasks: I) -> Result<StepReport, SyncError>
    where
        I: IntoIterator<Item = SolverTask>,
    {
        let mut queued = 0;
        for task in tasks {
            self.send_task(Task::Evaluate(task))?;
            queued += 1;
        }
        self.queue_idle()?;
        let (reports, merged) = self.wait_for_idle()?;
        self.broadcast(|| Control::Resume)?;
        Ok(StepReport {
            tasks: queued,
            reports,
            merged,
        })
    }

    /// Idle every worker one last time, tell them to exit and join them.
    pub fn shutdown(mut self) -> Result<(), SyncError> {
        self.queue_idle()?;
        self.broadcast(|| Control::Exit)?;
        self.join_all()
    }

    fn send_task(&self, task: Task) -> Result<(), SyncError> {
        self.tasks
            .send(task)
            .map_err(|_| SyncError::PoolProtocol("task queue closed: all workers stopped".into()))
    }

    fn queue_idle(&self) -> Result<(), SyncError> {
        for _ in 0..self.size() {
            self.send_task(Task::Idle)?;
        }
        Ok(())
    }

    fn wait_for_idle(&self) -> Result<(usize, BTreeMap<usize, ConditionOutput>), SyncError> {
        let mut merged: BTreeMap<usize, ConditionOutput> = BTreeMap::new();
        let mut idle = 0;
        while idle < self.size() {
            let report = self.reports.recv().map_err(|_| {
                SyncError::PoolProtocol(format!(
                    "workers stopped after {} of {} idle reports",
                    idle,
                    self.size()
                ))
            })?;
            match report {
                Report::Idle { worker, results } => {
                    for (index, output) in results {
                        merged.entry(index).or_default().extend(output);
                    }
                    debug!("Worker {} idle", worker);
                    idle += 1;
                }
                Report::Stopped { worker, panicked: true, .. } => {
                    return Err(SyncError::WorkerPanicked(worker));
                }
                Report::Stopped { worker, reason, .. } => {
                    return Err(SyncError::PoolProtocol(format!(
                        "worker {} stopped: {}",
                        worker, reason
                    )));
                }
            }
        }
        Ok((idle, merged))
    }

    fn broadcast<F>(&self, message: F) -> Result<(), SyncError>
    where
        F: Fn() -> Control,
    {
        for (id, control) in self.controls.iter().enumerate() {
            control.send(message()).map_err(|_| {
                SyncError::PoolProtocol(format!("worker {} stopped while idle", id))
            })?;
        }
        Ok(())
    }

    fn join_all(&mut self) -> Result<(), SyncError> {
        let mut first_err = None;
        for (id, handle) in self.handles.drain(..).enumerate() {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(SyncError::WorkerPanicked(id)),
            };
            if let Err(err) = outcome {
                warn!("Worker {} ended abnormally: {}", id, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        // Reached on error paths: wake workers wherever they block.
        for _ in 0..self.handles.len() {
            let _ = self.tasks.send(Task::Exit);
        }
        for control in &self.controls {
            let _ = control.send(Control::Exit);
        }
        let _ = self.join_all();
    }
}

struct Worker {
    id: usize,
    tasks: Arc<Mutex<Receiver<Task>>>,
    reports: Sender<Report>,
    control: Receiver<Control>,
    session: Arc<SessionSnapshot>,
    conditions: Arc<[Arc<dyn Condition>]>,
}

impl Worker {
    /// Run the worker loop. A worker that fails or panics tells the
    /// coordinator before it goes away, so a round never waits on it.
    fn run_reporting_failure(self) -> Result<(), SyncError> {
        let id = self.id;
        let reports = self.reports.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run()));
        let (err, panicked) = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => (err, false),
            Err(_) => (SyncError::WorkerPanicked(id), true),
        };
        warn!("Worker {} stopped: {}", id, err);
        let _ = reports.send(Report::Stopped {
            worker: id,
            panicked,
            reason: err.to_string(),
        });
        Err(err)
    }

    fn run(self) -> Result<(), SyncError> {
        // Results of the current round, keyed by condition index. Several
        // workers evaluate the same condition concurrently, so nothing is
        // written back to the conditions themselves.
        let mut results: BTreeMap<usize, ConditionOutput> = BTreeMap::new();
        loop {
            match self.next_task()? {
                Task::Evaluate(task) => {
                    let condition = self.conditions.get(task.condition).ok_or_else(|| {
                        SyncError::PoolProtocol(format!(
                            "worker {} got unknown condition index {}",
                            self.id, task.condition
                        ))
                    })?;
                    let output = condition.evaluate(&self.session, &task.driver, &task.candidate);
                    results.entry(task.condition).or_default().extend(output);
                }
                Task::Idle => {
                    let report = Report::Idle {
                        worker: self.id,
                        results: mem::take(&mut results),
                    };
                    self.reports.send(report).map_err(|_| {
                        SyncError::PoolProtocol(format!("worker {}: coordinator is gone", self.id))
                    })?;
                    match self.control.recv() {
                        Ok(Control::Resume) => continue,
                        Ok(Control::Exit) => {
                            debug!("Worker {} exiting", self.id);
                            return Ok(());
                        }
                        Err(_) => {
                            return Err(SyncError::PoolProtocol(format!(
                                "worker {}: control channel closed while idle",
                                self.id
                            )))
                        }
                    }
                }
                Task::Exit => return Ok(()),
            }
        }
    }

    fn next_task(&self) -> Result<Task, SyncError> {
        let queue = self.tasks.lock().map_err(|_| {
            SyncError::PoolProtocol(format!("worker {}: task queue lock poisoned", self.id))
        })?;
        queue
            .recv()
            .map_err(|_| SyncError::PoolProtocol(format!("worker {}: task queue closed", self.id)))
    }
}
