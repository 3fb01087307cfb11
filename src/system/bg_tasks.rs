// src/system/bg_tasks.rs

//! Delayed commands running on their own threads.
//!
//! Every task owns an output buffer and reports its outcome once over a
//! one-shot channel. The scheduler keeps the tasks in schedule order.

use chrono::{DateTime, Local};
use colored::Colorize;
use indexmap::IndexMap;
use std::any::Any;
use std::cell::Cell;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

thread_local! {
    static IN_BG_TASK: Cell<bool> = const { Cell::new(false) };
}

/// True on a background task's thread.
pub fn is_in_bg_task() -> bool {
    IN_BG_TASK.with(Cell::get)
}

/// What a task reports when it ends: `Err` carries the failure text.
pub type TaskOutcome = Result<(), String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BgTaskError {
    #[error("Cannot schedule '{0}' from inside a background task.")]
    NestedSchedule(String),
    #[error("No background task with id '{0}'.")]
    NotFound(String),
    #[error("Background task '{id}' ({name}) failed: {reason}")]
    TaskFailed {
        id: String,
        name: String,
        reason: String,
    },
    #[error("Background task '{id}' ({name}) ended without reporting a result.")]
    Lost { id: String, name: String },
    #[error("Could not start background task '{name}': {reason}")]
    Spawn { name: String, reason: String },
    #[error("Cannot wait for background tasks from inside a background task.")]
    WaitInsideTask,
}

#[derive(Debug, Default)]
struct OutputState {
    buffer: Vec<u8>,
    /// How much of `buffer` has already reached the terminal.
    shown: usize,
    attached: bool,
}

/// A task's stdout. Captured while detached, streamed to the terminal once attached.
#[derive(Debug, Clone, Default)]
pub struct BgTaskOutput {
    inner: Arc<Mutex<OutputState>>,
}

impl BgTaskOutput {
    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prints whatever was captured so far and streams from now on.
    pub fn attach(&self) -> io::Result<()> {
        let mut state = self.lock();
        let pending = state.buffer.get(state.shown..).unwrap_or_default().to_vec();
        let mut stdout = io::stdout().lock();
        stdout.write_all(&pending)?;
        stdout.flush()?;
        state.shown = state.buffer.len();
        state.attached = true;
        Ok(())
    }

    pub fn detach(&self) {
        self.lock().attached = false;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    /// Everything the task wrote, shown or not.
    pub fn captured(&self) -> String {
        String::from_utf8_lossy(&self.lock().buffer).into_owned()
    }
}

impl Write for BgTaskOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.buffer.extend_from_slice(buf);
        if state.attached {
            io::stdout().write_all(buf)?;
            state.shown = state.buffer.len();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.lock().attached {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Handed to the job when its delay has elapsed.
#[derive(Debug, Clone)]
pub struct BgTaskCtx {
    pub id: String,
    pub out: BgTaskOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgTaskState {
    /// Sleeping until its delay elapses.
    Scheduled,
    Running,
    Done(TaskOutcome),
}

/// A read-only view of one task.
#[derive(Debug, Clone)]
pub struct BgTaskInfo {
    pub id: String,
    pub name: String,
    pub scheduled_at: DateTime<Local>,
    pub delay: Duration,
    pub state: BgTaskState,
    pub awaited: bool,
}

#[derive(Debug)]
struct BgTask {
    name: String,
    scheduled_at: DateTime<Local>,
    delay: Duration,
    output: BgTaskOutput,
    state: Arc<Mutex<BgTaskState>>,
    done: Option<oneshot::Receiver<TaskOutcome>>,
    handle: Option<JoinHandle<()>>,
}

impl BgTask {
    fn state(&self) -> BgTaskState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The table of scheduled tasks, oldest first.
#[derive(Debug, Default)]
pub struct BgTaskScheduler {
    tasks: Mutex<IndexMap<String, BgTask>>,
}

impl BgTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, BgTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts `job` on its own thread after `delay` and returns the task id at once.
    ///
    /// Only the main line of execution may schedule. A panic inside the job ends
    /// the whole process.
    pub fn schedule<F>(&self, name: &str, delay: Duration, job: F) -> Result<String, BgTaskError>
    where
        F: FnOnce(BgTaskCtx) -> TaskOutcome + Send + 'static,
    {
        if is_in_bg_task() {
            return Err(BgTaskError::NestedSchedule(name.to_string()));
        }

        let id = Uuid::new_v4().simple().to_string();
        let output = BgTaskOutput::default();
        let state = Arc::new(Mutex::new(BgTaskState::Scheduled));
        let (tx, rx) = oneshot::channel();

        let ctx = BgTaskCtx {
            id: id.clone(),
            out: output.clone(),
        };
        let thread_state = Arc::clone(&state);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("bg-{}", name))
            .spawn(move || {
                IN_BG_TASK.with(|flag| flag.set(true));
                thread::sleep(delay);
                set_state(&thread_state, BgTaskState::Running);

                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job(ctx))) {
                    Ok(outcome) => outcome,
                    Err(payload) => report_panic_and_exit(&thread_name, payload.as_ref()),
                };
                set_state(&thread_state, BgTaskState::Done(outcome.clone()));
                if tx.send(outcome).is_err() {
                    log::debug!("Nobody is waiting for background task '{}'", thread_name);
                }
            })
            .map_err(|e| BgTaskError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        log::debug!("Scheduled '{}' as background task {} (delay {:?})", name, id, delay);
        self.lock().insert(
            id.clone(),
            BgTask {
                name: name.to_string(),
                scheduled_at: Local::now(),
                delay,
                output,
                state,
                done: Some(rx),
                handle: Some(handle),
            },
        );
        Ok(id)
    }

    /// The oldest task nobody has waited for yet.
    pub fn get_earliest_task(&self) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, t)| t.done.is_some())
            .map(|(id, _)| id.clone())
    }

    /// The most recently scheduled task nobody has waited for yet.
    pub fn get_latest_task(&self) -> Option<String> {
        self.lock()
            .iter()
            .rev()
            .find(|(_, t)| t.done.is_some())
            .map(|(id, _)| id.clone())
    }

    /// The latest task scheduled under `name`.
    pub fn get_task_by_cmd(&self, name: &str) -> Option<String> {
        self.lock()
            .iter()
            .rev()
            .find(|(_, t)| t.name == name)
            .map(|(id, _)| id.clone())
    }

    /// Resolves an id or a command name to a task id.
    pub fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.lock().contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.get_task_by_cmd(id_or_name)
    }

    pub fn tasks(&self) -> Vec<BgTaskInfo> {
        self.lock()
            .iter()
            .map(|(id, t)| BgTaskInfo {
                id: id.clone(),
                name: t.name.clone(),
                scheduled_at: t.scheduled_at,
                delay: t.delay,
                state: t.state(),
                awaited: t.done.is_none(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn status(&self, id: &str) -> Result<BgTaskState, BgTaskError> {
        self.lock()
            .get(id)
            .map(BgTask::state)
            .ok_or_else(|| BgTaskError::NotFound(id.to_string()))
    }

    pub fn captured_output(&self, id: &str) -> Result<String, BgTaskError> {
        self.lock()
            .get(id)
            .map(|t| t.output.captured())
            .ok_or_else(|| BgTaskError::NotFound(id.to_string()))
    }

    /// Sends the task's output to the terminal; every other task goes back to capturing.
    pub fn bring_to_front(&self, id: &str) -> Result<(), BgTaskError> {
        let tasks = self.lock();
        let target = tasks
            .get(id)
            .ok_or_else(|| BgTaskError::NotFound(id.to_string()))?;
        for (other_id, task) in tasks.iter() {
            if other_id != id {
                task.output.detach();
            }
        }
        if let Err(e) = target.output.attach() {
            log::warn!("Could not show output of background task {}: {}", id, e);
        }
        Ok(())
    }

    /// Blocks until the task ends and returns its outcome.
    ///
    /// Refused on a background task's thread, which may be the task itself.
    pub fn wait_for_finish(&self, id: &str) -> Result<(), BgTaskError> {
        if is_in_bg_task() {
            return Err(BgTaskError::WaitInsideTask);
        }
        let (name, receiver, handle, state) = {
            let mut tasks = self.lock();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| BgTaskError::NotFound(id.to_string()))?;
            (
                task.name.clone(),
                task.done.take(),
                task.handle.take(),
                Arc::clone(&task.state),
            )
        };

        let outcome = match receiver {
            Some(rx) => rx.blocking_recv().ok(),
            None => match state.lock().unwrap_or_else(PoisonError::into_inner).clone() {
                BgTaskState::Done(outcome) => Some(outcome),
                _ => None,
            },
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("Background task thread {} did not exit cleanly", id);
            }
        }

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(BgTaskError::TaskFailed {
                id: id.to_string(),
                name,
                reason,
            }),
            None => Err(BgTaskError::Lost {
                id: id.to_string(),
                name,
            }),
        }
    }

    /// Waits for every task nobody has waited for, oldest first, and returns the failures.
    pub fn wait_for_all_bg_tasks_finish(&self) -> Vec<BgTaskError> {
        if is_in_bg_task() {
            return vec![BgTaskError::WaitInsideTask];
        }
        let mut errors = Vec::new();
        while let Some(id) = self.get_earliest_task() {
            log::debug!("Waiting for background task {}", id);
            if let Err(e) = self.wait_for_finish(&id) {
                errors.push(e);
            }
        }
        errors
    }
}

fn set_state(state: &Mutex<BgTaskState>, next: BgTaskState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

fn report_panic_and_exit(name: &str, payload: &(dyn Any + Send)) -> ! {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    eprintln!(
        "\n{}\n  {}: {}\n  {}: {}\n",
        "Background task panicked".red().bold(),
        "task".yellow(),
        name,
        "reason".yellow(),
        message
    );
    std::process::exit(1);
}
