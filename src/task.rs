//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! In-flight asynchronous callback invocations.
//!
//! In cooperative mode the dispatch trampoline cannot block on the user's
//! future: it schedules it as a [`Task`], returns a shelve status to the
//! engine and consumes the result on a later re-delivery of the same event.
//! The registry guarantees at most one live task per `(event, request-id)`
//! key, so repeated re-deliveries re-poll instead of re-scheduling.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::data::DataTree;
use crate::dispatch::panic_message;
use crate::error::{Error, Result};
use crate::subscription::Event;

/// Result of one asynchronous callback invocation.
pub(crate) type TaskResult = Result<Option<DataTree>>;

/// Identity of one in-flight delivery. `event` is `None` for callback
/// classes without a phase (operational data, notifications).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct TaskKey {
    pub event: Option<Event>,
    pub request_id: u32,
}

impl TaskKey {
    pub(crate) fn new(event: Option<Event>, request_id: u32) -> TaskKey {
        TaskKey { event, request_id }
    }
}

#[derive(Debug)]
pub(crate) enum TaskState {
    Pending,
    Done(TaskResult),
    Cancelled,
}

/// Completion snapshot observed by the trampoline without consuming the
/// result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TaskPoll {
    Pending,
    Ready,
    Cancelled,
}

pub(crate) struct Task {
    state: std::sync::Arc<std::sync::Mutex<TaskState>>,
    abort: tokio::task::AbortHandle,
}

impl Task {
    /// Run `fut` on the cooperative runtime. Once the future finishes, the
    /// result is recorded and `on_done` runs; `on_done` is responsible for
    /// re-signaling the engine (reply-bearing events) or consuming the
    /// result (fire-and-forget events). A panic inside the future is caught
    /// and recorded as a callback failure. A cancelled task records nothing
    /// and never invokes `on_done`.
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        fut: BoxFuture<'static, TaskResult>,
        on_done: impl FnOnce() + Send + 'static,
    ) -> Task {
        let state = std::sync::Arc::new(std::sync::Mutex::new(
            TaskState::Pending,
        ));
        let task_state = state.clone();
        let join = runtime.spawn(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    Err(Error::callback_failed(panic_message(payload)))
                }
            };
            {
                let mut state = task_state.lock().unwrap();
                if let TaskState::Cancelled = *state {
                    return;
                }
                *state = TaskState::Done(result);
            }
            on_done();
        });
        Task {
            state,
            abort: join.abort_handle(),
        }
    }

    fn poll(&self) -> TaskPoll {
        match *self.state.lock().unwrap() {
            TaskState::Pending => TaskPoll::Pending,
            TaskState::Done(_) => TaskPoll::Ready,
            TaskState::Cancelled => TaskPoll::Cancelled,
        }
    }

    fn cancel(&self) {
        self.abort.abort();
        let mut state = self.state.lock().unwrap();
        if let TaskState::Pending = *state {
            *state = TaskState::Cancelled;
        }
    }
}

/// Per-subscription map of in-flight tasks.
///
/// Always accessed under the subscription's mutex: the trampoline may run
/// on an engine thread while task completions run on the cooperative
/// runtime.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: HashMap<TaskKey, Task>,
}

impl TaskRegistry {
    pub(crate) fn new() -> TaskRegistry {
        TaskRegistry {
            tasks: HashMap::new(),
        }
    }

    pub(crate) fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Track a newly spawned task. There must be no live task under `key`.
    pub(crate) fn insert(&mut self, key: TaskKey, task: Task) {
        let previous = self.tasks.insert(key, task);
        debug_assert!(previous.is_none(), "duplicate task for {:?}", key);
    }

    pub(crate) fn poll(&self, key: &TaskKey) -> Option<TaskPoll> {
        self.tasks.get(key).map(Task::poll)
    }

    /// Remove the task and hand out its terminal result. Returns `None`
    /// for unknown keys and for tasks that were cancelled before
    /// completing.
    pub(crate) fn consume(&mut self, key: &TaskKey) -> Option<TaskResult> {
        let task = self.tasks.remove(key)?;
        let state = std::mem::replace(
            &mut *task.state.lock().unwrap(),
            TaskState::Cancelled,
        );
        match state {
            TaskState::Done(result) => Some(result),
            _ => None,
        }
    }

    /// Drop the task without looking at its result.
    pub(crate) fn discard(&mut self, key: &TaskKey) {
        if let Some(task) = self.tasks.remove(key) {
            task.cancel();
        }
    }

    /// Cancel and drop every in-flight task. Used during unsubscribe.
    pub(crate) fn cancel_all(&mut self) {
        for task in self.tasks.values() {
            task.cancel();
        }
        self.tasks.clear();
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.poll() == TaskPoll::Pending)
            .count()
    }
}
