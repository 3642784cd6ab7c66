//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Subscriptions.
//!
//! A [`Subscription`] bridges one engine registration to one user callback.
//! It owns the callback, its configuration and, in cooperative mode, the
//! registry of in-flight asynchronous tasks plus the driver listening on
//! the engine's readiness channel.
//!
//! Do not construct subscriptions manually; use the `Session::subscribe_*`
//! methods.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures::future::BoxFuture;

use crate::change::Change;
use crate::data::DataTree;
use crate::dispatch::Dispatcher;
use crate::engine::{Engine, EngineHandle, SubscribeParams};
use crate::error::{Error, Result};
use crate::session::{ImplicitSession, SubscribeOptions};
use crate::task::{TaskKey, TaskPoll, TaskRegistry, TaskResult};

/// Type of a module-change callback event.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Event {
    /// Change to be verified; the callback may amend the edit.
    Update,
    /// Change to be verified; the callback may reject it.
    Change,
    /// Change has been applied.
    Done,
    /// Change was rejected by another subscriber, roll back side effects.
    Abort,
    /// Delivery of the current configuration right after subscribing.
    Enabled,
    /// Delivery of an RPC/action request.
    Rpc,
}

impl Event {
    pub fn name(self) -> &'static str {
        match self {
            Event::Update => "update",
            Event::Change => "change",
            Event::Done => "done",
            Event::Abort => "abort",
            Event::Enabled => "enabled",
            Event::Rpc => "rpc",
        }
    }

    /// Whether a callback failure during this event can still prevent the
    /// operation, and is therefore reported back to the originating client.
    pub(crate) fn is_preventable(self) -> bool {
        matches!(self, Event::Update | Event::Change | Event::Rpc)
    }

    /// Whether the engine waits for this event's result. Results of the
    /// other events are informational only.
    pub(crate) fn needs_reply(self) -> bool {
        matches!(self, Event::Update | Event::Change | Event::Rpc)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Type of a notification delivery.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NotificationKind {
    Realtime,
    Replay,
    ReplayComplete,
    Terminated,
    Suspended,
    Resumed,
}

impl NotificationKind {
    pub fn name(self) -> &'static str {
        match self {
            NotificationKind::Realtime => "realtime",
            NotificationKind::Replay => "replay",
            NotificationKind::ReplayComplete => "replay_complete",
            NotificationKind::Terminated => "terminated",
            NotificationKind::Suspended => "suspended",
            NotificationKind::Resumed => "resumed",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// One distinct callback type per callback class; the shape check the
// engine cannot do for us happens at compile time.
pub type ModuleChangeCallback =
    Box<dyn Fn(Event, u32, &DataTree, &[Change]) -> Result<()> + Send + Sync>;
pub type ModuleChangeAsyncCallback = Box<
    dyn Fn(Event, u32, DataTree, Vec<Change>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;
/// Receives the live implicit session instead of pre-materialized changes.
/// The session borrow ends with the callback; it cannot be retained.
pub type UnsafeModuleChangeCallback = Box<
    dyn Fn(&mut ImplicitSession<'_>, Event, u32) -> Result<()> + Send + Sync,
>;
pub type OperGetCallback =
    Box<dyn Fn(Option<&str>) -> Result<Option<DataTree>> + Send + Sync>;
pub type OperGetAsyncCallback = Box<
    dyn Fn(Option<String>) -> BoxFuture<'static, Result<Option<DataTree>>>
        + Send
        + Sync,
>;
pub type RpcCallback = Box<
    dyn Fn(&str, &DataTree, Event, u32) -> Result<Option<DataTree>>
        + Send
        + Sync,
>;
pub type RpcAsyncCallback = Box<
    dyn Fn(
            String,
            DataTree,
            Event,
            u32,
        ) -> BoxFuture<'static, Result<Option<DataTree>>>
        + Send
        + Sync,
>;
pub type NotificationCallback = Box<
    dyn Fn(NotificationKind, Option<&str>, &DataTree, SystemTime) -> Result<()>
        + Send
        + Sync,
>;
pub type NotificationAsyncCallback = Box<
    dyn Fn(
            NotificationKind,
            Option<String>,
            DataTree,
            SystemTime,
        ) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

pub(crate) enum Callback {
    ModuleChange(ModuleChangeCallback),
    ModuleChangeAsync(ModuleChangeAsyncCallback),
    ModuleChangeUnsafe(UnsafeModuleChangeCallback),
    OperGet(OperGetCallback),
    OperGetAsync(OperGetAsyncCallback),
    Rpc(RpcCallback),
    RpcAsync(RpcAsyncCallback),
    Notification(NotificationCallback),
    NotificationAsync(NotificationAsyncCallback),
}

impl Callback {
    pub(crate) fn is_async(&self) -> bool {
        matches!(
            self,
            Callback::ModuleChangeAsync(_)
                | Callback::OperGetAsync(_)
                | Callback::RpcAsync(_)
                | Callback::NotificationAsync(_)
        )
    }
}

/// Engine-handle state machine: `NotRegistered` → `Active` → `Released`,
/// with `Released` terminal.
enum HandleState {
    NotRegistered,
    Active(EngineHandle),
    Released,
}

struct LifecycleState {
    handle: HandleState,
    driver: Option<tokio::task::AbortHandle>,
}

/// Outcome of polling a cooperative task from the trampoline.
pub(crate) enum TaskOutcome {
    /// Still running; tell the engine to re-deliver later.
    Shelve,
    /// Finished; the result has been consumed.
    Ready(Option<DataTree>),
}

pub(crate) struct SubscriptionCore {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) callback: Callback,
    pub(crate) options: SubscribeOptions,
    /// Runtime the user's futures run on; `None` in threaded mode.
    pub(crate) cooperative: Option<tokio::runtime::Handle>,
    pub(crate) tasks: Mutex<TaskRegistry>,
    state: Mutex<LifecycleState>,
    notif_seq: AtomicU32,
}

impl SubscriptionCore {
    fn active_handle(&self) -> Option<EngineHandle> {
        match self.state.lock().unwrap().handle {
            HandleState::Active(handle) => Some(handle),
            HandleState::NotRegistered | HandleState::Released => None,
        }
    }

    /// Ask the engine to deliver pending events, unless already released.
    pub(crate) fn process_events_if_active(&self) -> Result<()> {
        match self.active_handle() {
            Some(handle) => self.engine.process_events(handle),
            None => Ok(()),
        }
    }

    /// Schedule the user's future as a task under `key`.
    pub(crate) fn spawn_task(
        self: &Arc<Self>,
        tasks: &mut TaskRegistry,
        key: TaskKey,
        fut: BoxFuture<'static, TaskResult>,
        needs_reply: bool,
    ) -> Result<()> {
        let runtime = self.cooperative.as_ref().ok_or_else(|| {
            Error::inval_arg(
                "asynchronous callback invoked without cooperative \
                 registration",
            )
        })?;
        let weak = Arc::downgrade(self);
        let on_done = move || {
            let core = match weak.upgrade() {
                Some(core) => core,
                None => return,
            };
            if needs_reply {
                // Re-signal the engine so the shelved event is re-delivered
                // and the trampoline can return the actual result.
                if let Err(err) = core.process_events_if_active() {
                    log::error!(
                        "failed to process events after task completion: {}",
                        err
                    );
                }
            } else {
                // The engine does not wait for this result; consume it here
                // so errors are not lost.
                if let Some(Err(err)) =
                    core.tasks.lock().unwrap().consume(&key)
                {
                    log::error!("{} task failed: {}", key_name(&key), err);
                }
            }
        };
        tasks.insert(key, crate::task::Task::spawn(runtime, fut, on_done));
        Ok(())
    }

    /// Poll-and-consume step of the shelve/retry protocol.
    ///
    /// Cancelled tasks surface as a callback failure when the event is
    /// preventable and disappear silently otherwise.
    pub(crate) fn take_task(
        &self,
        key: TaskKey,
        preventable: bool,
    ) -> Result<TaskOutcome> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.poll(&key) {
            Some(TaskPoll::Pending) => Ok(TaskOutcome::Shelve),
            Some(TaskPoll::Ready) => match tasks.consume(&key) {
                Some(result) => Ok(TaskOutcome::Ready(result?)),
                None => Err(Error::internal("task result already consumed")),
            },
            Some(TaskPoll::Cancelled) => {
                tasks.discard(&key);
                if preventable {
                    Err(Error::callback_failed("task was cancelled"))
                } else {
                    Ok(TaskOutcome::Ready(None))
                }
            }
            None => Err(Error::internal(format!(
                "no task registered for {}",
                key_name(&key)
            ))),
        }
    }

    pub(crate) fn next_notification_id(&self) -> u32 {
        self.notif_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Run every cleanup step regardless of individual failures; failures
    /// are logged, not returned, so later steps always execute.
    fn release(&self) {
        let (handle, driver) = {
            let mut state = self.state.lock().unwrap();
            let handle = match std::mem::replace(
                &mut state.handle,
                HandleState::Released,
            ) {
                HandleState::Active(handle) => Some(handle),
                HandleState::NotRegistered | HandleState::Released => None,
            };
            (handle, state.driver.take())
        };
        if handle.is_none() && driver.is_none() {
            return;
        }
        if let Some(driver) = driver {
            driver.abort();
        }
        if let Some(handle) = handle {
            if let Err(err) = self.engine.unsubscribe(handle) {
                log::error!("engine unsubscribe failed: {}", err);
            }
        }
        self.tasks.lock().unwrap().cancel_all();
    }
}

impl Drop for SubscriptionCore {
    fn drop(&mut self) {
        self.release();
    }
}

fn key_name(key: &TaskKey) -> String {
    match key.event {
        Some(event) => format!("({}, {})", event, key.request_id),
        None => format!("(request {})", key.request_id),
    }
}

/// One active registration against the datastore engine.
///
/// Cheap to clone; all clones refer to the same registration.
#[derive(Clone)]
pub struct Subscription {
    core: Arc<SubscriptionCore>,
}

impl Subscription {
    /// Register with the engine and, in cooperative mode, start the
    /// readiness driver. Engine failures propagate to the caller.
    pub(crate) fn register(
        engine: Arc<dyn Engine>,
        callback: Callback,
        options: SubscribeOptions,
        cooperative: Option<tokio::runtime::Handle>,
        params: SubscribeParams,
    ) -> Result<Subscription> {
        let core = Arc::new(SubscriptionCore {
            engine: engine.clone(),
            callback,
            options,
            cooperative: cooperative.clone(),
            tasks: Mutex::new(TaskRegistry::new()),
            state: Mutex::new(LifecycleState {
                handle: HandleState::NotRegistered,
                driver: None,
            }),
            notif_seq: AtomicU32::new(0),
        });

        let sink = Arc::new(Dispatcher::new(core.clone()));
        let handle = engine.subscribe(params, sink)?;
        core.state.lock().unwrap().handle = HandleState::Active(handle);

        if let Some(runtime) = cooperative {
            let mut readiness = match engine.readiness(handle) {
                Ok(readiness) => readiness,
                Err(err) => {
                    core.release();
                    return Err(err);
                }
            };
            let driver_engine = engine.clone();
            let driver = runtime.spawn(async move {
                while readiness.recv().await.is_some() {
                    if let Err(err) = driver_engine.process_events(handle) {
                        log::error!("failed to process events: {}", err);
                    }
                }
            });
            core.state.lock().unwrap().driver = Some(driver.abort_handle());
        }

        Ok(Subscription { core })
    }

    /// Release the registration: stop the readiness driver, release the
    /// engine handle, cancel all in-flight tasks. Idempotent; individual
    /// failures are logged and never short-circuit the remaining steps.
    pub fn unsubscribe(&self) {
        self.core.release();
    }

    /// Whether the registration is still active.
    pub fn is_active(&self) -> bool {
        self.core.active_handle().is_some()
    }

    /// Ask the engine to deliver pending events of this subscription.
    ///
    /// Only needed by embeddings driving the readiness channel manually;
    /// cooperative registrations do this automatically.
    pub fn process_events(&self) -> Result<()> {
        match self.core.active_handle() {
            Some(handle) => self.core.engine.process_events(handle),
            None => Err(Error::inval_arg(
                "subscription has already been released",
            )),
        }
    }

    /// Number of in-flight cooperative tasks.
    pub fn pending_tasks(&self) -> usize {
        self.core.tasks.lock().unwrap().pending_count()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .field("cooperative", &self.core.cooperative.is_some())
            .finish()
    }
}
