//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! In-memory engine used by the integration tests.
//!
//! Implements the `Engine`/`EngineSession` contract the way the native
//! engine behaves from a client's point of view: edits drive the
//! update/change/done (or abort) pipeline across subscribers in ascending
//! priority order, operational reads pull from data providers, RPCs fan
//! out with abort-on-failure, and subscriptions flagged `NO_THREAD` queue
//! their events until `process_events` is called, re-delivering events
//! shelved with `CallbackShelve`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use sysrepo2::change::{ChangeOperation, DiffRecord};
use sysrepo2::engine::{
    Datastore, Engine, EngineHandle, EngineSession, EventSink, Readiness,
    SubscribeParams, SubscribeTarget,
};
use sysrepo2::error::{Error, ErrorCode, Result};
use sysrepo2::session::{OperGetFlags, SubscriptionFlags};
use sysrepo2::subscription::{Event, NotificationKind};
use sysrepo2::value::DataValue;
use sysrepo2::DataTree;

/// How long a client waits for a queued subscriber to process an event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
enum EditOp {
    Set(String, Option<DataValue>),
    Delete(String),
}

struct Outcome {
    code: ErrorCode,
    error: Option<String>,
}

impl Outcome {
    fn ok() -> Outcome {
        Outcome {
            code: ErrorCode::Ok,
            error: None,
        }
    }

    fn into_result(self) -> Result<()> {
        match self.code {
            ErrorCode::Ok => Ok(()),
            code => Err(match self.error {
                Some(msg) => Error::new(code, msg),
                None => Error::from_code(code),
            }),
        }
    }
}

enum EventKind {
    ModuleChange {
        module: String,
        xpath: Option<String>,
        event: Event,
        request_id: u32,
        records: Vec<DiffRecord>,
        view: DataTree,
        pending: Option<Arc<Mutex<Vec<EditOp>>>>,
    },
    OperGet {
        module: String,
        sub_xpath: String,
        request_xpath: Option<String>,
        request_id: u32,
        parent: Arc<Mutex<DataTree>>,
    },
    Rpc {
        xpath: String,
        input: DataTree,
        event: Event,
        request_id: u32,
        output: Arc<Mutex<DataTree>>,
    },
    Notification {
        kind: NotificationKind,
        xpath: Option<String>,
        payload: DataTree,
        timestamp: SystemTime,
    },
}

type DoneSlot = Arc<(Mutex<Option<Outcome>>, Condvar)>;

struct QueuedEvent {
    kind: EventKind,
    done: DoneSlot,
}

struct SubEntry {
    handle: EngineHandle,
    params: SubscribeParams,
    sink: Arc<dyn EventSink>,
    no_thread: bool,
    queue: Mutex<VecDeque<QueuedEvent>>,
    /// Serializes `process_events` calls so a task completing right after
    /// its event was shelved cannot miss the re-queue.
    dispatch_lock: Mutex<()>,
    readiness_tx: Option<tokio::sync::mpsc::UnboundedSender<()>>,
    readiness_rx: Mutex<Option<Readiness>>,
}

struct Inner {
    datastores: Mutex<HashMap<Datastore, DataTree>>,
    subs: Mutex<HashMap<u64, Arc<SubEntry>>>,
    next_handle: AtomicU64,
    next_request: AtomicU32,
    /// Path prefixes the fake schema knows; empty means everything is
    /// known.
    known_paths: Mutex<Vec<String>>,
    notif_log: Mutex<Vec<(String, DataTree, SystemTime)>>,
}

/// The test engine. Wrap it in an `Arc` and hand it to
/// `sysrepo2::Connection::new`.
pub struct TestEngine {
    inner: Arc<Inner>,
}

impl TestEngine {
    pub fn new() -> TestEngine {
        TestEngine {
            inner: Arc::new(Inner {
                datastores: Mutex::new(HashMap::new()),
                subs: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                next_request: AtomicU32::new(1),
                known_paths: Mutex::new(Vec::new()),
                notif_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Write directly into a datastore, bypassing the change pipeline.
    pub fn seed(
        &self,
        datastore: Datastore,
        xpath: &str,
        value: Option<DataValue>,
    ) {
        let mut stores = self.inner.datastores.lock().unwrap();
        stores
            .entry(datastore)
            .or_insert_with(DataTree::new)
            .set(xpath, value)
            .unwrap();
    }

    /// Current content of a datastore.
    pub fn dump(&self, datastore: Datastore) -> DataTree {
        let stores = self.inner.datastores.lock().unwrap();
        stores.get(&datastore).cloned().unwrap_or_default()
    }

    /// Restrict the fake schema to the given path prefixes; anything else
    /// becomes an unknown node.
    pub fn restrict_schema(&self, prefixes: &[&str]) {
        *self.inner.known_paths.lock().unwrap() =
            prefixes.iter().map(|p| (*p).to_owned()).collect();
    }

    /// Number of live registrations.
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().unwrap().len()
    }
}

impl Engine for TestEngine {
    fn session_start(
        &self,
        datastore: Datastore,
    ) -> Result<Box<dyn EngineSession>> {
        Ok(Box::new(ClientSession {
            inner: self.inner.clone(),
            datastore,
            staged: Vec::new(),
        }))
    }

    fn subscribe(
        &self,
        params: SubscribeParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<EngineHandle> {
        let handle =
            EngineHandle(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        let no_thread = params.flags.contains(SubscriptionFlags::NO_THREAD);
        let (tx, rx) = if no_thread {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let entry = Arc::new(SubEntry {
            handle,
            params: params.clone(),
            sink,
            no_thread,
            queue: Mutex::new(VecDeque::new()),
            dispatch_lock: Mutex::new(()),
            readiness_tx: tx,
            readiness_rx: Mutex::new(rx),
        });
        self.inner.subs.lock().unwrap().insert(handle.0, entry.clone());

        match &params.target {
            SubscribeTarget::ModuleChange { module, xpath } => {
                if params.flags.contains(SubscriptionFlags::ENABLED) {
                    self.inner.deliver_enabled(&entry, module, xpath.clone());
                }
            }
            SubscribeTarget::Notification {
                module, start_time, ..
            } => {
                if let Some(start) = start_time {
                    self.inner.deliver_replay(&entry, module, *start);
                }
            }
            _ => (),
        }
        Ok(handle)
    }

    fn unsubscribe(&self, handle: EngineHandle) -> Result<()> {
        let entry = self
            .inner
            .subs
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or_else(|| Error::not_found("unknown subscription handle"))?;
        // Fail events still waiting for this subscriber so clients do not
        // block until their timeout. Taking the dispatch lock first lets a
        // concurrent process_events finish re-queueing shelved events.
        let _guard = entry.dispatch_lock.lock().unwrap();
        let mut queue = entry.queue.lock().unwrap();
        for event in queue.drain(..) {
            complete(
                &event.done,
                Outcome {
                    code: ErrorCode::CallbackFailed,
                    error: Some("subscription was released".to_owned()),
                },
            );
        }
        Ok(())
    }

    fn process_events(&self, handle: EngineHandle) -> Result<()> {
        let entry = self
            .inner
            .subs
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Error::not_found("unknown subscription handle"))?;
        let _guard = entry.dispatch_lock.lock().unwrap();
        let mut pending: VecDeque<QueuedEvent> =
            std::mem::take(&mut *entry.queue.lock().unwrap());
        let mut shelved = VecDeque::new();
        while let Some(event) = pending.pop_front() {
            let outcome = self.inner.dispatch_now(&entry, &event.kind);
            if outcome.code == ErrorCode::CallbackShelve {
                shelved.push_back(event);
            } else {
                complete(&event.done, outcome);
            }
        }
        // Keep shelved events queued; delivery order is preserved for any
        // events that arrived while dispatching.
        let mut queue = entry.queue.lock().unwrap();
        while let Some(event) = queue.pop_front() {
            shelved.push_back(event);
        }
        *queue = shelved;
        Ok(())
    }

    fn readiness(&self, handle: EngineHandle) -> Result<Readiness> {
        let entry = self
            .inner
            .subs
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Error::not_found("unknown subscription handle"))?;
        let readiness = entry
            .readiness_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                Error::inval_arg("subscription has no readiness source")
            });
        readiness
    }
}

fn complete(done: &DoneSlot, outcome: Outcome) {
    let (lock, cvar) = &**done;
    *lock.lock().unwrap() = Some(outcome);
    cvar.notify_all();
}

impl Inner {
    fn next_request_id(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::SeqCst)
    }

    fn tree(&self, datastore: Datastore) -> DataTree {
        self.datastores
            .lock()
            .unwrap()
            .get(&datastore)
            .cloned()
            .unwrap_or_default()
    }

    fn store(&self, datastore: Datastore, tree: DataTree) {
        self.datastores.lock().unwrap().insert(datastore, tree);
    }

    fn unknown_nodes(&self, tree: &DataTree) -> Vec<String> {
        let known = self.known_paths.lock().unwrap();
        if known.is_empty() {
            return Vec::new();
        }
        tree.paths()
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| {
                !known
                    .iter()
                    .any(|k| path.starts_with(k.as_str()) || k.starts_with(path.as_str()))
            })
            .collect()
    }

    fn sorted_subs(
        &self,
        filter: impl Fn(&SubEntry) -> bool,
    ) -> Vec<Arc<SubEntry>> {
        let mut subs: Vec<_> = self
            .subs
            .lock()
            .unwrap()
            .values()
            .filter(|entry| filter(entry))
            .cloned()
            .collect();
        // Lower numeric priority runs first; handle order breaks ties.
        subs.sort_by_key(|entry| (entry.params.priority, entry.handle.0));
        subs
    }

    /// Deliver one event, either inline (dedicated-thread subscriptions)
    /// or through the subscription's queue and readiness channel.
    fn deliver(
        self: &Arc<Self>,
        entry: &Arc<SubEntry>,
        kind: EventKind,
    ) -> Outcome {
        if !entry.no_thread {
            return self.dispatch_now(entry, &kind);
        }
        let done: DoneSlot = Arc::new((Mutex::new(None), Condvar::new()));
        entry.queue.lock().unwrap().push_back(QueuedEvent {
            kind,
            done: done.clone(),
        });
        if let Some(tx) = &entry.readiness_tx {
            let _ = tx.send(());
        }
        let (lock, cvar) = &*done;
        let deadline = Instant::now() + EVENT_TIMEOUT;
        let mut slot = lock.lock().unwrap();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Outcome {
                    code: ErrorCode::Timeout,
                    error: Some("subscriber did not process the event".to_owned()),
                };
            }
            let (guard, _) = cvar.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }

    /// Enqueue without waiting for the result. Used for deliveries the
    /// engine never waits on (enabled replay at subscribe time).
    fn deliver_detached(self: &Arc<Self>, entry: &Arc<SubEntry>, kind: EventKind) {
        if !entry.no_thread {
            let _ = self.dispatch_now(entry, &kind);
            return;
        }
        let done: DoneSlot = Arc::new((Mutex::new(None), Condvar::new()));
        entry.queue.lock().unwrap().push_back(QueuedEvent { kind, done });
        if let Some(tx) = &entry.readiness_tx {
            let _ = tx.send(());
        }
    }

    /// Invoke the subscription's sink for one event.
    fn dispatch_now(
        self: &Arc<Self>,
        entry: &Arc<SubEntry>,
        kind: &EventKind,
    ) -> Outcome {
        let error = Arc::new(Mutex::new(None));
        let code = match kind {
            EventKind::ModuleChange {
                module,
                xpath,
                event,
                request_id,
                records,
                view,
                pending,
            } => {
                let mut session = EventSession {
                    inner: self.clone(),
                    datastore: Datastore::Running,
                    records: records.clone(),
                    view: Some(view.clone()),
                    pending: pending.clone(),
                    error: error.clone(),
                };
                entry.sink.module_change(
                    &mut session,
                    module,
                    xpath.as_deref(),
                    *event,
                    *request_id,
                )
            }
            EventKind::OperGet {
                module,
                sub_xpath,
                request_xpath,
                request_id,
                parent,
            } => {
                let mut session = EventSession {
                    inner: self.clone(),
                    datastore: Datastore::Operational,
                    records: Vec::new(),
                    view: None,
                    pending: None,
                    error: error.clone(),
                };
                let mut parent = parent.lock().unwrap();
                entry.sink.oper_get(
                    &mut session,
                    module,
                    sub_xpath,
                    request_xpath.as_deref(),
                    *request_id,
                    &mut parent,
                )
            }
            EventKind::Rpc {
                xpath,
                input,
                event,
                request_id,
                output,
            } => {
                let mut session = EventSession {
                    inner: self.clone(),
                    datastore: Datastore::Operational,
                    records: Vec::new(),
                    view: None,
                    pending: None,
                    error: error.clone(),
                };
                let mut output = output.lock().unwrap();
                entry.sink.rpc(
                    &mut session,
                    xpath,
                    input,
                    *event,
                    *request_id,
                    &mut output,
                )
            }
            EventKind::Notification {
                kind,
                xpath,
                payload,
                timestamp,
            } => {
                let mut session = EventSession {
                    inner: self.clone(),
                    datastore: Datastore::Operational,
                    records: Vec::new(),
                    view: None,
                    pending: None,
                    error: error.clone(),
                };
                entry.sink.notification(
                    &mut session,
                    *kind,
                    xpath.as_deref(),
                    payload,
                    *timestamp,
                )
            }
        };
        let error = error.lock().unwrap().take();
        Outcome { code, error }
    }

    /// The commit pipeline: update phase, change phase (with abort
    /// rollback), storage, done phase.
    fn commit(
        self: &Arc<Self>,
        datastore: Datastore,
        staged: Vec<EditOp>,
    ) -> Result<()> {
        let request_id = self.next_request_id();
        let old = self.tree(datastore);
        let pending = Arc::new(Mutex::new(staged));

        // Update phase: subscribers may amend the edit.
        let updaters = self.sorted_subs(|entry| {
            matches!(
                entry.params.target,
                SubscribeTarget::ModuleChange { .. }
            ) && entry.params.flags.contains(SubscriptionFlags::UPDATE)
        });
        for entry in &updaters {
            let (module, xpath) = module_change_target(&entry.params.target);
            let new = apply_edits(&old, &pending.lock().unwrap())?;
            let records = module_records(&old, &new, &module);
            if records.is_empty() {
                continue;
            }
            let outcome = self.deliver(
                entry,
                EventKind::ModuleChange {
                    module,
                    xpath,
                    event: Event::Update,
                    request_id,
                    records,
                    view: new,
                    pending: Some(pending.clone()),
                },
            );
            outcome.into_result()?;
        }

        let new = apply_edits(&old, &pending.lock().unwrap())?;
        let records = diff_trees(&old, &new);
        if records.is_empty() {
            return Ok(());
        }

        // Change phase: any failure aborts subscribers that already
        // accepted, in reverse order.
        let verifiers = self.sorted_subs(|entry| {
            matches!(
                entry.params.target,
                SubscribeTarget::ModuleChange { .. }
            ) && !entry.params.flags.contains(SubscriptionFlags::DONE_ONLY)
        });
        let mut accepted: Vec<(Arc<SubEntry>, String, Option<String>)> =
            Vec::new();
        for entry in &verifiers {
            let (module, xpath) = module_change_target(&entry.params.target);
            let records = filter_records(&records, &module);
            if records.is_empty() {
                continue;
            }
            let outcome = self.deliver(
                entry,
                EventKind::ModuleChange {
                    module: module.clone(),
                    xpath: xpath.clone(),
                    event: Event::Change,
                    request_id,
                    records,
                    view: new.clone(),
                    pending: None,
                },
            );
            if outcome.code != ErrorCode::Ok {
                for (entry, module, xpath) in accepted.into_iter().rev() {
                    let records = filter_records(&records_for_abort(&old, &new), &module);
                    self.deliver(
                        &entry,
                        EventKind::ModuleChange {
                            module,
                            xpath,
                            event: Event::Abort,
                            request_id,
                            records,
                            view: old.clone(),
                            pending: None,
                        },
                    );
                }
                return outcome.into_result();
            }
            accepted.push((entry.clone(), module, xpath));
        }

        self.store(datastore, new.clone());

        // Done phase: informational, failures never surface.
        let observers = self.sorted_subs(|entry| {
            matches!(entry.params.target, SubscribeTarget::ModuleChange { .. })
        });
        for entry in &observers {
            let (module, xpath) = module_change_target(&entry.params.target);
            let records = filter_records(&records, &module);
            if records.is_empty() {
                continue;
            }
            self.deliver(
                entry,
                EventKind::ModuleChange {
                    module,
                    xpath,
                    event: Event::Done,
                    request_id,
                    records,
                    view: new.clone(),
                    pending: None,
                },
            );
        }
        Ok(())
    }

    /// Operational read: stored data plus provider contributions.
    fn read(
        self: &Arc<Self>,
        datastore: Datastore,
        xpath: &str,
        flags: OperGetFlags,
    ) -> Result<DataTree> {
        let module = module_of(xpath)?;
        let base = match datastore {
            // The operational datastore is backed by running config.
            Datastore::Operational => self.tree(Datastore::Running),
            other => self.tree(other),
        };
        let mut result = subtree(&base, &module);
        if datastore == Datastore::Operational
            && !flags.contains(OperGetFlags::NO_SUBS)
        {
            let providers = self.sorted_subs(|entry| {
                matches!(
                    &entry.params.target,
                    SubscribeTarget::OperGet { module: m, .. } if *m == module
                )
            });
            for entry in &providers {
                let sub_xpath = match &entry.params.target {
                    SubscribeTarget::OperGet { xpath, .. } => xpath.clone(),
                    _ => unreachable!(),
                };
                let parent = Arc::new(Mutex::new(result));
                let outcome = self.deliver(
                    entry,
                    EventKind::OperGet {
                        module: module.clone(),
                        sub_xpath,
                        request_xpath: Some(xpath.to_owned()),
                        request_id: self.next_request_id(),
                        parent: parent.clone(),
                    },
                );
                result = std::mem::take(&mut *parent.lock().unwrap());
                outcome.into_result()?;
            }
        }
        if result.is_empty() {
            return Err(Error::not_found(format!("no data at {}", xpath)));
        }
        Ok(result)
    }

    /// RPC fan-out in ascending priority order; a failure aborts
    /// subscribers that already produced output.
    fn rpc(self: &Arc<Self>, xpath: &str, input: DataTree) -> Result<DataTree> {
        let handlers = self.sorted_subs(|entry| {
            matches!(
                &entry.params.target,
                SubscribeTarget::Rpc { xpath: x } if x.as_str() == xpath
            )
        });
        if handlers.is_empty() {
            return Err(Error::not_found(format!(
                "no subscriber for rpc {}",
                xpath
            )));
        }
        let request_id = self.next_request_id();
        let output = Arc::new(Mutex::new(DataTree::new()));
        let mut accepted = Vec::new();
        for entry in &handlers {
            let outcome = self.deliver(
                entry,
                EventKind::Rpc {
                    xpath: xpath.to_owned(),
                    input: input.clone(),
                    event: Event::Rpc,
                    request_id,
                    output: output.clone(),
                },
            );
            if outcome.code != ErrorCode::Ok {
                for entry in accepted.into_iter().rev() {
                    let discarded = Arc::new(Mutex::new(DataTree::new()));
                    self.deliver(
                        entry,
                        EventKind::Rpc {
                            xpath: xpath.to_owned(),
                            input: input.clone(),
                            event: Event::Abort,
                            request_id,
                            output: discarded,
                        },
                    );
                }
                match outcome.into_result() {
                    Err(err) => return Err(err),
                    Ok(()) => unreachable!(),
                }
            }
            accepted.push(entry);
        }
        let output = std::mem::take(&mut *output.lock().unwrap());
        Ok(output)
    }

    fn send_notification(
        self: &Arc<Self>,
        xpath: &str,
        payload: DataTree,
    ) -> Result<()> {
        let module = module_of(xpath)?;
        let timestamp = SystemTime::now();
        self.notif_log.lock().unwrap().push((
            xpath.to_owned(),
            payload.clone(),
            timestamp,
        ));
        let receivers = self.sorted_subs(|entry| {
            matches!(
                &entry.params.target,
                SubscribeTarget::Notification { module: m, .. } if *m == module
            )
        });
        for entry in &receivers {
            self.deliver(
                entry,
                EventKind::Notification {
                    kind: NotificationKind::Realtime,
                    xpath: Some(xpath.to_owned()),
                    payload: payload.clone(),
                    timestamp,
                },
            );
        }
        Ok(())
    }

    /// Enabled delivery at subscribe time: the current configuration is
    /// presented as a batch of created records.
    fn deliver_enabled(
        self: &Arc<Self>,
        entry: &Arc<SubEntry>,
        module: &str,
        xpath: Option<String>,
    ) {
        let current = self.tree(Datastore::Running);
        let records = module_records(&DataTree::new(), &current, module);
        let request_id = self.next_request_id();
        for event in [Event::Enabled, Event::Done] {
            self.deliver_detached(
                entry,
                EventKind::ModuleChange {
                    module: module.to_owned(),
                    xpath: xpath.clone(),
                    event,
                    request_id,
                    records: records.clone(),
                    view: current.clone(),
                    pending: None,
                },
            );
        }
    }

    /// Replay stored notifications to a new subscriber.
    fn deliver_replay(
        self: &Arc<Self>,
        entry: &Arc<SubEntry>,
        module: &str,
        start: SystemTime,
    ) {
        let log = self.notif_log.lock().unwrap().clone();
        for (xpath, payload, timestamp) in log {
            if timestamp < start {
                continue;
            }
            match module_of(&xpath) {
                Ok(m) if m == module => (),
                _ => continue,
            }
            self.deliver_detached(
                entry,
                EventKind::Notification {
                    kind: NotificationKind::Replay,
                    xpath: Some(xpath),
                    payload,
                    timestamp,
                },
            );
        }
        self.deliver_detached(
            entry,
            EventKind::Notification {
                kind: NotificationKind::ReplayComplete,
                xpath: None,
                payload: DataTree::new(),
                timestamp: SystemTime::now(),
            },
        );
    }
}

/// The explicit session handed to clients.
struct ClientSession {
    inner: Arc<Inner>,
    datastore: Datastore,
    staged: Vec<EditOp>,
}

impl EngineSession for ClientSession {
    fn datastore(&self) -> Datastore {
        self.datastore
    }

    fn switch_datastore(&mut self, datastore: Datastore) -> Result<()> {
        self.datastore = datastore;
        Ok(())
    }

    fn get_data(&self, xpath: &str, flags: OperGetFlags) -> Result<DataTree> {
        self.inner.read(self.datastore, xpath, flags)
    }

    fn diff(&self, _xpath: &str) -> Result<Vec<DiffRecord>> {
        Err(Error::unsupported("diff outside a module-change event"))
    }

    fn set_item(
        &mut self,
        xpath: &str,
        value: Option<DataValue>,
    ) -> Result<()> {
        self.staged.push(EditOp::Set(xpath.to_owned(), value));
        Ok(())
    }

    fn delete_item(&mut self, xpath: &str) -> Result<()> {
        self.staged.push(EditOp::Delete(xpath.to_owned()));
        Ok(())
    }

    fn apply_changes(&mut self, _timeout: Option<Duration>) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        self.inner.commit(self.datastore, staged)
    }

    fn discard_changes(&mut self) -> Result<()> {
        self.staged.clear();
        Ok(())
    }

    fn validate(&mut self, _module: Option<&str>) -> Result<()> {
        let old = self.inner.tree(self.datastore);
        apply_edits(&old, &self.staged).map(|_| ())
    }

    fn rpc_send(
        &mut self,
        xpath: &str,
        input: DataTree,
        _timeout: Option<Duration>,
    ) -> Result<DataTree> {
        self.inner.rpc(xpath, input)
    }

    fn notification_send(
        &mut self,
        xpath: &str,
        payload: DataTree,
    ) -> Result<()> {
        self.inner.send_notification(xpath, payload)
    }

    fn set_error(&mut self, _message: &str) {}

    fn unknown_nodes(&self, tree: &DataTree) -> Vec<String> {
        self.inner.unknown_nodes(tree)
    }

    fn originator_name(&self) -> Option<String> {
        None
    }

    fn netconf_id(&self) -> Option<u32> {
        None
    }

    fn user(&self) -> Option<String> {
        None
    }
}

/// The implicit session the engine hands to sinks during event delivery.
struct EventSession {
    inner: Arc<Inner>,
    datastore: Datastore,
    records: Vec<DiffRecord>,
    /// The post-edit configuration during module-change events.
    view: Option<DataTree>,
    pending: Option<Arc<Mutex<Vec<EditOp>>>>,
    error: Arc<Mutex<Option<String>>>,
}

impl EngineSession for EventSession {
    fn datastore(&self) -> Datastore {
        self.datastore
    }

    fn switch_datastore(&mut self, _datastore: Datastore) -> Result<()> {
        Err(Error::unsupported("implicit sessions are fixed"))
    }

    fn get_data(&self, xpath: &str, _flags: OperGetFlags) -> Result<DataTree> {
        let base = match &self.view {
            Some(view) => view.clone(),
            None => self.inner.tree(Datastore::Running),
        };
        let result = subtree(&base, &module_of(xpath)?);
        if result.is_empty() {
            return Err(Error::not_found(format!("no data at {}", xpath)));
        }
        Ok(result)
    }

    fn diff(&self, _xpath: &str) -> Result<Vec<DiffRecord>> {
        Ok(self.records.clone())
    }

    fn set_item(
        &mut self,
        xpath: &str,
        value: Option<DataValue>,
    ) -> Result<()> {
        match &self.pending {
            Some(pending) => {
                pending
                    .lock()
                    .unwrap()
                    .push(EditOp::Set(xpath.to_owned(), value));
                Ok(())
            }
            None => {
                Err(Error::unsupported("no update event in progress"))
            }
        }
    }

    fn delete_item(&mut self, xpath: &str) -> Result<()> {
        match &self.pending {
            Some(pending) => {
                pending
                    .lock()
                    .unwrap()
                    .push(EditOp::Delete(xpath.to_owned()));
                Ok(())
            }
            None => {
                Err(Error::unsupported("no update event in progress"))
            }
        }
    }

    fn apply_changes(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Err(Error::unsupported("implicit sessions cannot apply changes"))
    }

    fn discard_changes(&mut self) -> Result<()> {
        Err(Error::unsupported("implicit sessions have no staged edits"))
    }

    fn validate(&mut self, _module: Option<&str>) -> Result<()> {
        Err(Error::unsupported("implicit sessions cannot validate"))
    }

    fn rpc_send(
        &mut self,
        _xpath: &str,
        _input: DataTree,
        _timeout: Option<Duration>,
    ) -> Result<DataTree> {
        Err(Error::unsupported("implicit sessions cannot send rpcs"))
    }

    fn notification_send(
        &mut self,
        xpath: &str,
        payload: DataTree,
    ) -> Result<()> {
        self.inner.send_notification(xpath, payload)
    }

    fn set_error(&mut self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_owned());
    }

    fn unknown_nodes(&self, tree: &DataTree) -> Vec<String> {
        self.inner.unknown_nodes(tree)
    }

    fn originator_name(&self) -> Option<String> {
        Some("tests".to_owned())
    }

    fn netconf_id(&self) -> Option<u32> {
        None
    }

    fn user(&self) -> Option<String> {
        None
    }
}

fn apply_edits(tree: &DataTree, edits: &[EditOp]) -> Result<DataTree> {
    let mut out = tree.clone();
    for edit in edits {
        match edit {
            EditOp::Set(xpath, value) => out.set(xpath, value.clone())?,
            EditOp::Delete(xpath) => out.delete(xpath)?,
        }
    }
    Ok(out)
}

/// Module name of the first path step.
fn module_of(xpath: &str) -> Result<String> {
    sysrepo2::xpath::first_step(xpath)?.prefix.ok_or_else(|| {
        Error::inval_arg(format!("unprefixed xpath: {}", xpath))
    })
}

/// Roots of `tree` belonging to one module.
fn subtree(tree: &DataTree, module: &str) -> DataTree {
    let mut out = DataTree::new();
    for (path, value) in tree.paths() {
        if module_of(&path).map(|m| m == module).unwrap_or(false) {
            out.set(&path, value).unwrap();
        }
    }
    out
}

/// Diff two trees into engine records: creations and modifications in new
/// document order, deletions afterwards.
fn diff_trees(old: &DataTree, new: &DataTree) -> Vec<DiffRecord> {
    let old_paths = old.paths();
    let new_paths = new.paths();
    let old_map: HashMap<&str, &Option<DataValue>> = old_paths
        .iter()
        .map(|(path, value)| (path.as_str(), value))
        .collect();
    let new_map: HashMap<&str, &Option<DataValue>> = new_paths
        .iter()
        .map(|(path, value)| (path.as_str(), value))
        .collect();

    let mut records = Vec::new();
    for (path, value) in &new_paths {
        match old_map.get(path.as_str()) {
            None => records.push(DiffRecord {
                operation: ChangeOperation::Created,
                xpath: path.clone(),
                value: value.clone(),
                prev_value: None,
                prev_list: None,
                prev_default: false,
            }),
            Some(old_value) if *old_value != value => {
                records.push(DiffRecord {
                    operation: ChangeOperation::Modified,
                    xpath: path.clone(),
                    value: value.clone(),
                    prev_value: old_value
                        .as_ref()
                        .map(|v| v.to_canonical()),
                    prev_list: None,
                    prev_default: false,
                })
            }
            Some(_) => (),
        }
    }
    for (path, _) in &old_paths {
        if !new_map.contains_key(path.as_str()) {
            records.push(DiffRecord {
                operation: ChangeOperation::Deleted,
                xpath: path.clone(),
                value: None,
                prev_value: None,
                prev_list: None,
                prev_default: false,
            });
        }
    }
    records
}

fn filter_records(records: &[DiffRecord], module: &str) -> Vec<DiffRecord> {
    records
        .iter()
        .filter(|r| module_of(&r.xpath).map(|m| m == module).unwrap_or(false))
        .cloned()
        .collect()
}

fn module_records(
    old: &DataTree,
    new: &DataTree,
    module: &str,
) -> Vec<DiffRecord> {
    filter_records(&diff_trees(old, new), module)
}

/// Records presented during abort: the inverse view, i.e. the original
/// diff (subscribers roll back what they saw during change).
fn records_for_abort(old: &DataTree, new: &DataTree) -> Vec<DiffRecord> {
    diff_trees(old, new)
}

fn module_change_target(
    target: &SubscribeTarget,
) -> (String, Option<String>) {
    match target {
        SubscribeTarget::ModuleChange { module, xpath } => {
            (module.clone(), xpath.clone())
        }
        _ => unreachable!(),
    }
}

/// Initialize test logging once per binary.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
