//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The datastore engine boundary.
//!
//! The engine itself (storage, schema validation, diff computation,
//! inter-process transport) is an external collaborator. This module defines
//! the traits a concrete engine must implement and the structures crossing
//! that boundary. A production embedding backs these traits with the native
//! library's FFI; tests back them with an in-memory engine.
//!
//! Registration does not hand out raw pointers: the engine receives an
//! [`EventSink`] trampoline and later invokes it with a short-lived
//! [`EngineSession`] borrow. The sink must never unwind into the engine; it
//! reports every outcome through an [`ErrorCode`].

use std::time::{Duration, SystemTime};

use crate::change::DiffRecord;
use crate::data::DataTree;
use crate::error::{ErrorCode, Result};
use crate::session::{OperGetFlags, SubscriptionFlags};
use crate::subscription::{Event, NotificationKind};

/// A datastore instance managed by the engine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Datastore {
    Startup,
    Running,
    Candidate,
    Operational,
}

impl Datastore {
    pub fn name(self) -> &'static str {
        match self {
            Datastore::Startup => "startup",
            Datastore::Running => "running",
            Datastore::Candidate => "candidate",
            Datastore::Operational => "operational",
        }
    }
}

impl std::fmt::Display for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Datastore {
    type Err = crate::error::Error;

    fn from_str(name: &str) -> Result<Datastore> {
        match name {
            "startup" => Ok(Datastore::Startup),
            "running" => Ok(Datastore::Running),
            "candidate" => Ok(Datastore::Candidate),
            "operational" => Ok(Datastore::Operational),
            _ => Err(crate::error::Error::inval_arg(format!(
                "unknown datastore name: {:?}",
                name
            ))),
        }
    }
}

/// Opaque identifier of one registration inside the engine.
///
/// Small-integer arena id rather than a pointer; the engine echoes it back
/// on every unregister/process-events call.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EngineHandle(pub u64);

/// What a registration subscribes to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscribeTarget {
    /// Changes made to one module, optionally filtered by an xpath.
    ModuleChange {
        module: String,
        xpath: Option<String>,
    },
    /// Requests for operational data under an xpath.
    OperGet { module: String, xpath: String },
    /// Delivery of one RPC or action.
    Rpc { xpath: String },
    /// Delivery of notifications of one module.
    Notification {
        module: String,
        xpath: Option<String>,
        start_time: Option<SystemTime>,
        stop_time: Option<SystemTime>,
    },
}

/// Parameters of one registration request.
#[derive(Clone, Debug)]
pub struct SubscribeParams {
    pub target: SubscribeTarget,
    pub flags: SubscriptionFlags,
    pub priority: u32,
}

/// Readiness notifications for one registration in cooperative mode.
///
/// The engine sends one message whenever it has pending events for the
/// registration; the embedding must then call [`Engine::process_events`].
/// This is the channel form of the native event-pipe file descriptor.
pub type Readiness = tokio::sync::mpsc::UnboundedReceiver<()>;

/// The event-processing surface of a datastore engine.
pub trait Engine: Send + Sync + 'static {
    /// Open a new session on the given datastore.
    fn session_start(
        &self,
        datastore: Datastore,
    ) -> Result<Box<dyn EngineSession>>;

    /// Register a subscription. The engine stores the sink and invokes it
    /// for every matching event until the handle is unregistered.
    fn subscribe(
        &self,
        params: SubscribeParams,
        sink: std::sync::Arc<dyn EventSink>,
    ) -> Result<EngineHandle>;

    /// Release a registration and all engine resources tied to it.
    fn unsubscribe(&self, handle: EngineHandle) -> Result<()>;

    /// Deliver pending events of the registration by re-invoking its sink,
    /// including events previously shelved with
    /// [`ErrorCode::CallbackShelve`].
    fn process_events(&self, handle: EngineHandle) -> Result<()>;

    /// Obtain the readiness event source of a cooperative-mode
    /// registration.
    fn readiness(&self, handle: EngineHandle) -> Result<Readiness>;
}

/// One engine session.
///
/// Sessions handed to [`EventSink`] methods are *implicit*: they are only
/// valid for the duration of that invocation and the dispatch core never
/// retains them. Explicit sessions obtained from
/// [`Engine::session_start`] live until dropped.
pub trait EngineSession: Send {
    /// Datastore this session operates on.
    fn datastore(&self) -> Datastore;

    /// Change the datastore subsequent calls operate on.
    fn switch_datastore(&mut self, datastore: Datastore) -> Result<()>;

    /// Retrieve a data subtree. Returns `NotFound` when nothing matches.
    fn get_data(&self, xpath: &str, flags: OperGetFlags) -> Result<DataTree>;

    /// Raw diff records of the edit being processed, scoped to `xpath`.
    /// Only meaningful inside a module-change event.
    fn diff(&self, xpath: &str) -> Result<Vec<DiffRecord>>;

    /// Stage a create-or-update edit.
    fn set_item(
        &mut self,
        xpath: &str,
        value: Option<crate::value::DataValue>,
    ) -> Result<()>;

    /// Stage a delete edit.
    fn delete_item(&mut self, xpath: &str) -> Result<()>;

    /// Apply staged edits, driving the module-change pipeline.
    fn apply_changes(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Drop staged edits.
    fn discard_changes(&mut self) -> Result<()>;

    /// Validate staged edits without applying them.
    fn validate(&mut self, module: Option<&str>) -> Result<()>;

    /// Send an RPC/action and wait for its output.
    fn rpc_send(
        &mut self,
        xpath: &str,
        input: DataTree,
        timeout: Option<Duration>,
    ) -> Result<DataTree>;

    /// Send a notification.
    fn notification_send(
        &mut self,
        xpath: &str,
        payload: DataTree,
    ) -> Result<()>;

    /// Attach an error message to the session so the engine can forward it
    /// to the client whose request is being processed.
    fn set_error(&mut self, message: &str);

    /// Paths in `tree` that have no schema definition. Backs the strict
    /// mode of operational-data and RPC output handling.
    fn unknown_nodes(&self, tree: &DataTree) -> Vec<String>;

    /// Name of the originator of the event being processed, when set.
    fn originator_name(&self) -> Option<String>;

    /// NETCONF session id of the event originator, when set.
    fn netconf_id(&self) -> Option<u32>;

    /// Effective username of the event originator, when set.
    fn user(&self) -> Option<String>;
}

/// The trampoline surface the engine invokes to deliver events.
///
/// Implementations convert engine arguments into language-native values,
/// run the user callback and convert the outcome back into a status code.
/// They never panic across this boundary and never retain `session` past
/// the call.
pub trait EventSink: Send + Sync {
    /// Deliver one module-change event.
    fn module_change(
        &self,
        session: &mut dyn EngineSession,
        module: &str,
        xpath: Option<&str>,
        event: Event,
        request_id: u32,
    ) -> ErrorCode;

    /// Request operational data. Contributed nodes are merged into
    /// `parent`.
    fn oper_get(
        &self,
        session: &mut dyn EngineSession,
        module: &str,
        sub_xpath: &str,
        request_xpath: Option<&str>,
        request_id: u32,
        parent: &mut DataTree,
    ) -> ErrorCode;

    /// Deliver one RPC/action request. Output parameters are merged into
    /// `output` unless the event is an abort.
    fn rpc(
        &self,
        session: &mut dyn EngineSession,
        xpath: &str,
        input: &DataTree,
        event: Event,
        request_id: u32,
        output: &mut DataTree,
    ) -> ErrorCode;

    /// Deliver one notification. The return value is informational only;
    /// the engine never fails a sender because of it.
    fn notification(
        &self,
        session: &mut dyn EngineSession,
        kind: NotificationKind,
        xpath: Option<&str>,
        payload: &DataTree,
        timestamp: SystemTime,
    ) -> ErrorCode;
}
