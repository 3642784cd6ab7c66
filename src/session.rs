//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Datastore sessions.
//!
//! [`Session`] is an explicit session opened through a [`Connection`]: it
//! reads and edits data, sends RPCs and notifications, and registers the
//! callbacks of this library's subscription classes. It owns its
//! subscriptions; [`Session::stop`] (or dropping the session) releases all
//! of them.
//!
//! [`ImplicitSession`] is the short-lived view handed to callbacks that
//! asked for direct engine access. Its lifetime parameter ties it to one
//! callback invocation; storing it for later is a compile error.
//!
//! [`Connection`]: crate::connection::Connection

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use futures::future::BoxFuture;

use crate::change::Change;
use crate::data::DataTree;
use crate::engine::{
    Datastore, Engine, EngineSession, SubscribeParams, SubscribeTarget,
};
use crate::error::{Error, Result};
use crate::subscription::{
    Callback, Event, NotificationKind, Subscription,
};
use crate::value::DataValue;

bitflags! {
    /// Subscription behavior flags forwarded to the engine.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SubscriptionFlags: u32 {
        /// No dedicated delivery thread; events wait until the embedding
        /// processes them. Implied by cooperative mode.
        const NO_THREAD = 0x01;
        /// Do not mark the subscribed data as live to other clients.
        const PASSIVE = 0x02;
        /// Deliver only `Done` events, skipping the verification phases.
        const DONE_ONLY = 0x04;
        /// Deliver the current configuration right after subscribing.
        const ENABLED = 0x08;
        /// Also deliver `Update` events, allowing the callback to amend
        /// the edit before verification.
        const UPDATE = 0x10;
        /// Merge this provider's operational data with lower-priority
        /// providers instead of shadowing them.
        const OPER_MERGE = 0x20;
    }
}

bitflags! {
    /// Content selection flags for data retrieval.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct OperGetFlags: u32 {
        const NO_STATE = 0x01;
        const NO_CONFIG = 0x02;
        const NO_SUBS = 0x04;
        const NO_STORED = 0x08;
        /// Include nodes carrying their default value.
        const WITH_DEFAULTS = 0x10;
    }
}

/// Per-subscription configuration.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Relative order among subscribers of the same event; lower numeric
    /// priority is invoked first.
    pub priority: u32,
    pub flags: SubscriptionFlags,
    /// Run the callback on the ambient tokio runtime instead of an engine
    /// thread. Required for the `_async` subscription variants.
    pub cooperative: bool,
    /// Reject (rather than drop) callback-returned nodes the schema does
    /// not know.
    pub strict: bool,
    /// Include default-valued nodes in configuration snapshots.
    pub include_implicit_defaults: bool,
}

impl Default for SubscribeOptions {
    fn default() -> SubscribeOptions {
        SubscribeOptions {
            priority: 0,
            flags: SubscriptionFlags::empty(),
            cooperative: false,
            strict: false,
            include_implicit_defaults: true,
        }
    }
}

/// An explicit datastore session.
pub struct Session {
    engine: Arc<dyn Engine>,
    inner: Option<Box<dyn EngineSession>>,
    subscriptions: Vec<Subscription>,
}

impl Session {
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        datastore: Datastore,
    ) -> Result<Session> {
        let inner = engine.session_start(datastore)?;
        Ok(Session {
            engine,
            inner: Some(inner),
            subscriptions: Vec::new(),
        })
    }

    fn inner(&self) -> Result<&dyn EngineSession> {
        match &self.inner {
            Some(inner) => Ok(inner.as_ref()),
            None => Err(Error::inval_arg("session has been stopped")),
        }
    }

    fn inner_mut(&mut self) -> Result<&mut Box<dyn EngineSession>> {
        match &mut self.inner {
            Some(inner) => Ok(inner),
            None => Err(Error::inval_arg("session has been stopped")),
        }
    }

    /// Datastore this session operates on.
    pub fn datastore(&self) -> Result<Datastore> {
        Ok(self.inner()?.datastore())
    }

    /// Change the datastore subsequent calls operate on.
    pub fn switch_datastore(&mut self, datastore: Datastore) -> Result<()> {
        self.inner_mut()?.switch_datastore(datastore)
    }

    /// Retrieve the data subtree matching `xpath`.
    pub fn get_data(
        &self,
        xpath: &str,
        flags: OperGetFlags,
    ) -> Result<DataTree> {
        self.inner()?.get_data(xpath, flags)
    }

    /// Stage a create-or-update edit. Nothing is applied until
    /// [`Session::apply_changes`].
    pub fn set_item(
        &mut self,
        xpath: &str,
        value: Option<DataValue>,
    ) -> Result<()> {
        self.inner_mut()?.set_item(xpath, value)
    }

    /// Stage a delete edit.
    pub fn delete_item(&mut self, xpath: &str) -> Result<()> {
        self.inner_mut()?.delete_item(xpath)
    }

    /// Apply staged edits, driving the module-change event pipeline of all
    /// affected subscribers.
    pub fn apply_changes(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner_mut()?.apply_changes(timeout)
    }

    /// Drop staged edits.
    pub fn discard_changes(&mut self) -> Result<()> {
        self.inner_mut()?.discard_changes()
    }

    /// Validate staged edits without applying them.
    pub fn validate(&mut self, module: Option<&str>) -> Result<()> {
        self.inner_mut()?.validate(module)
    }

    /// Send an RPC/action and wait for its output.
    pub fn rpc_send(
        &mut self,
        xpath: &str,
        input: DataTree,
        timeout: Option<Duration>,
    ) -> Result<DataTree> {
        self.inner_mut()?.rpc_send(xpath, input, timeout)
    }

    /// Send a notification.
    pub fn notification_send(
        &mut self,
        xpath: &str,
        payload: DataTree,
    ) -> Result<()> {
        self.inner_mut()?.notification_send(xpath, payload)
    }

    /// Subscribe to configuration changes of one module, optionally
    /// filtered by an xpath.
    pub fn subscribe_module_change(
        &mut self,
        module: &str,
        xpath: Option<&str>,
        callback: impl Fn(Event, u32, &DataTree, &[Change]) -> Result<()>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            module_change_target(module, xpath),
            Callback::ModuleChange(Box::new(callback)),
            options,
        )
    }

    /// Asynchronous variant of [`Session::subscribe_module_change`].
    /// Requires [`SubscribeOptions::cooperative`].
    pub fn subscribe_module_change_async(
        &mut self,
        module: &str,
        xpath: Option<&str>,
        callback: impl Fn(
                Event,
                u32,
                DataTree,
                Vec<Change>,
            ) -> BoxFuture<'static, Result<()>>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            module_change_target(module, xpath),
            Callback::ModuleChangeAsync(Box::new(callback)),
            options,
        )
    }

    /// Variant of [`Session::subscribe_module_change`] whose callback
    /// receives the live implicit session instead of pre-materialized
    /// payloads. Cheaper, but the callback must fetch what it needs before
    /// returning.
    pub fn subscribe_module_change_unsafe(
        &mut self,
        module: &str,
        xpath: Option<&str>,
        callback: impl Fn(&mut ImplicitSession<'_>, Event, u32) -> Result<()>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            module_change_target(module, xpath),
            Callback::ModuleChangeUnsafe(Box::new(callback)),
            options,
        )
    }

    /// Provide operational data under `xpath`. The callback receives the
    /// client's request xpath, when available.
    pub fn subscribe_oper_data(
        &mut self,
        module: &str,
        xpath: &str,
        callback: impl Fn(Option<&str>) -> Result<Option<DataTree>>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            SubscribeTarget::OperGet {
                module: module.to_owned(),
                xpath: xpath.to_owned(),
            },
            Callback::OperGet(Box::new(callback)),
            options,
        )
    }

    /// Asynchronous variant of [`Session::subscribe_oper_data`].
    pub fn subscribe_oper_data_async(
        &mut self,
        module: &str,
        xpath: &str,
        callback: impl Fn(
                Option<String>,
            ) -> BoxFuture<'static, Result<Option<DataTree>>>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            SubscribeTarget::OperGet {
                module: module.to_owned(),
                xpath: xpath.to_owned(),
            },
            Callback::OperGetAsync(Box::new(callback)),
            options,
        )
    }

    /// Serve the RPC or action at `xpath`.
    pub fn subscribe_rpc(
        &mut self,
        xpath: &str,
        callback: impl Fn(&str, &DataTree, Event, u32) -> Result<Option<DataTree>>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            SubscribeTarget::Rpc {
                xpath: xpath.to_owned(),
            },
            Callback::Rpc(Box::new(callback)),
            options,
        )
    }

    /// Asynchronous variant of [`Session::subscribe_rpc`].
    pub fn subscribe_rpc_async(
        &mut self,
        xpath: &str,
        callback: impl Fn(
                String,
                DataTree,
                Event,
                u32,
            ) -> BoxFuture<'static, Result<Option<DataTree>>>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            SubscribeTarget::Rpc {
                xpath: xpath.to_owned(),
            },
            Callback::RpcAsync(Box::new(callback)),
            options,
        )
    }

    /// Receive notifications of one module, optionally replaying stored
    /// ones from `start_time`.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_notification(
        &mut self,
        module: &str,
        xpath: Option<&str>,
        start_time: Option<SystemTime>,
        stop_time: Option<SystemTime>,
        callback: impl Fn(
                NotificationKind,
                Option<&str>,
                &DataTree,
                SystemTime,
            ) -> Result<()>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            notification_target(module, xpath, start_time, stop_time),
            Callback::Notification(Box::new(callback)),
            options,
        )
    }

    /// Asynchronous variant of [`Session::subscribe_notification`].
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_notification_async(
        &mut self,
        module: &str,
        xpath: Option<&str>,
        start_time: Option<SystemTime>,
        stop_time: Option<SystemTime>,
        callback: impl Fn(
                NotificationKind,
                Option<String>,
                DataTree,
                SystemTime,
            ) -> BoxFuture<'static, Result<()>>
            + Send
            + Sync
            + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.register(
            notification_target(module, xpath, start_time, stop_time),
            Callback::NotificationAsync(Box::new(callback)),
            options,
        )
    }

    fn register(
        &mut self,
        target: SubscribeTarget,
        callback: Callback,
        mut options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.inner()?;
        let cooperative = if options.cooperative {
            let handle =
                tokio::runtime::Handle::try_current().map_err(|_| {
                    Error::inval_arg(
                        "cooperative subscription requires a running tokio \
                         runtime",
                    )
                })?;
            options.flags |= SubscriptionFlags::NO_THREAD;
            Some(handle)
        } else {
            if callback.is_async() {
                return Err(Error::inval_arg(
                    "asynchronous callbacks require \
                     SubscribeOptions::cooperative",
                ));
            }
            None
        };
        let params = SubscribeParams {
            target,
            flags: options.flags,
            priority: options.priority,
        };
        let subscription = Subscription::register(
            self.engine.clone(),
            callback,
            options,
            cooperative,
            params,
        )?;
        self.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    /// Active subscriptions registered through this session.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Release all subscriptions and close the session. Idempotent;
    /// cleanup failures are logged and never short-circuit the remaining
    /// steps.
    pub fn stop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.inner = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("stopped", &self.inner.is_none())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

fn module_change_target(
    module: &str,
    xpath: Option<&str>,
) -> SubscribeTarget {
    SubscribeTarget::ModuleChange {
        module: module.to_owned(),
        xpath: xpath.map(str::to_owned),
    }
}

fn notification_target(
    module: &str,
    xpath: Option<&str>,
    start_time: Option<SystemTime>,
    stop_time: Option<SystemTime>,
) -> SubscribeTarget {
    SubscribeTarget::Notification {
        module: module.to_owned(),
        xpath: xpath.map(str::to_owned),
        start_time,
        stop_time,
    }
}

/// The session a callback runs under.
///
/// Borrowed from the engine for the duration of one event delivery; the
/// lifetime parameter prevents callbacks from stashing it away. Operations
/// that only make sense on an explicit session fail with `Unsupported`
/// instead of silently doing nothing.
pub struct ImplicitSession<'a> {
    inner: &'a mut dyn EngineSession,
}

impl<'a> ImplicitSession<'a> {
    pub(crate) fn new(inner: &'a mut dyn EngineSession) -> ImplicitSession<'a> {
        ImplicitSession { inner }
    }

    /// Datastore of the event being processed.
    pub fn datastore(&self) -> Datastore {
        self.inner.datastore()
    }

    /// Retrieve the data subtree matching `xpath`.
    pub fn get_data(
        &self,
        xpath: &str,
        flags: OperGetFlags,
    ) -> Result<DataTree> {
        self.inner.get_data(xpath, flags)
    }

    /// Decoded changes of the edit being processed, scoped to `xpath`.
    pub fn get_changes(&self, xpath: &str) -> Result<Vec<Change>> {
        Ok(Change::decode(self.inner.diff(xpath)?))
    }

    /// Stage an edit amendment. Only effective during `Update` events.
    pub fn set_item(
        &mut self,
        xpath: &str,
        value: Option<DataValue>,
    ) -> Result<()> {
        self.inner.set_item(xpath, value)
    }

    /// Stage a delete amendment. Only effective during `Update` events.
    pub fn delete_item(&mut self, xpath: &str) -> Result<()> {
        self.inner.delete_item(xpath)
    }

    /// Attach an error message for the client whose request is being
    /// processed. Only meaningful while the event is still preventable.
    pub fn set_error(&mut self, message: &str) {
        self.inner.set_error(message);
    }

    /// Name of the event originator, when the client supplied one.
    pub fn originator_name(&self) -> Option<String> {
        self.inner.originator_name()
    }

    /// NETCONF session id of the event originator, when set.
    pub fn netconf_id(&self) -> Option<u32> {
        self.inner.netconf_id()
    }

    /// Effective username of the event originator, when set.
    pub fn user(&self) -> Option<String> {
        self.inner.user()
    }

    /// Not available on implicit sessions.
    pub fn switch_datastore(&mut self, _datastore: Datastore) -> Result<()> {
        Err(Error::unsupported(
            "cannot switch datastore on an implicit session",
        ))
    }

    /// Not available on implicit sessions; the engine applies the edit
    /// that triggered the event.
    pub fn apply_changes(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Err(Error::unsupported(
            "cannot apply changes on an implicit session",
        ))
    }

    /// Not available on implicit sessions.
    pub fn validate(&mut self, _module: Option<&str>) -> Result<()> {
        Err(Error::unsupported("cannot validate on an implicit session"))
    }

    /// Not available on implicit sessions; the engine owns their
    /// lifetime.
    pub fn stop(self) -> Result<()> {
        Err(Error::unsupported("cannot stop an implicit session"))
    }
}

impl std::fmt::Debug for ImplicitSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplicitSession")
            .field("datastore", &self.datastore())
            .finish()
    }
}
