//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Event dispatch trampolines.
//!
//! [`Dispatcher`] is the [`EventSink`] handed to the engine for one
//! subscription. Every entry point funnels through [`guard`], which turns
//! callback errors and panics into closed status codes; nothing unwinds
//! back into the engine and no engine session outlives the invocation it
//! was delivered with.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use crate::change::Change;
use crate::data::DataTree;
use crate::engine::{EngineSession, EventSink};
use crate::error::{Error, ErrorCode, Result};
use crate::session::{ImplicitSession, OperGetFlags};
use crate::subscription::{
    Callback, Event, NotificationKind, SubscriptionCore, TaskOutcome,
};
use crate::task::TaskKey;

pub(crate) struct Dispatcher {
    core: Arc<SubscriptionCore>,
}

impl Dispatcher {
    pub(crate) fn new(core: Arc<SubscriptionCore>) -> Dispatcher {
        Dispatcher { core }
    }

    /// Materialize the payload of a module-change event: a deep copy of the
    /// subscribed configuration subtree plus the decoded change list.
    fn change_payload(
        &self,
        session: &mut dyn EngineSession,
        module: &str,
        xpath: Option<&str>,
    ) -> Result<(DataTree, Vec<Change>)> {
        let root = match xpath {
            Some(xpath) => xpath.to_owned(),
            None => format!("/{}:*", module),
        };
        let mut flags = OperGetFlags::empty();
        if self.core.options.include_implicit_defaults {
            flags |= OperGetFlags::WITH_DEFAULTS;
        }
        let config = match session.get_data(&root, flags) {
            Ok(tree) => tree,
            // An edit may leave the subscribed subtree empty.
            Err(err) if err.errcode == ErrorCode::NotFound => DataTree::new(),
            Err(err) => return Err(err),
        };
        let records = session.diff(&format!("{}//.", root))?;
        Ok((config, Change::decode(records)))
    }

    /// Drop (or, under `strict`, reject) nodes the schema does not know.
    fn sanitize(
        &self,
        session: &dyn EngineSession,
        tree: &mut DataTree,
        what: &str,
    ) -> Result<()> {
        let unknown = session.unknown_nodes(tree);
        if unknown.is_empty() {
            return Ok(());
        }
        if self.core.options.strict {
            return Err(Error::validation_failed(format!(
                "{} contains nodes unknown to the schema: {}",
                what,
                unknown.join(", ")
            )));
        }
        for path in unknown {
            log::warn!("dropping unknown {} node: {}", what, path);
            tree.delete(&path)?;
        }
        Ok(())
    }
}

impl EventSink for Dispatcher {
    fn module_change(
        &self,
        session: &mut dyn EngineSession,
        module: &str,
        xpath: Option<&str>,
        event: Event,
        request_id: u32,
    ) -> ErrorCode {
        let core = &self.core;
        let label = format!("module-change ({})", module);
        guard(session, event.is_preventable(), &label, |session| {
            match &core.callback {
                Callback::ModuleChange(cb) => {
                    let (config, changes) =
                        self.change_payload(session, module, xpath)?;
                    cb(event, request_id, &config, &changes)?;
                    Ok(ErrorCode::Ok)
                }
                Callback::ModuleChangeUnsafe(cb) => {
                    let mut implicit = ImplicitSession::new(session);
                    cb(&mut implicit, event, request_id)?;
                    Ok(ErrorCode::Ok)
                }
                Callback::ModuleChangeAsync(cb) => {
                    let key = TaskKey::new(Some(event), request_id);
                    // The registry lock is not held while the future
                    // constructor runs; it may call back into the
                    // subscription handle.
                    if !core.tasks.lock().unwrap().contains(&key) {
                        let (config, changes) =
                            self.change_payload(session, module, xpath)?;
                        let fut = cb(event, request_id, config, changes);
                        let fut = Box::pin(async move {
                            fut.await.map(|()| None)
                        });
                        let mut tasks = core.tasks.lock().unwrap();
                        if !tasks.contains(&key) {
                            core.spawn_task(
                                &mut tasks,
                                key,
                                fut,
                                event.needs_reply(),
                            )?;
                        }
                    }
                    if !event.needs_reply() {
                        // The engine does not wait; the task consumes its
                        // own result on completion.
                        return Ok(ErrorCode::Ok);
                    }
                    match core.take_task(key, event.is_preventable())? {
                        TaskOutcome::Shelve => Ok(ErrorCode::CallbackShelve),
                        TaskOutcome::Ready(_) => Ok(ErrorCode::Ok),
                    }
                }
                _ => Err(Error::internal("callback class mismatch")),
            }
        })
    }

    fn oper_get(
        &self,
        session: &mut dyn EngineSession,
        _module: &str,
        sub_xpath: &str,
        request_xpath: Option<&str>,
        request_id: u32,
        parent: &mut DataTree,
    ) -> ErrorCode {
        let core = &self.core;
        let label = format!("operational-data ({})", sub_xpath);
        guard(session, true, &label, |session| {
            let result = match &core.callback {
                Callback::OperGet(cb) => cb(request_xpath)?,
                Callback::OperGetAsync(cb) => {
                    let key = TaskKey::new(None, request_id);
                    if !core.tasks.lock().unwrap().contains(&key) {
                        let fut = cb(request_xpath.map(str::to_owned));
                        let mut tasks = core.tasks.lock().unwrap();
                        if !tasks.contains(&key) {
                            core.spawn_task(&mut tasks, key, fut, true)?;
                        }
                    }
                    match core.take_task(key, true)? {
                        TaskOutcome::Shelve => {
                            return Ok(ErrorCode::CallbackShelve)
                        }
                        TaskOutcome::Ready(result) => result,
                    }
                }
                _ => return Err(Error::internal("callback class mismatch")),
            };
            if let Some(mut tree) = result {
                self.sanitize(&*session, &mut tree, "operational data")?;
                parent.merge(tree);
            }
            Ok(ErrorCode::Ok)
        })
    }

    fn rpc(
        &self,
        session: &mut dyn EngineSession,
        xpath: &str,
        input: &DataTree,
        event: Event,
        request_id: u32,
        output: &mut DataTree,
    ) -> ErrorCode {
        let core = &self.core;
        let preventable = event == Event::Rpc;
        let label = format!("rpc ({})", xpath);
        guard(session, preventable, &label, |session| {
            let result = match &core.callback {
                Callback::Rpc(cb) => cb(xpath, input, event, request_id)?,
                Callback::RpcAsync(cb) => {
                    let key = TaskKey::new(Some(event), request_id);
                    if !core.tasks.lock().unwrap().contains(&key) {
                        let fut = cb(
                            xpath.to_owned(),
                            input.clone(),
                            event,
                            request_id,
                        );
                        let mut tasks = core.tasks.lock().unwrap();
                        if !tasks.contains(&key) {
                            core.spawn_task(&mut tasks, key, fut, true)?;
                        }
                    }
                    match core.take_task(key, preventable)? {
                        TaskOutcome::Shelve => {
                            return Ok(ErrorCode::CallbackShelve)
                        }
                        TaskOutcome::Ready(result) => result,
                    }
                }
                _ => return Err(Error::internal("callback class mismatch")),
            };
            // An abort only rolls back side effects; output is discarded.
            if event != Event::Abort {
                if let Some(mut tree) = result {
                    self.sanitize(&*session, &mut tree, "rpc output")?;
                    output.merge(tree);
                }
            }
            Ok(ErrorCode::Ok)
        })
    }

    fn notification(
        &self,
        session: &mut dyn EngineSession,
        kind: NotificationKind,
        xpath: Option<&str>,
        payload: &DataTree,
        timestamp: SystemTime,
    ) -> ErrorCode {
        let core = &self.core;
        let label = format!("notification ({})", xpath.unwrap_or("-"));
        guard(session, false, &label, |_session| {
            match &core.callback {
                Callback::Notification(cb) => {
                    // The sender never waits for notification results;
                    // failures are only logged.
                    if let Err(err) = cb(kind, xpath, payload, timestamp) {
                        log::error!("{} callback failed: {}", label, err);
                    }
                }
                Callback::NotificationAsync(cb) => {
                    let key =
                        TaskKey::new(None, core.next_notification_id());
                    let fut = cb(
                        kind,
                        xpath.map(str::to_owned),
                        payload.clone(),
                        timestamp,
                    );
                    let fut =
                        Box::pin(async move { fut.await.map(|()| None) });
                    let mut tasks = core.tasks.lock().unwrap();
                    core.spawn_task(&mut tasks, key, fut, false)?;
                }
                _ => return Err(Error::internal("callback class mismatch")),
            }
            Ok(ErrorCode::Ok)
        })
    }
}

/// The single crossing point back into the engine.
///
/// Runs `f` under `catch_unwind`, logs failures, attaches the message to
/// the session when the event is still preventable and converts the
/// outcome into a status code. Every [`EventSink`] entry point goes
/// through here; nothing else returns to the engine.
fn guard(
    session: &mut dyn EngineSession,
    preventable: bool,
    label: &str,
    f: impl FnOnce(&mut dyn EngineSession) -> Result<ErrorCode>,
) -> ErrorCode {
    let outcome = {
        let session = &mut *session;
        std::panic::catch_unwind(AssertUnwindSafe(move || f(session)))
    };
    match outcome {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            log::error!("{} callback failed: {}", label, err);
            if preventable {
                let msg = match err.message() {
                    Some(msg) => msg.to_owned(),
                    None => err.errcode.strerror().to_owned(),
                };
                session.set_error(&msg);
            }
            err.code()
        }
        Err(payload) => {
            let msg = panic_message(payload);
            log::error!("{} callback panicked: {}", label, msg);
            if preventable {
                session.set_error(&msg);
            }
            ErrorCode::CallbackFailed
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
