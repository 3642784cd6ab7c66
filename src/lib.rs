//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Rust client library for a [sysrepo]-style YANG datastore engine.
//!
//! The engine stores YANG-modeled configuration and state, validates
//! edits and routes events between clients. This crate provides the
//! client side: sessions for reading and editing data, and long-lived
//! subscriptions that bridge engine-driven event delivery (configuration
//! changes, operational-data requests, RPCs/actions, notifications) to
//! user callbacks.
//!
//! [sysrepo]: https://github.com/sysrepo/sysrepo
//!
//! ## Design Goals
//! * Detect callback misuse at compile time: each subscription class has
//!   its own callback signature, and the session handed to a callback
//!   cannot outlive the invocation it was delivered with
//! * Never let a user error or panic unwind into the engine; every
//!   outcome crosses the boundary as a closed status code
//! * Support both blocking callbacks (one engine thread per
//!   subscription) and asynchronous callbacks cooperatively scheduled on
//!   a tokio runtime
//!
//! ## Engine boundary
//! The engine itself is abstracted behind the [`engine::Engine`] trait
//! family. A production embedding backs those traits with the native
//! library's FFI; the test suite ships an in-memory engine implementing
//! the same delivery contract.

mod dispatch;
mod task;

pub mod change;
pub mod connection;
pub mod data;
pub mod engine;
pub mod error;
pub mod session;
pub mod subscription;
pub mod value;
pub mod xpath;

pub use crate::change::Change;
pub use crate::connection::Connection;
pub use crate::data::DataTree;
pub use crate::engine::Datastore;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::session::{
    ImplicitSession, OperGetFlags, Session, SubscribeOptions,
    SubscriptionFlags,
};
pub use crate::subscription::{Event, NotificationKind, Subscription};
pub use crate::value::DataValue;
