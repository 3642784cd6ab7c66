//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Engine connections.

use std::sync::Arc;

use crate::engine::{Datastore, Engine};
use crate::error::Result;
use crate::session::Session;

/// A connection to a datastore engine.
///
/// Cheap to clone; sessions started from any clone share the same engine.
#[derive(Clone)]
pub struct Connection {
    engine: Arc<dyn Engine>,
}

impl Connection {
    /// Wrap an engine. Production embeddings pass their FFI-backed engine
    /// here; tests pass an in-memory one.
    pub fn new(engine: Arc<dyn Engine>) -> Connection {
        Connection { engine }
    }

    /// Open a new session on the given datastore.
    pub fn start_session(&self, datastore: Datastore) -> Result<Session> {
        Session::new(self.engine.clone(), datastore)
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish()
    }
}
