//! RPC handler table
//!
//! Handlers are keyed by task code. The table is only written while a node
//! is set up or torn down; dispatch takes the read lock and clones the
//! handler out before running it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::debug;

use super::Dispatcher;
use crate::domain::{EndPoint, Message, TaskCode};
use crate::error::{SpindleError, SpindleResult};

/// Serves requests for one task code. Runs on an executor worker.
///
/// A handler answers by passing `request.create_response()` (plus payload)
/// to `ctx.reply`, either right away or later from another task. Only the
/// first reply per request is sent.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, ctx: &RpcContext, request: Message);
}

impl<F> RpcHandler for F
where
    F: Fn(&RpcContext, Message) + Send + Sync,
{
    fn handle(&self, ctx: &RpcContext, request: Message) {
        self(ctx, request)
    }
}

/// What a handler can reach of the node serving it. Cheap to clone, so a
/// handler can move it into a continuation and reply from there.
#[derive(Clone)]
pub struct RpcContext {
    dispatcher: Weak<Dispatcher>,
    address: EndPoint,
}

impl RpcContext {
    pub(crate) fn new(dispatcher: Weak<Dispatcher>, address: EndPoint) -> Self {
        Self {
            dispatcher,
            address,
        }
    }

    /// Address of the node that received the request.
    pub fn local_address(&self) -> &EndPoint {
        &self.address
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.upgrade()
    }

    /// Same as `Dispatcher::reply`. A no-op once the node is gone.
    pub fn reply(&self, response: Message) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.reply(response);
        }
    }
}

struct HandlerEntry {
    name: String,
    handler: Arc<dyn RpcHandler>,
}

#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: RwLock<HashMap<TaskCode, HandlerEntry>>,
}

impl HandlerTable {
    pub(crate) fn register(
        &self,
        code: TaskCode,
        name: impl Into<String>,
        handler: Arc<dyn RpcHandler>,
    ) -> SpindleResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&code) {
            return Err(SpindleError::argument(format!(
                "code {code} is already bound to {}",
                existing.name
            )));
        }
        let name = name.into();
        debug!(%code, handler = %name, "rpc handler registered");
        entries.insert(code, HandlerEntry { name, handler });
        Ok(())
    }

    pub(crate) fn unregister(&self, code: &TaskCode) -> SpindleResult<()> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code);
        match removed {
            Some(entry) => {
                debug!(%code, handler = %entry.name, "rpc handler unregistered");
                Ok(())
            }
            None => Err(SpindleError::argument(format!("code {code} is not bound"))),
        }
    }

    pub(crate) fn get(&self, code: &TaskCode) -> Option<Arc<dyn RpcHandler>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// (code, handler name) pairs, sorted by code.
    pub(crate) fn bindings(&self) -> Vec<(TaskCode, String)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut bindings: Vec<_> = entries
            .iter()
            .map(|(code, entry)| (code.clone(), entry.name.clone()))
            .collect();
        bindings.sort();
        bindings
    }
}
