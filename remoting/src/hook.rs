use std::sync::{Arc, RwLock};

use crate::command::Command;

/// Observer invoked around every request this side processes, and around every synchronous call
/// it makes.
///
/// Hooks run inline, so they should be quick.  Typical uses are access logging, auditing and
/// stamping ext fields for tracing.
pub trait RpcHook: Send + Sync + 'static {
    /// Called before `request` is handed to a processor, or before an outbound synchronous
    /// request is written.
    fn before_request(&self, remote_peer: &str, request: &Command);

    /// Called once the outcome of `request` is known.  `response` is `None` for a oneway request
    /// and for a synchronous call that failed without a response.
    fn after_response(&self, remote_peer: &str, request: &Command, response: Option<&Command>);
}

/// Every registered hook, run in registration order.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    hooks: Arc<RwLock<Vec<Arc<dyn RpcHook>>>>,
}

impl Hooks {
    pub(crate) fn register(&self, hook: Arc<dyn RpcHook>) {
        self.hooks.write().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn RpcHook>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn before_request(&self, remote_peer: &str, request: &Command) {
        for hook in self.snapshot() {
            hook.before_request(remote_peer, request);
        }
    }

    pub(crate) fn after_response(&self, remote_peer: &str, request: &Command, response: Option<&Command>) {
        for hook in self.snapshot() {
            hook.after_response(remote_peer, request, response);
        }
    }
}
