//! Typed-message plugin layer.
//!
//! The dispatcher maps a type code to its consumer. Internal protocol
//! codes are claimed by core components at startup; application codes
//! (100+) invoke either a registered per-type handler or the default
//! application callback. A handler returns `true` to consume the package
//! (stopping broadcast re-forwarding) or `false` to let it continue down
//! the tree. Unknown types are never dropped: they are logged and, when
//! broadcast, forwarded untouched.

use crate::types::{
    FIRST_PLUGIN_TYPE, TYPE_BRIDGE_COORDINATION, TYPE_BRIDGE_ELECTION, TYPE_BRIDGE_STATUS,
    TYPE_BRIDGE_TAKEOVER, TYPE_HANDSHAKE, TYPE_NODE_SYNC_REPLY, TYPE_NODE_SYNC_REQUEST,
    TYPE_NTP_TIME, TYPE_TIME_SYNC_REPLY, TYPE_TIME_SYNC_REQUEST,
};
use crate::wire::PackageView;
use std::collections::HashMap;
use tracing::debug;

/// Core component a reserved type code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTarget {
    Topology,
    TimeSync,
    Bridge,
}

/// Outcome of dispatching one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Owned by a core component; the engine routes it there itself.
    Internal(InternalTarget),
    /// A handler or the app callback ran; `consumed` stops forwarding.
    Handled { consumed: bool },
    /// Nobody recognizes the code.
    Unhandled,
}

pub type PackageHandler = Box<dyn FnMut(&PackageView) -> bool + Send>;
pub type AppCallback = Box<dyn FnMut(&PackageView) + Send>;

pub struct PluginRegistry {
    internal: HashMap<u16, InternalTarget>,
    handlers: HashMap<u16, PackageHandler>,
    app_callback: Option<AppCallback>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let mut internal = HashMap::new();
        internal.insert(TYPE_HANDSHAKE, InternalTarget::Topology);
        internal.insert(TYPE_NODE_SYNC_REQUEST, InternalTarget::Topology);
        internal.insert(TYPE_NODE_SYNC_REPLY, InternalTarget::Topology);
        internal.insert(TYPE_TIME_SYNC_REQUEST, InternalTarget::TimeSync);
        internal.insert(TYPE_TIME_SYNC_REPLY, InternalTarget::TimeSync);
        internal.insert(TYPE_BRIDGE_STATUS, InternalTarget::Bridge);
        internal.insert(TYPE_BRIDGE_ELECTION, InternalTarget::Bridge);
        internal.insert(TYPE_BRIDGE_TAKEOVER, InternalTarget::Bridge);
        internal.insert(TYPE_BRIDGE_COORDINATION, InternalTarget::Bridge);
        internal.insert(TYPE_NTP_TIME, InternalTarget::Bridge);
        Self {
            internal,
            handlers: HashMap::new(),
            app_callback: None,
        }
    }

    /// Register a handler for a plugin code. Reserved internal codes and
    /// duplicate registrations are refused.
    pub fn register(&mut self, type_code: u16, handler: PackageHandler) -> bool {
        if type_code < FIRST_PLUGIN_TYPE
            || self.internal.contains_key(&type_code)
            || self.handlers.contains_key(&type_code)
        {
            return false;
        }
        self.handlers.insert(type_code, handler);
        true
    }

    pub fn unregister(&mut self, type_code: u16) -> bool {
        self.handlers.remove(&type_code).is_some()
    }

    /// Default sink for application codes without a dedicated handler.
    pub fn set_app_callback(&mut self, cb: AppCallback) {
        self.app_callback = Some(cb);
    }

    pub fn dispatch(&mut self, view: &PackageView) -> Dispatch {
        let code = view.envelope.type_code;
        if let Some(&target) = self.internal.get(&code) {
            return Dispatch::Internal(target);
        }
        if let Some(handler) = self.handlers.get_mut(&code) {
            return Dispatch::Handled { consumed: handler(view) };
        }
        if code >= FIRST_PLUGIN_TYPE {
            if let Some(cb) = self.app_callback.as_mut() {
                cb(view);
                // The default path never consumes: broadcasts keep
                // flowing down the tree.
                return Dispatch::Handled { consumed: false };
            }
        }
        debug!(
            target: "treemesh::msg_types",
            code,
            from = view.envelope.from,
            "no handler for message type"
        );
        Dispatch::Unhandled
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
