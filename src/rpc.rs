//! RPC registry: the per-gateway name-to-handler tables.
//!
//! Handlers fire when an inbound frame's rpc id matches. Connect calls fire
//! once per new connection, in registration order, right after the handshake;
//! a failing connect call aborts the connection. The rest of the node extends
//! the gateway by registering its own entries in both tables.

use crate::addr::NetAddress;
use crate::error::{Error, Result};
use crate::session::PeerSession;
use crate::wire::{self, RpcId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

pub type RpcFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
pub type RpcFunc = Arc<dyn Fn(RpcCall) -> RpcFuture + Send + Sync + 'static>;

/// One dispatched invocation: an inbound frame for handlers, or a fresh
/// connection (empty payload) for connect calls.
pub struct RpcCall {
    pub session: PeerSession,
    pub rpc_id: RpcId,
    pub payload: Vec<u8>,
    /// The remote's observed socket address.
    pub remote: NetAddress,
}

impl RpcCall {
    /// Send the response to this call.
    pub async fn respond(&self, payload: &[u8]) -> Result<()> {
        self.session.reply(self.rpc_id, payload).await
    }
}

/// Wrap an async fn into an [`RpcFunc`].
pub fn rpc_func<F, Fut>(f: F) -> RpcFunc
where
    F: Fn(RpcCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

/// Request ids must leave the reply bit clear, so names are ASCII.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.is_ascii() {
        return Err(Error::InvalidArgument(format!("rpc name {name:?} must be non-empty ascii")));
    }
    Ok(())
}

pub(crate) struct RpcRegistry {
    handlers: Mutex<HashMap<RpcId, RpcFunc>>,
    connect_calls: Mutex<Vec<(String, RpcFunc)>>,
}

impl RpcRegistry {
    pub(crate) fn new() -> Self {
        RpcRegistry {
            handlers: Mutex::new(HashMap::new()),
            connect_calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, name: &str, f: RpcFunc) -> Result<()> {
        check_name(name)?;
        let id = wire::rpc_id(name);
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("rpc {name}")));
        }
        handlers.insert(id, f);
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) -> Result<()> {
        let id = wire::rpc_id(name);
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        match handlers.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("rpc {name}"))),
        }
    }

    pub(crate) fn register_connect_call(&self, name: &str, f: RpcFunc) -> Result<()> {
        check_name(name)?;
        let mut calls = self.connect_calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.iter().any(|(n, _)| n == name) {
            return Err(Error::AlreadyExists(format!("connect call {name}")));
        }
        calls.push((name.to_string(), f));
        Ok(())
    }

    pub(crate) fn unregister_connect_call(&self, name: &str) -> Result<()> {
        let mut calls = self.connect_calls.lock().unwrap_or_else(PoisonError::into_inner);
        match calls.iter().position(|(n, _)| n == name) {
            Some(i) => {
                calls.remove(i);
                Ok(())
            }
            None => Err(Error::NotFound(format!("connect call {name}"))),
        }
    }

    pub(crate) fn handler(&self, id: &RpcId) -> Option<RpcFunc> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Connect calls in registration order.
    pub(crate) fn connect_calls(&self) -> Vec<(String, RpcFunc)> {
        self.connect_calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drop every entry. Run on shutdown so handler closures release their
    /// captured gateway handles.
    pub(crate) fn clear(&self) {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.connect_calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
