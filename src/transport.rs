//! The Remote Invocation Facade (C4): an abstract "call method M on peer
//! named P" contract. The protocol core (`membership`, `cs`) only depends
//! on the `Transport` trait below; a real network implementation (wire
//! codec, connection pooling, service discovery) is an external
//! collaborator and is not shipped here.
//!
//! `LocalTransport` is the one implementation this crate provides: an
//! in-process registry of peer handles, used by tests and the demo
//! binary. It can be configured to drop or delay calls to specific
//! targets, which is how the test suite drives eviction and timeout
//! scenarios without a real network.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// One RPC surface a peer exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Rpc {
    Hello,
    RequestResource { timestamp: Clock, requester: String },
    ReceiveReply { from: String },
    ReceiveHeartbeat { from: String },
}

/// Reply to an `Rpc`. `Hello`/`ReceiveReply`/`ReceiveHeartbeat` carry no
/// payload beyond success; `RequestResource` carries the grant/defer bool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    Ack,
    Grant(bool),
}

/// A transport-layer failure: the call never reached the peer, or the
/// peer did not answer in time. Never distinguishes "peer is down" from
/// "network is down" — the caller treats both as a missing reply.
#[derive(Debug, thiserror::Error)]
#[error("transport error calling {method} on {target}: {reason}")]
pub struct TransportError {
    pub target: String,
    pub method: &'static str,
    pub reason: String,
}

/// Abstract facade consumed by `membership` and `cs`. Implementations
/// need not be internally concurrent: the core wraps every `invoke` in
/// its own task when fan-out is required.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Enumerate peers registered under `prefix`, excluding `self_name`.
    async fn lookup_peers(&self, prefix: &str, self_name: &str) -> anyhow::Result<Vec<String>>;

    /// Invoke `rpc` on the peer named `target`.
    async fn invoke(&self, target: &str, rpc: Rpc) -> Result<RpcReply, TransportError>;
}

#[derive(Default)]
struct Link {
    drop_calls: bool,
    delay: Option<Duration>,
}

/// A handle a registered peer implements to answer inbound RPCs. Kept
/// separate from the `Peer` coordination engine itself so the transport
/// module has no dependency on `cs`/`membership`.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn on_rpc(&self, rpc: Rpc) -> RpcReply;
}

#[derive(Default)]
struct Registry {
    peers: HashMap<String, Arc<dyn RpcHandler>>,
    links: HashMap<String, Link>,
}

/// An in-process name registry and RPC router. Clone is cheap (shares the
/// underlying registry via `Arc`); every peer in a test or demo process
/// holds one clone.
#[derive(Clone)]
pub struct LocalTransport {
    registry: Arc<Mutex<Registry>>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Registers `name` under the conventional peer prefix so it is
    /// discoverable by `lookup_peers` and callable by `invoke`.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.registry
            .lock()
            .unwrap()
            .peers
            .insert(name.into(), handler);
    }

    pub fn deregister(&self, name: &str) {
        self.registry.lock().unwrap().peers.remove(name);
    }

    /// Makes every future call to `target` fail as a transport error,
    /// simulating a crashed or partitioned peer without removing its
    /// registration (so `lookup_peers` still finds it, matching a process
    /// that is alive but unreachable).
    pub fn cut(&self, target: &str) {
        self.registry
            .lock()
            .unwrap()
            .links
            .entry(target.to_string())
            .or_default()
            .drop_calls = true;
    }

    pub fn restore(&self, target: &str) {
        if let Some(link) = self.registry.lock().unwrap().links.get_mut(target) {
            link.drop_calls = false;
        }
    }

    /// Adds an artificial delay before calls to `target` are delivered.
    pub fn delay(&self, target: &str, delay: Duration) {
        self.registry
            .lock()
            .unwrap()
            .links
            .entry(target.to_string())
            .or_default()
            .delay = Some(delay);
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn lookup_peers(&self, prefix: &str, self_name: &str) -> anyhow::Result<Vec<String>> {
        let registry = self.registry.lock().unwrap();
        Ok(registry
            .peers
            .keys()
            .filter(|name| name.starts_with(prefix) && name.as_str() != self_name)
            .cloned()
            .collect())
    }

    async fn invoke(&self, target: &str, rpc: Rpc) -> Result<RpcReply, TransportError> {
        let method = match &rpc {
            Rpc::Hello => "hello",
            Rpc::RequestResource { .. } => "request_resource",
            Rpc::ReceiveReply { .. } => "receive_reply",
            Rpc::ReceiveHeartbeat { .. } => "receive_heartbeat",
        };
        let (handler, delay) = {
            let registry = self.registry.lock().unwrap();
            if registry.links.get(target).is_some_and(|l| l.drop_calls) {
                return Err(TransportError {
                    target: target.to_string(),
                    method,
                    reason: "link cut".to_string(),
                });
            }
            let handler = registry.peers.get(target).cloned().ok_or_else(|| TransportError {
                target: target.to_string(),
                method,
                reason: "not registered".to_string(),
            })?;
            let delay = registry.links.get(target).and_then(|l| l.delay);
            (handler, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handler.on_rpc(rpc).await)
    }
}

impl crate::peer::RegisterOn for LocalTransport {
    fn register_on(&self, name: String, handler: Arc<dyn RpcHandler>) {
        self.register(name, handler);
    }
}
