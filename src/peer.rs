//! Glue between the clock, the active-peer table and the transport
//! facade: a `Peer` owns the CS state (`cs`, guarded by a plain
//! `std::sync::Mutex` so holding the guard across an `.await` is a
//! compile error) and the active-peer table (`active`, with its own
//! lock), and is the only type application code talks to directly.
//!
//! Lock order, whenever both are needed: `cs` before `active`. The one
//! path that would naturally want the opposite order -- the heartbeat
//! monitor discovering an eviction -- never takes both at once:
//! `ActivePeers::sweep_expired` snapshots and removes under its own lock
//! alone, returns, and only then does `Peer::handle_eviction` take `cs`
//! to apply side effects.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::{
    clock::{has_priority, Clock},
    config::Config,
    cs::{CsState, State},
    membership::{self, ActivePeers},
    transport::{Rpc, RpcHandler, RpcReply, Transport},
};

pub struct Peer<T> {
    name: String,
    cs: std::sync::Mutex<CsState>,
    active: ActivePeers,
    transport: T,
    config: Config,
    weak_self: Weak<Peer<T>>,
}

impl<T: Transport> Peer<T> {
    pub fn new(name: impl Into<String>, transport: T, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            name: name.into(),
            cs: std::sync::Mutex::new(CsState::new()),
            active: ActivePeers::new(),
            transport,
            config,
            weak_self: weak_self.clone(),
        })
    }

    /// An owned handle to self, for tasks that must outlive the calling
    /// stack frame. Never fails: every live `Peer` is reachable through
    /// at least the `Arc` returned by `new`/`spawn_peer`.
    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("peer dropped its own strong reference")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_peers(&self) -> Vec<String> {
        self.active.snapshot()
    }

    pub fn state(&self) -> State {
        self.cs.lock().unwrap().state()
    }

    /// Spawns the heartbeat sender and monitor loops. Returns their join
    /// handles so a caller (the CLI binary, or a test) can abort them on
    /// shutdown; under normal operation neither loop returns.
    pub fn spawn_background_tasks(&self) -> BackgroundTasks {
        let sender = {
            let peer = self.arc();
            tokio::spawn(async move {
                membership::run_heartbeat_sender(
                    peer.name.clone(),
                    &peer.active,
                    &peer.transport,
                    peer.config,
                )
                .await
            })
        };
        let monitor = {
            let peer = self.arc();
            tokio::spawn(async move {
                membership::run_heartbeat_monitor(&peer.active, peer.config, |evicted| {
                    peer.handle_eviction(evicted)
                })
                .await
            })
        };
        BackgroundTasks { sender, monitor }
    }

    /// Local caller asks to acquire the CS: arms a fresh request, fans
    /// `REQUEST` out to every currently-active peer, and waits for the
    /// round to either complete or time out. Returns `Ok(true)` only when
    /// every expected reply arrived before `max_wait_time` elapsed;
    /// returns `Ok(false)` (without error) for a request that is already
    /// in flight or that timed out -- those are ordinary outcomes, not
    /// failures of the facade.
    pub async fn enter(&self) -> anyhow::Result<bool> {
        let (notify, expected, request_timestamp) = {
            let mut cs = self.cs.lock().unwrap();
            match cs.state {
                State::Held => return Ok(true),
                State::Wanted => return Ok(false),
                State::Released => {}
            }
            let request_timestamp = cs.clock.tick();
            cs.state = State::Wanted;
            cs.request_timestamp = Some(request_timestamp);
            cs.expected_repliers = self.active.snapshot().into_iter().collect();
            cs.received_replies.clear();
            let notify = Arc::new(tokio::sync::Notify::new());
            cs.notify = Some(notify.clone());
            if cs.all_replies_received() {
                // no active peers to wait on: satisfied immediately
                notify.notify_one();
            }
            (notify, cs.expected_repliers.clone(), request_timestamp)
        };

        debug!(peer = %self.name, ?request_timestamp, count = expected.len(), "requesting critical section");
        for target in expected {
            let peer = self.arc();
            tokio::spawn(async move { peer.send_request(target, request_timestamp).await });
        }

        let _ = tokio::time::timeout(self.config.max_wait_time, notify.notified()).await;

        let (granted, stragglers, deferred) = {
            let mut cs = self.cs.lock().unwrap();
            if cs.all_replies_received() {
                cs.state = State::Held;
                cs.request_timestamp = None;
                let peer = self.arc();
                cs.hold_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(peer.config.max_access_time).await;
                    warn!(peer = %peer.name, "hold timeout elapsed, forcing release");
                    let _ = peer.exit().await;
                }));
                (true, Vec::new(), Vec::new())
            } else {
                cs.state = State::Released;
                let stragglers: Vec<String> = cs
                    .expected_repliers
                    .difference(&cs.received_replies)
                    .cloned()
                    .collect();
                cs.request_timestamp = None;
                let deferred: Vec<String> = cs.deferred.drain(..).collect();
                (false, stragglers, deferred)
            }
        };

        if granted {
            info!(peer = %self.name, "entered critical section");
        } else {
            warn!(peer = %self.name, missing = ?stragglers, "timed out waiting for replies");
            for straggler in &stragglers {
                self.active.remove(straggler);
            }
            self.flush_deferred(deferred).await;
        }
        Ok(granted)
    }

    /// Local caller releases the CS: clears the hold, cancels its timer,
    /// and sends every deferred `REPLY` that piled up while it was held.
    /// A no-op returning `Ok(false)` when not currently held.
    pub async fn exit(&self) -> anyhow::Result<bool> {
        let (timer, deferred) = {
            let mut cs = self.cs.lock().unwrap();
            if cs.state != State::Held {
                return Ok(false);
            }
            cs.state = State::Released;
            let timer = cs.hold_timer.take();
            let deferred: Vec<String> = cs.deferred.drain(..).collect();
            (timer, deferred)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        info!(peer = %self.name, "released critical section");
        self.flush_deferred(deferred).await;
        Ok(true)
    }

    async fn send_request(self: Arc<Self>, target: String, request_timestamp: Clock) {
        match self
            .transport
            .invoke(
                &target,
                Rpc::RequestResource {
                    timestamp: request_timestamp,
                    requester: self.name.clone(),
                },
            )
            .await
        {
            Ok(RpcReply::Grant(true)) => self.on_reply(&target).await,
            Ok(RpcReply::Grant(false)) => {
                debug!(peer = %self.name, from = %target, "request deferred, awaiting reply");
            }
            Ok(other) => warn!(peer = %self.name, from = %target, ?other, "unexpected reply kind"),
            Err(error) => {
                // a send failure counts as a missing reply for this round
                // and is not retried; the waiting `enter()` either times
                // out or the heartbeat monitor evicts the silent peer
                warn!(peer = %self.name, target = %target, %error, "request send failed");
            }
        }
    }

    async fn flush_deferred(&self, deferred: Vec<String>) {
        for target in deferred {
            match self
                .transport
                .invoke(&target, Rpc::ReceiveReply { from: self.name.clone() })
                .await
            {
                Ok(_) => debug!(peer = %self.name, to = %target, "sent deferred reply"),
                Err(error) => warn!(peer = %self.name, to = %target, %error, "deferred reply send failed"),
            }
        }
    }

    /// Inbound: another peer asks to be granted the CS. Denied while
    /// `Held`, or while `Wanted` with a higher-priority outstanding
    /// request of our own; granted otherwise. The clock merges the
    /// remote timestamp regardless of the outcome.
    pub async fn on_request(&self, remote_timestamp: Clock, from: &str) -> bool {
        let mut cs = self.cs.lock().unwrap();
        let denied = cs.state == State::Held
            || (cs.state == State::Wanted
                && has_priority(
                    cs.request_timestamp.expect("Wanted implies a request timestamp"),
                    &self.name,
                    remote_timestamp,
                    from,
                ));
        cs.clock.merge(remote_timestamp);
        if denied {
            cs.deferred.insert(from.to_string());
            false
        } else {
            true
        }
    }

    /// Inbound: another peer has granted us. Ignored outright unless a
    /// request is in flight and `from` is one of its expected repliers;
    /// a second reply from the same peer is likewise ignored rather than
    /// double-counted. Wakes the waiting `enter()` once the round
    /// completes.
    pub async fn on_reply(&self, from: &str) {
        let notify = {
            let mut cs = self.cs.lock().unwrap();
            if cs.state != State::Wanted || !cs.expected_repliers.contains(from) {
                if cs.state == State::Wanted {
                    warn!(peer = %self.name, %from, "reply from unexpected peer, ignored");
                }
                return;
            }
            if !cs.received_replies.insert(from.to_string()) {
                return;
            }
            cs.all_replies_received().then(|| cs.notify.clone()).flatten()
        };
        if let Some(notify) = notify {
            notify.notify_one();
        }
    }

    /// Inbound: heartbeat assertion from another peer.
    pub fn receive_heartbeat(&self, from: &str) {
        self.active.record_heartbeat(from);
    }

    /// Applies the CS-level side effects of evicting `name`: it can no
    /// longer owe us a reply (drop from the deferred queue), and if it
    /// was a pending replier for an in-flight request, dropping it may
    /// complete that round and wake `enter()`. Always called after the
    /// membership lock has already been released, so this only ever
    /// takes `cs` -- never both locks nested.
    fn handle_eviction(&self, name: &str) {
        let notify = {
            let mut cs = self.cs.lock().unwrap();
            cs.deferred.shift_remove(name);
            if cs.state == State::Wanted && cs.expected_repliers.shift_remove(name) {
                cs.all_replies_received().then(|| cs.notify.clone()).flatten()
            } else {
                None
            }
        };
        if let Some(notify) = notify {
            debug!(peer = %self.name, evicted = %name, "eviction satisfied pending request");
            notify.notify_one();
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> RpcHandler for Peer<T> {
    async fn on_rpc(&self, rpc: Rpc) -> RpcReply {
        match rpc {
            Rpc::Hello => RpcReply::Ack,
            Rpc::RequestResource { timestamp, requester } => {
                RpcReply::Grant(self.on_request(timestamp, &requester).await)
            }
            Rpc::ReceiveReply { from } => {
                self.on_reply(&from).await;
                RpcReply::Ack
            }
            Rpc::ReceiveHeartbeat { from } => {
                self.receive_heartbeat(&from);
                RpcReply::Ack
            }
        }
    }
}

pub struct BackgroundTasks {
    pub sender: tokio::task::JoinHandle<()>,
    pub monitor: tokio::task::JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.sender.abort();
        self.monitor.abort();
    }
}

/// Registers `peer` with `transport` under its own name so inbound RPCs
/// and discovery can reach it, then starts its heartbeat tasks.
pub fn spawn_peer<T: Transport + Clone + 'static>(
    name: impl Into<String>,
    transport: T,
    config: Config,
) -> (Arc<Peer<T>>, BackgroundTasks)
where
    T: RegisterOn,
{
    let peer = Peer::new(name, transport.clone(), config);
    transport.register_on(peer.name().to_string(), peer.clone() as Arc<dyn RpcHandler>);
    let tasks = peer.spawn_background_tasks();
    (peer, tasks)
}

/// Narrow seam so `spawn_peer` can register a handler without depending
/// on `LocalTransport` concretely; the only implementor in this crate is
/// `LocalTransport`, but a real transport would implement it the same
/// way.
pub trait RegisterOn {
    fn register_on(&self, name: String, handler: Arc<dyn RpcHandler>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    fn test_peer(name: &str) -> Arc<Peer<LocalTransport>> {
        Peer::new(name, LocalTransport::new(), Config::test_scaled())
    }

    #[tokio::test]
    async fn on_request_denies_while_held_regardless_of_priority() {
        let peer = test_peer("m");
        peer.cs.lock().unwrap().state = State::Held;
        // even a remote with a much smaller timestamp is denied: HELD
        // always wins
        assert!(!peer.on_request(Clock::ZERO, "a").await);
        assert!(peer.cs.lock().unwrap().deferred.contains("a"));
    }

    #[tokio::test]
    async fn on_request_breaks_ties_by_name() {
        let peer = test_peer("m");
        let ts = {
            let mut cs = peer.cs.lock().unwrap();
            let ts = cs.clock.tick();
            cs.state = State::Wanted;
            cs.request_timestamp = Some(ts);
            ts
        };

        // "m" < "z": local wins, remote is deferred
        assert!(!peer.on_request(ts, "z").await);
        // "a" < "m": remote wins, granted immediately
        assert!(peer.on_request(ts, "a").await);
    }

    #[tokio::test]
    async fn deferred_queue_has_set_semantics() {
        let peer = test_peer("m");
        peer.cs.lock().unwrap().state = State::Held;
        peer.on_request(Clock::ZERO, "a").await;
        peer.on_request(Clock::ZERO, "a").await;
        assert_eq!(
            peer.cs.lock().unwrap().deferred.iter().filter(|name| *name == "a").count(),
            1
        );
    }

    #[tokio::test]
    async fn exit_while_released_is_a_harmless_no_op() {
        let peer = test_peer("m");
        assert!(!peer.exit().await.unwrap());
        assert_eq!(peer.state(), State::Released);
    }

    #[tokio::test]
    async fn concurrent_local_enter_is_rejected() {
        let peer = test_peer("m");
        peer.cs.lock().unwrap().state = State::Wanted;
        assert!(!peer.enter().await.unwrap());
        // rejected without disturbing the in-flight request's state
        assert_eq!(peer.state(), State::Wanted);
    }

    #[tokio::test]
    async fn enter_while_held_is_idempotent() {
        let peer = test_peer("m");
        peer.cs.lock().unwrap().state = State::Held;
        assert!(peer.enter().await.unwrap());
        assert_eq!(peer.state(), State::Held);
    }
}
