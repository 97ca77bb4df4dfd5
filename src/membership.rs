//! Membership / Failure Detector (C2): the active-peer table `A` plus the
//! two periodic duties (heartbeat sender, heartbeat monitor) that keep it
//! current. This module knows nothing about the CS state machine; peer.rs
//! wires eviction notifications into `cs` via the `on_evict` callback
//! passed to `run_monitor`, keeping the C2 -> C3 coupling one-directional
//! and out of this module's own locking.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    config::Config,
    transport::{Rpc, RpcReply, Transport},
};

const PEER_PREFIX: &str = "Peer";

/// The active-peer table `A`, guarded by `membership_mutex`. Self is
/// never a member.
#[derive(Default)]
pub struct ActivePeers {
    inner: Mutex<HashMap<String, Instant>>,
}

impl ActivePeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts `from`'s last-heartbeat instant to now. The dominant path
    /// by which `A` is maintained after initial discovery.
    pub fn record_heartbeat(&self, from: &str) {
        self.inner
            .lock()
            .unwrap()
            .insert(from.to_string(), Instant::now());
    }

    pub fn insert_now(&self, name: &str) {
        self.inner.lock().unwrap().insert(name.to_string(), Instant::now());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    /// Removes a single peer, e.g. a non-replier evicted after a timed-out
    /// `enter()` round.
    pub fn remove(&self, name: &str) {
        self.inner.lock().unwrap().remove(name);
    }

    /// A snapshot of currently-active peer names, e.g. to seed
    /// `expected_repliers` when entering the CS.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    /// Removes every entry silent for longer than `timeout` and returns
    /// their names. Pure table maintenance: callers are responsible for
    /// propagating the eviction into any CS-level bookkeeping.
    fn sweep_expired(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut table = self.inner.lock().unwrap();
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            table.remove(name);
        }
        expired
    }
}

/// Runs the heartbeat sender loop forever: every `interval`, discover
/// newly-registered peers (probing each with `hello` before trusting it),
/// then heartbeat everyone currently active. Intended to be spawned as
/// its own task; never returns under normal operation.
pub async fn run_heartbeat_sender(
    self_name: String,
    active: &ActivePeers,
    transport: &(impl Transport + ?Sized),
    config: Config,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    loop {
        ticker.tick().await;
        discover(&self_name, active, transport).await;
        let peers = active.snapshot();
        for peer in peers {
            match transport
                .invoke(&peer, Rpc::ReceiveHeartbeat { from: self_name.clone() })
                .await
            {
                Ok(RpcReply::Ack) => {}
                Ok(other) => warn!(%peer, ?other, "unexpected reply to heartbeat"),
                Err(error) => warn!(%peer, %error, "failed to send heartbeat"),
            }
        }
    }
}

async fn discover(self_name: &str, active: &ActivePeers, transport: &(impl Transport + ?Sized)) {
    let registered = match transport.lookup_peers(PEER_PREFIX, self_name).await {
        Ok(registered) => registered,
        Err(error) => {
            warn!(%error, "failed to query name registry");
            return;
        }
    };
    for peer in registered {
        if active.contains(&peer) {
            continue;
        }
        // probe before trusting a newly-registered peer; failures are
        // silently ignored
        if matches!(transport.invoke(&peer, Rpc::Hello).await, Ok(RpcReply::Ack)) {
            debug!(%peer, "discovered new active peer");
            active.insert_now(&peer);
        }
    }
}

/// Runs the heartbeat monitor loop forever: every `interval`, evicts
/// peers silent beyond `timeout` and invokes `on_evict` with their names
/// so CS-level side effects (dropping a pending request's dependency on
/// a now-dead replier, clearing it from the deferred queue) can be
/// applied without this module taking the CS lock itself.
pub async fn run_heartbeat_monitor(
    active: &ActivePeers,
    config: Config,
    mut on_evict: impl FnMut(&str),
) {
    let mut ticker = tokio::time::interval(config.monitor_interval);
    loop {
        ticker.tick().await;
        for name in active.sweep_expired(config.heartbeat_timeout) {
            debug!(peer = %name, "evicting silent peer");
            on_evict(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_expired_removes_only_stale_entries() {
        let active = ActivePeers::new();
        active.insert_now("fresh");
        {
            let mut table = active.inner.lock().unwrap();
            table.insert("stale".to_string(), Instant::now() - Duration::from_secs(10));
        }
        let expired = active.sweep_expired(Duration::from_secs(5));
        assert_eq!(expired, vec!["stale".to_string()]);
        assert!(active.contains("fresh"));
        assert!(!active.contains("stale"));
    }
}
