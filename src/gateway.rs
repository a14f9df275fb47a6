//! The gateway: assembles the node store, peer set, RPC registry, and rate
//! limiter into one handle and exposes the public API the rest of the node
//! consumes.
//!
//! Staying connected to honest peers is what keeps a node's view of the
//! network real. The defenses live in the pieces this module wires together:
//! outbound peers we chose ourselves, an ip-literal-only node store, a
//! host blacklist consulted before any handshake, and a kick policy that
//! makes slot monopolization expensive.
//!
//! Two shutdown domains: `threads` covers short-lived work, `peer_tg` covers
//! peer sessions, which can live for the lifetime of the process. On close
//! the peer group quiesces first, then the primary group drains and the final
//! save runs.

use crate::addr::NetAddress;
use crate::error::{Error, Result};
use crate::nodes::{self, Node};
use crate::peers::Peer;
use crate::persist::{self, PersistState};
use crate::ratelimit::RateLimiter;
use crate::rpc::{self, RpcCall, RpcRegistry};
use crate::threadgroup::ThreadGroup;
use crate::wire;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

/// Well-known nodes used to seed a fresh node store.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "143.198.64.12:9981",
    "165.22.58.130:9981",
    "188.166.42.155:9981",
    "51.158.112.84:9981",
    "92.243.26.141:9981",
];

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Address to listen on; port 0 picks a free one.
    pub listen_addr: String,
    /// Directory for gateway.json, nodes.json, and gateway.log.
    pub persist_dir: PathBuf,
    /// Seed the node store with `bootstrap_nodes` on startup.
    pub bootstrap: bool,
    pub bootstrap_nodes: Vec<NetAddress>,
    /// Ceiling on the total peer count, inbound plus outbound.
    pub max_peers: usize,
    /// Target (and ceiling) for outbound connections.
    pub max_outbound_peers: usize,
    /// The node manager stops asking peers for addresses at this store size.
    pub desired_nodes: usize,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub peer_manager_interval: Duration,
    pub node_manager_interval: Duration,
    pub node_purge_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before the purger evicts a node.
    pub probe_failure_limit: u32,
    /// How long a failed dial keeps a node out of candidate selection.
    pub dial_backoff: Duration,
    /// Minimum spacing between accepted connections from one host.
    pub min_accept_interval: Duration,
    pub save_interval: Duration,
    pub online_check_interval: Duration,
    /// Learn the external address via peers and the fallback service.
    /// Disabled in test rigs that must not touch the network.
    pub hostname_discovery: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: "0.0.0.0:9981".to_string(),
            persist_dir: PathBuf::from("vault-mesh-data"),
            bootstrap: true,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().copied().map(NetAddress::new).collect(),
            max_peers: 128,
            max_outbound_peers: 8,
            desired_nodes: 200,
            dial_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(60),
            peer_manager_interval: Duration::from_secs(15),
            node_manager_interval: Duration::from_secs(5),
            node_purge_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            probe_failure_limit: 5,
            dial_backoff: Duration::from_secs(600),
            min_accept_interval: Duration::from_secs(3),
            save_interval: Duration::from_secs(120),
            online_check_interval: Duration::from_secs(30),
            hostname_discovery: true,
        }
    }
}

/// Everything under the primary lock. Held only for state swaps, never
/// across network I/O; sessions are cloned out and used after release.
pub(crate) struct GatewayState {
    pub(crate) my_addr: NetAddress,
    pub(crate) peers: HashMap<NetAddress, Peer>,
    pub(crate) nodes: HashMap<NetAddress, Node>,
    /// Blacklisted hosts (no ports).
    pub(crate) blacklist: HashSet<String>,
    pub(crate) persist: PersistState,
    nodes_gen: u64,
    nodes_saved_gen: u64,
}

impl GatewayState {
    pub(crate) fn new(my_addr: NetAddress) -> Self {
        GatewayState {
            my_addr,
            peers: HashMap::new(),
            nodes: HashMap::new(),
            blacklist: HashSet::new(),
            persist: PersistState::default(),
            nodes_gen: 0,
            nodes_saved_gen: 0,
        }
    }

    /// Mark the node list changed so the save loop picks it up.
    pub(crate) fn mark_nodes_dirty(&mut self) {
        self.nodes_gen += 1;
    }

    pub(crate) fn nodes_dirty(&self) -> bool {
        self.nodes_gen != self.nodes_saved_gen
    }
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

pub(crate) struct GatewayInner {
    id: [u8; 8],
    config: GatewayConfig,
    state: RwLock<GatewayState>,
    threads: ThreadGroup,
    peer_tg: ThreadGroup,
    rpcs: RpcRegistry,
    rate: RateLimiter,
    peer_change_tx: watch::Sender<u64>,
}

impl Gateway {
    /// Start a gateway: load persisted state, bind the listener, and spawn
    /// the maintenance loops.
    pub async fn new(config: GatewayConfig) -> Result<Gateway> {
        std::fs::create_dir_all(&config.persist_dir)
            .map_err(|e| Error::Persist(format!("creating {}: {e}", config.persist_dir.display())))?;

        let mut id = [0u8; 8];
        rand::fill(&mut id);

        let saved = persist::load_state(&config.persist_dir)?.unwrap_or_default();
        let saved_nodes = persist::load_nodes(&config.persist_dir)?.unwrap_or_default();

        let rate = RateLimiter::new();
        rate.set_limits(saved.max_download_speed, saved.max_upload_speed)?;

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local = listener.local_addr()?;
        let host = if local.ip().is_unspecified() {
            // Placeholder until hostname discovery learns the real address.
            "localhost".to_string()
        } else {
            local.ip().to_string()
        };
        let my_addr = NetAddress::from_parts(&host, local.port());

        let mut state = GatewayState::new(my_addr.clone());
        state.blacklist = saved.blacklist.iter().cloned().collect();
        for node in saved_nodes {
            if !state.blacklist.contains(node.address.host()) {
                state.nodes.insert(node.address.clone(), node);
            }
        }
        state.persist = saved;

        let (peer_change_tx, _) = watch::channel(0u64);
        let gateway = Gateway {
            inner: Arc::new(GatewayInner {
                id,
                config,
                state: RwLock::new(state),
                threads: ThreadGroup::new(),
                peer_tg: ThreadGroup::new(),
                rpcs: RpcRegistry::new(),
                rate,
                peer_change_tx,
            }),
        };

        gateway.register_builtins()?;
        {
            // Built-in handler closures hold gateway handles; dropping them
            // on stop breaks the reference cycle.
            let g = gateway.clone();
            gateway.threads().on_stop(move || g.inner.rpcs.clear());
        }
        {
            let g = gateway.clone();
            gateway.threads().after_stop(move || g.managed_save_all());
        }

        if gateway.config().bootstrap {
            let mut st = gateway.state_write();
            for addr in &gateway.inner.config.bootstrap_nodes {
                match nodes::add_node(&mut st, addr.clone(), false) {
                    Ok(()) | Err(Error::AlreadyExists(_)) => {}
                    Err(e) => tracing::warn!("failed to add bootstrap node {addr}: {e}"),
                }
            }
        }

        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_listen(listener).await });
        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_peer_manager().await });
        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_node_manager().await });
        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_node_purger().await });
        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_save_loop().await });
        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_online_check().await });
        let g = gateway.clone();
        tokio::spawn(async move { g.permanent_hostname_learner().await });
        let g = gateway.clone();
        tokio::spawn(async move { g.threaded_forward_port().await });

        tracing::info!("gateway listening on {my_addr}");
        Ok(gateway)
    }

    /// Stop the gateway: peer sessions quiesce first, then the primary group
    /// drains and the final save runs. A second call returns `Shutdown`.
    pub async fn close(&self) -> Result<()> {
        tracing::info!("gateway shutting down");
        self.inner.peer_tg.stop().await?;
        self.inner.threads.stop().await?;
        Ok(())
    }

    // ── Public API ──

    /// The gateway's advertised address.
    pub fn address(&self) -> NetAddress {
        self.state_read().my_addr.clone()
    }

    /// Whether the gateway has at least one non-local peer.
    pub fn online(&self) -> bool {
        self.state_read().peers.values().any(|p| !p.local)
    }

    /// Snapshot of the connected peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.state_read().peers.values().cloned().collect()
    }

    /// The blacklisted hosts, sorted.
    pub fn blacklist(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.state_read().blacklist.iter().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Blacklist the hosts of `addrs`, dropping any connected peers on those
    /// hosts and purging them from the node store so they cannot be
    /// re-selected as replacements.
    pub async fn add_to_blacklist(&self, addrs: &[NetAddress]) -> Result<()> {
        let _guard = self.threads().add()?;
        {
            let mut st = self.state_write();
            for addr in addrs {
                st.blacklist.insert(addr.host().to_string());
            }
        }
        self.managed_enforce_blacklist().await;
        self.managed_sync_blacklist_persist();
        Ok(())
    }

    /// Remove hosts from the blacklist. Existing connections are untouched.
    pub async fn remove_from_blacklist(&self, addrs: &[NetAddress]) -> Result<()> {
        let _guard = self.threads().add()?;
        {
            let mut st = self.state_write();
            for addr in addrs {
                st.blacklist.remove(addr.host());
            }
        }
        self.managed_sync_blacklist_persist();
        Ok(())
    }

    /// Replace the blacklist wholesale, then enforce it.
    pub async fn set_blacklist(&self, addrs: &[NetAddress]) -> Result<()> {
        let _guard = self.threads().add()?;
        {
            let mut st = self.state_write();
            st.blacklist = addrs.iter().map(|a| a.host().to_string()).collect();
        }
        self.managed_enforce_blacklist().await;
        self.managed_sync_blacklist_persist();
        Ok(())
    }

    /// The configured bandwidth limits in bytes per second; (0, 0) means
    /// unlimited.
    pub fn rate_limits(&self) -> (i64, i64) {
        let st = self.state_read();
        (st.persist.max_download_speed, st.persist.max_upload_speed)
    }

    /// Set bandwidth limits. Takes effect immediately for all connected
    /// peers.
    pub fn set_rate_limits(&self, download_bps: i64, upload_bps: i64) -> Result<()> {
        let _guard = self.threads().add()?;
        self.inner.rate.set_limits(download_bps, upload_bps)?;
        {
            let mut st = self.state_write();
            st.persist.max_download_speed = download_bps;
            st.persist.max_upload_speed = upload_bps;
        }
        self.managed_save_state_logged();
        Ok(())
    }

    /// Register a handler for inbound frames with `name`'s rpc id.
    pub fn register_rpc<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(RpcCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.rpcs.register(name, rpc::rpc_func(handler))
    }

    pub fn unregister_rpc(&self, name: &str) -> Result<()> {
        self.inner.rpcs.unregister(name)
    }

    /// Register a call to run against every new connection right after its
    /// handshake. A failure aborts the connection.
    pub fn register_connect_call<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(RpcCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.rpcs.register_connect_call(name, rpc::rpc_func(handler))
    }

    pub fn unregister_connect_call(&self, name: &str) -> Result<()> {
        self.inner.rpcs.unregister_connect_call(name)
    }

    // ── Built-in RPCs ──

    fn register_builtins(&self) -> Result<()> {
        let g = self.clone();
        self.register_rpc("ShareNodes", move |call| {
            let g = g.clone();
            async move { g.managed_share_nodes(call).await }
        })?;
        let g = self.clone();
        self.register_rpc("DiscoverIP", move |call| {
            let g = g.clone();
            async move { g.managed_discover_peer_ip(call).await }
        })?;
        let g = self.clone();
        self.register_connect_call("ShareNodes", move |call| {
            let g = g.clone();
            async move { g.managed_request_nodes(&call.session).await.map(|_| ()) }
        })?;
        Ok(())
    }

    /// ShareNodes handler: reply with a uniform sample of known addresses.
    async fn managed_share_nodes(&self, call: RpcCall) -> Result<()> {
        let sample = {
            let st = self.state_read();
            nodes::random_nodes(&st, wire::MAX_SHARED_NODES)
        };
        call.respond(&wire::encode_node_list(&sample)).await
    }

    /// DiscoverIP handler: reply with the caller's observed remote host.
    async fn managed_discover_peer_ip(&self, call: RpcCall) -> Result<()> {
        call.respond(&wire::encode_str(call.remote.host())).await
    }

    // ── Blacklist internals ──

    /// Disconnect peers and purge nodes whose hosts are blacklisted.
    async fn managed_enforce_blacklist(&self) {
        let closing: Vec<(NetAddress, crate::session::PeerSession)> = {
            let mut st = self.state_write();
            let doomed: Vec<NetAddress> =
                st.peers.keys().filter(|a| st.blacklist.contains(a.host())).cloned().collect();
            let closing = doomed
                .iter()
                .filter_map(|a| st.peers.remove(a).map(|p| (a.clone(), p.session)))
                .collect();

            let before = st.nodes.len();
            let GatewayState { nodes, blacklist, .. } = &mut *st;
            nodes.retain(|a, _| !blacklist.contains(a.host()));
            if st.nodes.len() != before {
                st.mark_nodes_dirty();
            }
            closing
        };
        let dropped = !closing.is_empty();
        for (addr, session) in closing {
            session.close().await;
            tracing::info!("dropped blacklisted peer {addr}");
        }
        if dropped {
            self.notify_peer_change();
        }
    }

    /// Mirror the blacklist into the persist struct and save.
    fn managed_sync_blacklist_persist(&self) {
        {
            let mut st = self.state_write();
            let mut hosts: Vec<String> = st.blacklist.iter().cloned().collect();
            hosts.sort();
            st.persist.blacklist = hosts;
        }
        self.managed_save_state_logged();
        self.managed_save_nodes_if_dirty();
    }

    // ── Persistence ──

    /// Save gateway.json, logging instead of failing: persistence problems
    /// never block a mutation API and the save loop retries.
    pub(crate) fn managed_save_state_logged(&self) {
        let state = self.state_read().persist.clone();
        if let Err(e) = persist::save_state(&self.config().persist_dir, &state) {
            tracing::error!("unable to save gateway state: {e}");
        }
    }

    pub(crate) fn managed_save_nodes_if_dirty(&self) {
        let snapshot = {
            let st = self.state_read();
            if !st.nodes_dirty() {
                return;
            }
            (st.nodes.values().cloned().collect::<Vec<Node>>(), st.nodes_gen)
        };
        let (node_list, gen) = snapshot;
        match persist::save_nodes(&self.config().persist_dir, &node_list) {
            Ok(()) => {
                let mut st = self.state_write();
                if st.nodes_saved_gen < gen {
                    st.nodes_saved_gen = gen;
                }
            }
            Err(e) => tracing::error!("unable to save node list: {e}"),
        }
    }

    /// Final unconditional save, run from the after-stop hook.
    fn managed_save_all(&self) {
        let (state, node_list) = {
            let st = self.state_read();
            (st.persist.clone(), st.nodes.values().cloned().collect::<Vec<Node>>())
        };
        if let Err(e) = persist::save_state(&self.config().persist_dir, &state) {
            tracing::error!("unable to save gateway state: {e}");
        }
        if let Err(e) = persist::save_nodes(&self.config().persist_dir, &node_list) {
            tracing::error!("unable to save node list: {e}");
        }
    }

    pub(crate) async fn permanent_save_loop(&self) {
        let Ok(_guard) = self.threads().add() else { return };
        loop {
            if !self.threads().sleep(self.config().save_interval).await {
                return;
            }
            self.managed_save_nodes_if_dirty();
            self.managed_save_state_logged();
        }
    }

    /// Periodically log online-state transitions for visibility.
    pub(crate) async fn permanent_online_check(&self) {
        let Ok(_guard) = self.threads().add() else { return };
        let mut was_online = false;
        loop {
            if !self.threads().sleep(self.config().online_check_interval).await {
                return;
            }
            let online = self.online();
            if online != was_online {
                if online {
                    tracing::info!("gateway is online");
                } else {
                    tracing::warn!("gateway is offline: no public peers connected");
                }
                was_online = online;
            }
        }
    }

    // ── Crate-internal accessors ──

    pub(crate) fn id(&self) -> [u8; 8] {
        self.inner.id
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub(crate) fn threads(&self) -> &ThreadGroup {
        &self.inner.threads
    }

    pub(crate) fn peer_tg(&self) -> &ThreadGroup {
        &self.inner.peer_tg
    }

    pub(crate) fn rpcs(&self) -> &RpcRegistry {
        &self.inner.rpcs
    }

    pub(crate) fn rate(&self) -> &RateLimiter {
        &self.inner.rate
    }

    pub(crate) fn state_read(&self) -> RwLockReadGuard<'_, GatewayState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_write(&self) -> RwLockWriteGuard<'_, GatewayState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_peer_change(&self) {
        self.inner.peer_change_tx.send_modify(|c| *c += 1);
    }

    pub(crate) fn subscribe_peer_change(&self) -> watch::Receiver<u64> {
        self.inner.peer_change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_gateway(tweak: impl FnOnce(&mut GatewayConfig)) -> (Gateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        tweak(&mut config);
        let gateway = Gateway::new(config).await.unwrap();
        (gateway, dir)
    }

    fn test_config(persist_dir: PathBuf) -> GatewayConfig {
        GatewayConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            persist_dir,
            bootstrap: false,
            peer_manager_interval: Duration::from_millis(100),
            node_manager_interval: Duration::from_millis(50),
            node_purge_interval: Duration::from_secs(3600),
            min_accept_interval: Duration::ZERO,
            dial_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
            save_interval: Duration::from_secs(3600),
            hostname_discovery: false,
            ..GatewayConfig::default()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test]
    async fn connect_installs_peers_on_both_sides() {
        let (g1, _d1) = test_gateway(|_| {}).await;
        let (g2, _d2) = test_gateway(|_| {}).await;

        g1.connect(g2.address()).await.unwrap();

        let g2_addr = g2.address();
        assert!(g1.peers().iter().any(|p| p.address == g2_addr && !p.inbound));
        let g1_addr = g1.address();
        wait_for(|| g2.peers().iter().any(|p| p.address == g1_addr && p.inbound)).await;

        // The outbound side remembers the node as a former outbound peer.
        assert!(g1.state_read().nodes.get(&g2_addr).is_some_and(|n| n.was_outbound_peer));
        // Loopback peers never make a gateway online.
        assert!(!g1.online());

        g1.close().await.unwrap();
        g2.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_rejects_self_and_duplicates() {
        let (g1, _d1) = test_gateway(|_| {}).await;
        let (g2, _d2) = test_gateway(|_| {}).await;

        assert!(matches!(g1.connect(g1.address()).await, Err(Error::SelfConnect)));

        g1.connect(g2.address()).await.unwrap();
        assert!(matches!(g1.connect(g2.address()).await, Err(Error::AlreadyExists(_))));

        g1.close().await.unwrap();
        g2.close().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_removes_the_peer() {
        let (g1, _d1) = test_gateway(|_| {}).await;
        let (g2, _d2) = test_gateway(|_| {}).await;

        let addr = g2.address();
        g1.connect(addr.clone()).await.unwrap();
        g1.disconnect(&addr).await.unwrap();
        assert!(g1.peers().is_empty());
        assert!(matches!(g1.disconnect(&addr).await, Err(Error::NotFound(_))));

        // The other side notices the close.
        wait_for(|| g2.peers().is_empty()).await;

        g1.close().await.unwrap();
        g2.close().await.unwrap();
    }

    #[tokio::test]
    async fn blacklist_drops_peer_and_nodes() {
        let (g1, _d1) = test_gateway(|_| {}).await;
        let (g2, _d2) = test_gateway(|_| {}).await;

        let addr = g2.address();
        g1.connect(addr.clone()).await.unwrap();

        g1.add_to_blacklist(std::slice::from_ref(&addr)).await.unwrap();
        assert_eq!(g1.blacklist(), vec![addr.host().to_string()]);
        assert!(g1.peers().is_empty());
        assert!(!g1.state_read().nodes.keys().any(|a| a.host() == addr.host()));

        // Re-connecting and re-learning the host are both refused.
        assert!(matches!(g1.connect(addr.clone()).await, Err(Error::BlacklistRejected)));
        {
            let mut st = g1.state_write();
            assert!(matches!(
                nodes::add_node(&mut st, addr.clone(), false),
                Err(Error::BlacklistRejected)
            ));
        }

        // Removal restores connectivity without touching anything live.
        g1.remove_from_blacklist(std::slice::from_ref(&addr)).await.unwrap();
        assert!(g1.blacklist().is_empty());
        g1.connect(addr).await.unwrap();

        g1.close().await.unwrap();
        g2.close().await.unwrap();
    }

    #[tokio::test]
    async fn set_blacklist_replaces_atomically() {
        let (g1, _d1) = test_gateway(|_| {}).await;

        let a = NetAddress::new("1.2.3.4:9981");
        let b = NetAddress::new("5.6.7.8:9981");
        g1.add_to_blacklist(std::slice::from_ref(&a)).await.unwrap();
        g1.set_blacklist(std::slice::from_ref(&b)).await.unwrap();
        assert_eq!(g1.blacklist(), vec!["5.6.7.8".to_string()]);
        g1.set_blacklist(&[]).await.unwrap();
        assert!(g1.blacklist().is_empty());

        g1.close().await.unwrap();
    }

    #[tokio::test]
    async fn share_nodes_spreads_only_ip_literals() {
        let (g2, _d2) = test_gateway(|_| {}).await;
        {
            let mut st = g2.state_write();
            for i in 1..=20 {
                nodes::add_node(&mut st, NetAddress::new(format!("10.1.1.{i}:9981")), false).unwrap();
            }
            // A DNS name never even enters g2's own store.
            assert!(nodes::add_node(&mut st, NetAddress::new("seed.example.com:9981"), false).is_err());
        }

        let (g1, _d1) = test_gateway(|_| {}).await;
        g1.connect(g2.address()).await.unwrap();

        // 20 shared addresses plus g2 itself.
        wait_for(|| g1.state_read().nodes.len() >= 21).await;
        {
            let st = g1.state_read();
            assert!(st.nodes.keys().all(|a| a.is_ip_literal()));
            for i in 1..=20 {
                assert!(st.nodes.contains_key(&NetAddress::new(format!("10.1.1.{i}:9981"))));
            }
        }

        g1.close().await.unwrap();
        g2.close().await.unwrap();
    }

    #[tokio::test]
    async fn inbound_at_ceiling_kicks_exactly_one() {
        let (server, _d) = test_gateway(|c| c.max_peers = 2).await;
        let (c1, _d1) = test_gateway(|_| {}).await;
        let (c2, _d2) = test_gateway(|_| {}).await;
        let (c3, _d3) = test_gateway(|_| {}).await;

        c1.connect(server.address()).await.unwrap();
        c2.connect(server.address()).await.unwrap();
        wait_for(|| server.peers().len() == 2).await;

        // A third inbound connection displaces one existing inbound peer.
        c3.connect(server.address()).await.unwrap();
        let c3_addr = c3.address();
        wait_for(|| server.peers().iter().any(|p| p.address == c3_addr)).await;
        assert!(server.peers().len() <= 2);

        for g in [server, c1, c2, c3] {
            g.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn persisted_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let node_addr = NetAddress::new("9.9.9.9:1111");
        let banned = NetAddress::new("6.6.6.6:9981");

        {
            let g = Gateway::new(test_config(dir.path().to_path_buf())).await.unwrap();
            g.set_rate_limits(1_000_000, 250_000).unwrap();
            g.add_to_blacklist(std::slice::from_ref(&banned)).await.unwrap();
            {
                let mut st = g.state_write();
                nodes::add_node(&mut st, node_addr.clone(), true).unwrap();
            }
            g.close().await.unwrap();
        }

        {
            let g = Gateway::new(test_config(dir.path().to_path_buf())).await.unwrap();
            assert_eq!(g.rate_limits(), (1_000_000, 250_000));
            assert_eq!(g.blacklist(), vec!["6.6.6.6".to_string()]);
            {
                let st = g.state_read();
                assert!(st.nodes.get(&node_addr).is_some_and(|n| n.was_outbound_peer));
            }
            g.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn apis_fail_after_close() {
        let (g, _d) = test_gateway(|_| {}).await;
        g.close().await.unwrap();
        assert!(matches!(g.connect(NetAddress::new("1.2.3.4:9981")).await, Err(Error::Shutdown)));
        assert!(matches!(g.set_rate_limits(1, 1), Err(Error::Shutdown)));
        assert!(matches!(g.add_to_blacklist(&[]).await, Err(Error::Shutdown)));
        assert!(matches!(g.close().await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn registered_rpcs_serve_peers() {
        let (g1, _d1) = test_gateway(|_| {}).await;
        let (g2, _d2) = test_gateway(|_| {}).await;

        g2.register_rpc("EchoBytes", |call| async move { call.respond(&call.payload).await })
            .unwrap();
        assert!(matches!(
            g2.register_rpc("EchoBytes", |_c| async { Ok(()) }),
            Err(Error::AlreadyExists(_))
        ));

        g1.connect(g2.address()).await.unwrap();
        let session = {
            let st = g1.state_read();
            st.peers.values().next().unwrap().session.clone()
        };
        let resp = session.call(wire::rpc_id("EchoBytes"), b"over the wire").await.unwrap();
        assert_eq!(resp, b"over the wire");

        g2.unregister_rpc("EchoBytes").unwrap();
        assert!(matches!(g2.unregister_rpc("EchoBytes"), Err(Error::NotFound(_))));

        g1.close().await.unwrap();
        g2.close().await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_validation() {
        let (g, _d) = test_gateway(|_| {}).await;
        assert!(matches!(g.set_rate_limits(-5, 0), Err(Error::InvalidArgument(_))));
        g.set_rate_limits(0, 0).unwrap();
        assert_eq!(g.rate_limits(), (0, 0));
        g.close().await.unwrap();
    }
}
