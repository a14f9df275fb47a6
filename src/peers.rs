//! The live peer set: dialing, accepting, the kick policy, and the peer
//! manager loop that keeps the outbound count at its target.
//!
//! Outbound peers are the eclipse defense: we chose them, so an attacker who
//! merely connects to us never controls them. Inbound connections are
//! accepted up to the peer ceiling and may be kicked to admit newcomers;
//! outbound and local peers are never kicked.

use crate::addr::NetAddress;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::nodes;
use crate::rpc::RpcCall;
use crate::session::{PeerSession, SessionReader};
use crate::wire::{self, Handshake};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration, Instant};

/// A connected remote. Lives exactly as long as its session.
#[derive(Clone)]
pub struct Peer {
    /// The peer's dialback address: for outbound peers the address we
    /// dialed, for inbound peers the observed host plus the advertised port.
    pub address: NetAddress,
    /// Whether the remote initiated the connection.
    pub inbound: bool,
    /// Whether the peer is on the local network.
    pub local: bool,
    pub version: String,
    pub start_time: SystemTime,
    pub(crate) session: PeerSession,
}

/// Pick which peer to drop to admit a new inbound connection at the ceiling.
/// Only inbound peers are candidates; a local peer is never sacrificed for a
/// public newcomer; candidates on the newcomer's host go first (an address
/// monopolizing our slots loses one of its own). `None` means reject the
/// newcomer instead.
fn choose_kick_victim(
    peers: impl Iterator<Item = (NetAddress, bool, bool)>,
    new_host: &str,
    new_local: bool,
) -> Option<NetAddress> {
    let candidates: Vec<NetAddress> = peers
        .filter(|(_, inbound, local)| *inbound && (new_local || !*local))
        .map(|(addr, _, _)| addr)
        .collect();
    let same_host: Vec<NetAddress> =
        candidates.iter().filter(|a| a.host() == new_host).cloned().collect();
    let pool = if same_host.is_empty() { &candidates } else { &same_host };
    pool.choose(&mut rand::rng()).cloned()
}

impl Gateway {
    /// Form an outbound connection to `addr` and install it as a peer.
    pub async fn connect(&self, addr: NetAddress) -> Result<()> {
        let _guard = self.threads().add()?;
        if !addr.is_valid() {
            return Err(Error::InvalidArgument(format!("{addr} is not a dialable address")));
        }
        {
            let st = self.state_read();
            if addr == st.my_addr {
                return Err(Error::SelfConnect);
            }
            if st.peers.contains_key(&addr) {
                return Err(Error::AlreadyExists(format!("already connected to {addr}")));
            }
            if st.blacklist.contains(addr.host()) {
                return Err(Error::BlacklistRejected);
            }
        }

        let stream = timeout(self.config().dial_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| Error::Timeout)??;
        let (session, mut reader) = PeerSession::new(stream, self.rate().clone())?;

        // Dialer speaks first; the acceptor answers only if it wants us.
        session.write_handshake(&self.local_handshake()).await?;
        let remote_hs = match timeout(self.config().handshake_timeout, session.read_handshake(&mut reader)).await {
            Ok(Ok(hs)) => hs,
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(Error::Timeout);
            }
        };
        if let Err(e) = self.vet_handshake(&remote_hs) {
            session.close().await;
            return Err(e);
        }

        let peer = Peer {
            address: addr.clone(),
            inbound: false,
            local: addr.is_local(),
            version: remote_hs.version,
            start_time: SystemTime::now(),
            session: session.clone(),
        };
        if let Err(e) = self.managed_insert_peer(peer, reader, false) {
            session.close().await;
            return Err(e);
        }
        {
            let mut st = self.state_write();
            match st.nodes.get_mut(&addr) {
                Some(node) => {
                    node.was_outbound_peer = true;
                    st.mark_nodes_dirty();
                }
                // Manually-dialed DNS addresses stay out of the store.
                None => {
                    let _ = nodes::add_node(&mut st, addr.clone(), true);
                }
            }
        }

        if let Err(e) = self.run_connect_calls(&session).await {
            self.managed_drop_peer(&addr, &session).await;
            return Err(e);
        }
        tracing::info!("connected to outbound peer {addr}");
        Ok(())
    }

    /// Drop the connection to `addr`.
    pub async fn disconnect(&self, addr: &NetAddress) -> Result<()> {
        let _guard = self.threads().add()?;
        let session = {
            let mut st = self.state_write();
            match st.peers.remove(addr) {
                Some(p) => p.session,
                None => return Err(Error::NotFound(format!("not connected to {addr}"))),
            }
        };
        session.close().await;
        self.notify_peer_change();
        tracing::info!("disconnected from {addr}");
        Ok(())
    }

    /// Accept inbound connections until shutdown.
    pub(crate) async fn permanent_listen(&self, listener: TcpListener) {
        let Ok(_guard) = self.threads().add() else { return };
        let mut stop_rx = self.threads().stop_signal();
        let mut last_accept: HashMap<String, Instant> = HashMap::new();

        loop {
            let (stream, sock) = tokio::select! {
                _ = stop_rx.changed() => return,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        if self.threads().is_stopped() {
                            return;
                        }
                        tracing::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let host = sock.ip().to_string();
            let now = Instant::now();
            // Per-host accept shaping: an attacker cycling connections from
            // one address cannot churn the peer list.
            if let Some(prev) = last_accept.get(&host) {
                if now.duration_since(*prev) < self.config().min_accept_interval {
                    tracing::debug!("refusing rapid reconnect from {host}");
                    continue;
                }
            }
            if last_accept.len() > 1024 {
                let min_interval = self.config().min_accept_interval;
                last_accept.retain(|_, t| now.duration_since(*t) < min_interval);
            }
            last_accept.insert(host.clone(), now);

            // Blacklist check before a single byte is exchanged.
            if self.state_read().blacklist.contains(&host) {
                tracing::debug!("refusing blacklisted host {host}");
                continue;
            }

            let g = self.clone();
            tokio::spawn(async move {
                if let Err(e) = g.managed_accept_conn(stream, sock).await {
                    tracing::debug!("inbound connection from {sock} rejected: {e}");
                }
            });
        }
    }

    /// Handshake and install one accepted connection.
    pub(crate) async fn managed_accept_conn(&self, stream: TcpStream, sock: SocketAddr) -> Result<()> {
        let _guard = self.threads().add()?;
        let (session, mut reader) = PeerSession::new(stream, self.rate().clone())?;

        // Read the remote's greeting first: rejects close the socket without
        // ever answering.
        let remote_hs = match timeout(self.config().handshake_timeout, session.read_handshake(&mut reader)).await {
            Ok(Ok(hs)) => hs,
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(Error::Timeout);
            }
        };
        if let Err(e) = self.vet_handshake(&remote_hs) {
            session.close().await;
            return Err(e);
        }
        let Some(port) = remote_hs.net_address.port().filter(|p| *p != 0) else {
            session.close().await;
            return Err(Error::InvalidArgument("peer advertised an invalid dialback port".into()));
        };
        let dialback = NetAddress::from_parts(&sock.ip().to_string(), port);

        session.write_handshake(&self.local_handshake()).await?;

        let peer = Peer {
            address: dialback.clone(),
            inbound: true,
            local: dialback.is_local(),
            version: remote_hs.version,
            start_time: SystemTime::now(),
            session: session.clone(),
        };
        if let Err(e) = self.managed_insert_peer(peer, reader, true) {
            session.close().await;
            return Err(e);
        }
        // A successful inbound connection proves the host is real enough to
        // remember.
        {
            let mut st = self.state_write();
            let _ = nodes::add_node(&mut st, dialback.clone(), false);
        }

        if let Err(e) = self.run_connect_calls(&session).await {
            self.managed_drop_peer(&dialback, &session).await;
            return Err(e);
        }
        tracing::info!("accepted inbound peer {dialback}");
        Ok(())
    }

    fn vet_handshake(&self, hs: &Handshake) -> Result<()> {
        if hs.gateway_id == self.id() {
            return Err(Error::SelfConnect);
        }
        if hs.version.is_empty() {
            return Err(Error::InvalidArgument("peer sent an empty version".into()));
        }
        Ok(())
    }

    pub(crate) fn local_handshake(&self) -> Handshake {
        Handshake {
            version: wire::PROTOCOL_VERSION.to_string(),
            gateway_id: self.id(),
            net_address: self.address(),
        }
    }

    /// Install a peer, enforcing the ceilings. At the total ceiling an
    /// inbound accept kicks exactly one victim per the kick policy. A new
    /// inbound connection with the same dialback address replaces the stale
    /// one.
    fn managed_insert_peer(&self, peer: Peer, reader: SessionReader, allow_kick: bool) -> Result<()> {
        let (replaced, kicked) = {
            let mut st = self.state_write();
            let mut replaced = None;
            if let Some(old) = st.peers.remove(&peer.address) {
                if peer.inbound {
                    replaced = Some(old);
                } else {
                    st.peers.insert(peer.address.clone(), old);
                    return Err(Error::AlreadyExists(format!("already connected to {}", peer.address)));
                }
            }
            if !peer.inbound {
                let outbound = st.peers.values().filter(|p| !p.inbound).count();
                if outbound >= self.config().max_outbound_peers {
                    return Err(Error::TooManyPeers);
                }
            }
            let mut kicked = None;
            if st.peers.len() >= self.config().max_peers {
                if !allow_kick {
                    return Err(Error::TooManyPeers);
                }
                let victim = choose_kick_victim(
                    st.peers.values().map(|p| (p.address.clone(), p.inbound, p.local)),
                    peer.address.host(),
                    peer.local,
                );
                match victim {
                    Some(addr) => kicked = st.peers.remove(&addr),
                    None => return Err(Error::TooManyPeers),
                }
            }
            st.peers.insert(peer.address.clone(), peer.clone());
            (replaced, kicked)
        };

        if let Some(old) = replaced {
            tracing::debug!("replacing stale connection from {}", old.address);
            let session = old.session;
            tokio::spawn(async move { session.close().await });
        }
        if let Some(victim) = kicked {
            tracing::info!("kicking inbound peer {} to admit {}", victim.address, peer.address);
            let session = victim.session;
            tokio::spawn(async move { session.close().await });
        }
        self.notify_peer_change();
        self.spawn_session_task(peer, reader);
        Ok(())
    }

    /// Run the registered connect calls in order; any failure aborts the
    /// connection.
    async fn run_connect_calls(&self, session: &PeerSession) -> Result<()> {
        for (name, f) in self.rpcs().connect_calls() {
            let call = RpcCall {
                session: session.clone(),
                rpc_id: wire::rpc_id(&name),
                payload: Vec::new(),
                remote: session.remote().clone(),
            };
            if let Err(e) = f(call).await {
                tracing::debug!("connect call {name} to {} failed: {e}", session.remote());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close `session` and remove its peer entry, but only if the entry
    /// still belongs to this session. A replaced or kicked connection must
    /// not tear down its successor's entry on the way out.
    pub(crate) async fn managed_drop_peer(&self, addr: &NetAddress, session: &PeerSession) {
        let removed = {
            let mut st = self.state_write();
            match st.peers.get(addr) {
                Some(p) if p.session.same(session) => st.peers.remove(addr),
                _ => None,
            }
        };
        session.close().await;
        if removed.is_some() {
            self.notify_peer_change();
        }
    }

    /// Peer sessions run under the peer thread group: they can outlive every
    /// short-lived task and must not block its quiescence.
    fn spawn_session_task(&self, peer: Peer, reader: SessionReader) {
        let guard = match self.peer_tg().add() {
            Ok(g) => g,
            Err(_) => {
                let session = peer.session;
                tokio::spawn(async move { session.close().await });
                return;
            }
        };
        let g = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            g.run_session(peer, reader).await;
        });
    }

    /// Demultiplex one session until it closes or shutdown begins. Frames are
    /// matched against pending calls first; the rest dispatch to registered
    /// handlers, in arrival order.
    async fn run_session(&self, peer: Peer, mut reader: SessionReader) {
        let session = peer.session.clone();
        let mut stop_rx = self.peer_tg().stop_signal();
        let mut closed_rx = session.closed_signal();

        loop {
            if *stop_rx.borrow() || *closed_rx.borrow() {
                break;
            }
            let frame = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = closed_rx.changed() => break,
                frame = session.read_frame(&mut reader) => frame,
            };
            match frame {
                Ok((id, payload)) => {
                    if wire::is_reply(&id) {
                        let request = wire::request_id(&id);
                        if !session.match_response(&request, payload) {
                            tracing::debug!(
                                "peer {} sent an unmatched reply to {}",
                                peer.address,
                                wire::rpc_name(&request)
                            );
                        }
                        continue;
                    }
                    let Some(handler) = self.rpcs().handler(&id) else {
                        tracing::debug!("peer {} sent unknown rpc {}", peer.address, wire::rpc_name(&id));
                        continue;
                    };
                    let call = RpcCall {
                        session: session.clone(),
                        rpc_id: id,
                        payload,
                        remote: session.remote().clone(),
                    };
                    if let Err(e) = handler(call).await {
                        tracing::debug!("rpc {} from {} failed: {e}", wire::rpc_name(&id), peer.address);
                    }
                }
                Err(e) => {
                    tracing::debug!("session with {} ended: {e}", peer.address);
                    break;
                }
            }
        }
        self.managed_drop_peer(&peer.address, &session).await;
    }

    /// Keep the outbound peer count at its target by dialing candidates from
    /// the node store. Wakes on a tick and on peer-set changes.
    pub(crate) async fn permanent_peer_manager(&self) {
        let Ok(_guard) = self.threads().add() else { return };
        let mut stop_rx = self.threads().stop_signal();
        let mut change_rx = self.subscribe_peer_change();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = change_rx.changed() => {}
                _ = tokio::time::sleep(self.config().peer_manager_interval) => {}
            }
            if self.threads().is_stopped() {
                return;
            }

            let outbound = {
                let st = self.state_read();
                st.peers.values().filter(|p| !p.inbound).count()
            };
            if outbound >= self.config().max_outbound_peers {
                continue;
            }

            let Some(candidate) = self.managed_select_candidate() else { continue };
            {
                let mut st = self.state_write();
                if let Some(node) = st.nodes.get_mut(&candidate) {
                    node.last_dial_attempt = Some(Instant::now());
                }
            }
            tracing::debug!("peer manager dialing {candidate}");
            if let Err(e) = self.connect(candidate.clone()).await {
                tracing::debug!("outbound dial to {candidate} failed: {e}");
            }
        }
    }

    /// Pick a dial candidate, weighted by age since the last attempt.
    /// Excludes self, connected peers, blacklisted hosts, and anything
    /// attempted within the backoff window.
    fn managed_select_candidate(&self) -> Option<NetAddress> {
        // Never-dialed nodes weigh in as a week old.
        const MAX_AGE_SECS: u64 = 7 * 24 * 3600;

        let st = self.state_read();
        let now = Instant::now();
        let backoff = self.config().dial_backoff;

        let mut candidates: Vec<(NetAddress, u64)> = Vec::new();
        for node in st.nodes.values() {
            if node.address == st.my_addr
                || st.peers.contains_key(&node.address)
                || st.blacklist.contains(node.address.host())
            {
                continue;
            }
            let weight = match node.last_dial_attempt {
                None => MAX_AGE_SECS,
                Some(t) => {
                    let age = now.saturating_duration_since(t);
                    if age < backoff {
                        continue;
                    }
                    age.as_secs().clamp(1, MAX_AGE_SECS)
                }
            };
            candidates.push((node.address.clone(), weight));
        }
        drop(st);

        let total: u64 = candidates.iter().map(|(_, w)| w).sum();
        if total == 0 {
            return None;
        }
        let mut r = rand::rng().random_range(0..total);
        for (addr, weight) in candidates {
            if r < weight {
                return Some(addr);
            }
            r -= weight;
        }
        None
    }
}
