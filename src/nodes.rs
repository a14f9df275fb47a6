//! The node store: every address the gateway knows about, and the two loops
//! that grow and prune it.
//!
//! The node manager asks random outbound peers for more addresses until the
//! store reaches its target size. The purger probe-dials random non-peer
//! nodes and evicts the ones that keep failing. Only ip-literal addresses are
//! accepted, so a peer cannot feed us DNS names it controls.

use crate::addr::NetAddress;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, GatewayState};
use crate::session::PeerSession;
use crate::wire;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// One known network address. Persisted; the probe bookkeeping is not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub address: NetAddress,
    pub was_outbound_peer: bool,
    /// Consecutive failed probe dials; reset on success.
    #[serde(skip)]
    pub(crate) probe_failures: u32,
    /// When the peer manager last tried to dial this node.
    #[serde(skip)]
    pub(crate) last_dial_attempt: Option<Instant>,
}

impl Node {
    pub fn new(address: NetAddress, was_outbound_peer: bool) -> Self {
        Node { address, was_outbound_peer, probe_failures: 0, last_dial_attempt: None }
    }
}

/// Add an address to the node store. Rejects our own address, non-ip-literal
/// or portless addresses, blacklisted hosts, and duplicates.
pub(crate) fn add_node(st: &mut GatewayState, addr: NetAddress, was_outbound_peer: bool) -> Result<()> {
    if addr == st.my_addr {
        return Err(Error::SelfConnect);
    }
    if !addr.is_valid() || !addr.is_ip_literal() {
        return Err(Error::InvalidArgument(format!("{addr} is not an ip-literal address")));
    }
    if st.blacklist.contains(addr.host()) {
        return Err(Error::BlacklistRejected);
    }
    if st.nodes.contains_key(&addr) {
        return Err(Error::AlreadyExists(addr.to_string()));
    }
    st.nodes.insert(addr.clone(), Node::new(addr, was_outbound_peer));
    st.mark_nodes_dirty();
    Ok(())
}

pub(crate) fn remove_node(st: &mut GatewayState, addr: &NetAddress) -> Result<()> {
    match st.nodes.remove(addr) {
        Some(_) => {
            st.mark_nodes_dirty();
            Ok(())
        }
        None => Err(Error::NotFound(addr.to_string())),
    }
}

/// A uniform random sample of up to `k` known addresses.
pub(crate) fn random_nodes(st: &GatewayState, k: usize) -> Vec<NetAddress> {
    let mut rng = rand::rng();
    st.nodes.keys().cloned().choose_multiple(&mut rng, k)
}

impl Gateway {
    /// Ask one peer for nodes and merge the reply. Returns how many new
    /// addresses survived the ip-literal and blacklist filters.
    pub(crate) async fn managed_request_nodes(&self, session: &PeerSession) -> Result<usize> {
        let resp = tokio::time::timeout(
            self.config().rpc_timeout,
            session.call(wire::rpc_id("ShareNodes"), &[]),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        let addrs = wire::decode_node_list(&resp)?;

        let mut st = self.state_write();
        let mut added = 0;
        for addr in addrs {
            if add_node(&mut st, addr, false).is_ok() {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Grow the node store by asking random outbound peers for addresses.
    pub(crate) async fn permanent_node_manager(&self) {
        let Ok(_guard) = self.threads().add() else { return };
        loop {
            if !self.threads().sleep(self.config().node_manager_interval).await {
                return;
            }
            let (node_count, pick) = {
                let st = self.state_read();
                let mut rng = rand::rng();
                let pick = st
                    .peers
                    .values()
                    .filter(|p| !p.inbound)
                    .choose(&mut rng)
                    .map(|p| (p.address.clone(), p.session.clone()));
                (st.nodes.len(), pick)
            };
            if node_count >= self.config().desired_nodes {
                continue;
            }
            let Some((addr, session)) = pick else { continue };
            match self.managed_request_nodes(&session).await {
                Ok(added) if added > 0 => {
                    tracing::debug!("node manager learned {added} nodes from {addr}");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("ShareNodes to {addr} failed: {e}"),
            }
        }
    }

    /// Probe random non-peer nodes and evict the persistently unreachable.
    pub(crate) async fn permanent_node_purger(&self) {
        let Ok(_guard) = self.threads().add() else { return };
        loop {
            if !self.threads().sleep(self.config().node_purge_interval).await {
                return;
            }
            let candidate = {
                let st = self.state_read();
                let mut rng = rand::rng();
                st.nodes
                    .keys()
                    .filter(|a| !st.peers.contains_key(*a) && **a != st.my_addr)
                    .cloned()
                    .choose(&mut rng)
            };
            let Some(addr) = candidate else { continue };

            let alive = matches!(
                tokio::time::timeout(self.config().probe_timeout, TcpStream::connect(addr.as_str())).await,
                Ok(Ok(_))
            );

            let mut st = self.state_write();
            // The node may have become a peer or been removed while we probed.
            if st.peers.contains_key(&addr) {
                continue;
            }
            let Some(node) = st.nodes.get_mut(&addr) else { continue };
            if alive {
                node.probe_failures = 0;
                continue;
            }
            node.probe_failures += 1;
            if node.probe_failures >= self.config().probe_failure_limit {
                st.nodes.remove(&addr);
                st.mark_nodes_dirty();
                tracing::info!("purged unreachable node {addr}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GatewayState {
        GatewayState::new(NetAddress::new("8.8.8.8:9981"))
    }

    #[test]
    fn add_enforces_ip_literal_rule() {
        let mut st = state();
        add_node(&mut st, NetAddress::new("1.2.3.4:9981"), false).unwrap();
        assert!(matches!(
            add_node(&mut st, NetAddress::new("example.com:9981"), false),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            add_node(&mut st, NetAddress::new("1.2.3.4:0"), false),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(st.nodes.len(), 1);
        assert!(st.nodes_dirty());
    }

    #[test]
    fn add_rejects_self_duplicates_and_blacklisted() {
        let mut st = state();
        assert!(matches!(
            add_node(&mut st, NetAddress::new("8.8.8.8:9981"), false),
            Err(Error::SelfConnect)
        ));

        add_node(&mut st, NetAddress::new("1.2.3.4:9981"), false).unwrap();
        assert!(matches!(
            add_node(&mut st, NetAddress::new("1.2.3.4:9981"), false),
            Err(Error::AlreadyExists(_))
        ));

        st.blacklist.insert("6.6.6.6".to_string());
        assert!(matches!(
            add_node(&mut st, NetAddress::new("6.6.6.6:9981"), false),
            Err(Error::BlacklistRejected)
        ));
    }

    #[test]
    fn remove_node_reports_missing() {
        let mut st = state();
        let addr = NetAddress::new("1.2.3.4:9981");
        add_node(&mut st, addr.clone(), false).unwrap();
        remove_node(&mut st, &addr).unwrap();
        assert!(matches!(remove_node(&mut st, &addr), Err(Error::NotFound(_))));
    }

    #[test]
    fn random_sample_is_bounded() {
        let mut st = state();
        for i in 0..20 {
            add_node(&mut st, NetAddress::new(format!("10.0.0.{i}:9981")), false).unwrap();
        }
        let sample = random_nodes(&st, 10);
        assert_eq!(sample.len(), 10);
        let all = random_nodes(&st, 100);
        assert_eq!(all.len(), 20);
        // No duplicates in a sample.
        let mut sorted = sample.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), sample.len());
    }
}
