//! Externally-visible address discovery, and the router port-forward
//! primitive.
//!
//! Peers are asked `DiscoverIP` for their view of our remote host; the
//! plurality answer wins once at least three peers agree. With too few
//! peers (or too little agreement) we fall back to a third-party lookup
//! service. The fallback is a single service and therefore a trust
//! concentration; acceptable only because peers are consulted first.

use crate::addr::NetAddress;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::wire;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

const FALLBACK_IP_SERVICE: &str = "https://icanhazip.com";
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How many peer answers must agree before we trust them.
const MIN_AGREEING_ANSWERS: usize = 3;

/// How many outbound peers to ask per discovery attempt.
const DISCOVERY_PEERS: usize = 10;

/// Delay between discovery attempts while none has succeeded.
const REDISCOVER_DELAY: Duration = Duration::from_secs(30);

/// The most frequent parsable answer, if it was given at least `min` times.
fn plurality_answer(answers: &[String], min: usize) -> Option<IpAddr> {
    let mut counts: HashMap<IpAddr, usize> = HashMap::new();
    for answer in answers {
        if let Ok(ip) = answer.trim().parse::<IpAddr>() {
            *counts.entry(ip).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .filter(|(_, n)| *n >= min)
        .map(|(ip, _)| ip)
}

impl Gateway {
    /// Discover the gateway's current public IP. Blocking and potentially
    /// slow; the optional channel cancels the discovery.
    pub async fn discover_address(&self, cancel: Option<oneshot::Receiver<()>>) -> Result<IpAddr> {
        let _guard = self.threads().add()?;
        match cancel {
            Some(mut cancel) => tokio::select! {
                res = self.managed_learn_hostname() => res,
                _ = &mut cancel => Err(Error::Shutdown),
            },
            None => self.managed_learn_hostname().await,
        }
    }

    /// Startup loop: retry discovery until an answer lands, then set the
    /// advertised address once and exit.
    pub(crate) async fn permanent_hostname_learner(&self) {
        if !self.config().hostname_discovery {
            return;
        }
        let Ok(_guard) = self.threads().add() else { return };
        let mut stop_rx = self.threads().stop_signal();
        loop {
            let attempt = tokio::select! {
                _ = stop_rx.changed() => return,
                res = self.managed_learn_hostname() => res,
            };
            match attempt {
                Ok(ip) => {
                    self.managed_set_host(ip);
                    return;
                }
                Err(e) => tracing::debug!("hostname discovery failed: {e}"),
            }
            if !self.threads().sleep(REDISCOVER_DELAY).await {
                return;
            }
        }
    }

    async fn managed_learn_hostname(&self) -> Result<IpAddr> {
        // Ask outbound peers first: they already talk to us, and a majority
        // of self-chosen peers is harder to corrupt than any one service.
        let sessions: Vec<(NetAddress, crate::session::PeerSession)> = {
            let st = self.state_read();
            st.peers
                .values()
                .filter(|p| !p.inbound)
                .take(DISCOVERY_PEERS)
                .map(|p| (p.address.clone(), p.session.clone()))
                .collect()
        };

        let mut answers = Vec::new();
        for (addr, session) in sessions {
            match timeout(self.config().rpc_timeout, session.call(wire::rpc_id("DiscoverIP"), &[])).await {
                Ok(Ok(resp)) => match wire::decode_str(&resp) {
                    Ok(answer) => answers.push(answer),
                    Err(e) => tracing::debug!("bad DiscoverIP reply from {addr}: {e}"),
                },
                Ok(Err(e)) => tracing::debug!("DiscoverIP to {addr} failed: {e}"),
                Err(_) => tracing::debug!("DiscoverIP to {addr} timed out"),
            }
            if let Some(ip) = plurality_answer(&answers, MIN_AGREEING_ANSWERS) {
                tracing::info!("peers agree our external address is {ip}");
                return Ok(ip);
            }
        }

        tracing::debug!("not enough peer agreement, falling back to {FALLBACK_IP_SERVICE}");
        let client = reqwest::Client::builder()
            .timeout(FALLBACK_TIMEOUT)
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let text = client
            .get(FALLBACK_IP_SERVICE)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
            .text()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        text.trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("lookup service returned {:?}", text.trim())))
    }

    /// Swap the advertised host, keeping the listen port. Peers that connect
    /// from here on see the corrected address.
    fn managed_set_host(&self, ip: IpAddr) {
        let mut st = self.state_write();
        let port = st.my_addr.port().unwrap_or(0);
        st.my_addr = NetAddress::from_parts(&ip.to_string(), port);
        tracing::info!("gateway address set to {}", st.my_addr);
    }

    /// Ask the configured router to forward `port` to us. The router URL
    /// comes from the persisted settings; without one this is `NotFound`.
    pub async fn forward_port(&self, port: u16) -> Result<()> {
        let _guard = self.threads().add()?;
        let router_url = self.state_read().persist.router_url.clone();
        if router_url.is_empty() {
            return Err(Error::NotFound("no router configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(FALLBACK_TIMEOUT)
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let url = format!("{}/forward?port={port}", router_url.trim_end_matches('/'));
        client
            .post(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        tracing::info!("router is forwarding port {port}");
        Ok(())
    }

    /// Best-effort forward of the listen port at startup.
    pub(crate) async fn threaded_forward_port(&self) {
        let Some(port) = self.address().port() else { return };
        match self.forward_port(port).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                tracing::debug!("no router configured, skipping port forwarding");
            }
            Err(e) => tracing::warn!("could not forward port {port}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plurality_needs_three_agreeing() {
        assert_eq!(plurality_answer(&answers(&["1.2.3.4", "1.2.3.4"]), 3), None);
        assert_eq!(
            plurality_answer(&answers(&["1.2.3.4", "1.2.3.4", "1.2.3.4"]), 3),
            Some("1.2.3.4".parse().unwrap())
        );
    }

    #[test]
    fn plurality_picks_the_majority() {
        let list = answers(&["9.9.9.9", "1.2.3.4", "1.2.3.4", "9.9.9.9", "9.9.9.9"]);
        assert_eq!(plurality_answer(&list, 3), Some("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn plurality_ignores_garbage() {
        let list = answers(&["not an ip", "", "1.2.3.4", "junk", "1.2.3.4", "1.2.3.4"]);
        assert_eq!(plurality_answer(&list, 3), Some("1.2.3.4".parse().unwrap()));
        let all_junk = answers(&["a", "b", "c"]);
        assert_eq!(plurality_answer(&all_junk, 3), None);
    }

    #[test]
    fn plurality_trims_whitespace() {
        let list = answers(&["1.2.3.4\n", " 1.2.3.4 ", "1.2.3.4"]);
        assert_eq!(plurality_answer(&list, 3), Some("1.2.3.4".parse().unwrap()));
    }
}
