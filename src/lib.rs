//! vault-mesh: the networking and streaming core of a decentralized
//! cloud-storage node.
//!
//! Two subsystems:
//!
//! - The **gateway** connects the node to a flood-propagation peer network.
//!   It keeps a defensible list of known nodes, maintains a small set of
//!   self-chosen outbound peers (the eclipse-attack defense), and exposes a
//!   pluggable RPC registry that the rest of the node rides on top of.
//! - The **stream buffer** turns random-access, high-latency data sources
//!   into smooth `read`/`seek` byte streams, with a shared refcounted cache
//!   that deduplicates fetches across concurrent readers of the same
//!   content.
//!
//! ```no_run
//! use vault_mesh::{Gateway, GatewayConfig, NetAddress};
//!
//! # async fn run() -> vault_mesh::Result<()> {
//! let gateway = Gateway::new(GatewayConfig::default()).await?;
//! gateway.connect(NetAddress::new("143.198.64.12:9981")).await?;
//! println!("online: {}", gateway.online());
//! gateway.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod error;
pub mod gateway;
mod hostname;
mod lru;
pub mod nodes;
pub mod peers;
pub mod persist;
mod ratelimit;
pub mod rpc;
pub mod session;
pub mod stream;
pub mod streambuffer;
pub mod threadgroup;
pub mod wire;

pub use addr::NetAddress;
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayConfig};
pub use peers::Peer;
pub use stream::Stream;
pub use streambuffer::{DataSource, SourceId, StreamBufferSet};
