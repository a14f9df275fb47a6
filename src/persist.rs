//! Gateway persistence: `gateway.json` for settings and the blacklist,
//! `nodes.json` for the known-node list. Every write is a write-temp,
//! fsync, rename so a crash can never leave a half-written file behind.

use crate::error::{Error, Result};
use crate::nodes::Node;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

pub const NODES_FILE: &str = "nodes.json";
pub const GATEWAY_FILE: &str = "gateway.json";
pub const LOG_FILE: &str = "gateway.log";

/// The mutable gateway settings that survive a restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistState {
    #[serde(default)]
    pub router_url: String,
    #[serde(default)]
    pub max_download_speed: i64,
    #[serde(default)]
    pub max_upload_speed: i64,
    /// Blacklisted hosts (no ports).
    #[serde(default)]
    pub blacklist: Vec<String>,
}

pub fn load_state(dir: &Path) -> Result<Option<PersistState>> {
    load_json(&dir.join(GATEWAY_FILE))
}

pub fn save_state(dir: &Path, state: &PersistState) -> Result<()> {
    save_json(&dir.join(GATEWAY_FILE), state)
}

pub fn load_nodes(dir: &Path) -> Result<Option<Vec<Node>>> {
    load_json(&dir.join(NODES_FILE))
}

pub fn save_nodes(dir: &Path, nodes: &[Node]) -> Result<()> {
    save_json(&dir.join(NODES_FILE), &nodes)
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Persist(format!("corrupt {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Persist(format!("reading {}: {e}", path.display()))),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Persist(format!("encoding {}: {e}", path.display())))?;
    atomic_write(path, &bytes)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json_temp");
    let write = || -> std::io::Result<()> {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    write().map_err(|e| Error::Persist(format!("writing {}: {e}", path.display())))
}
