//! Peer wire format: handshakes, RPC frames, and the payload codecs for the
//! built-in RPCs. All length prefixes are u64 little-endian.
//!
//! The codecs here are pure byte-level encode/decode; the session layer owns
//! the actual socket reads and writes.

use crate::addr::NetAddress;
use crate::error::{Error, Result};

/// Version string sent in the handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on a single frame payload.
pub const MAX_FRAME_PAYLOAD: u64 = 1 << 20; // 1 MiB

/// Upper bound on the handshake blob.
pub const MAX_HANDSHAKE_LEN: u64 = 1024;

/// Maximum number of addresses in a ShareNodes reply.
pub const MAX_SHARED_NODES: usize = 10;

const MAX_STR_LEN: u64 = 256;

/// RPC identifier: the first eight bytes of the name, zero-padded.
pub type RpcId = [u8; 8];

/// Response frames carry the request's id with this bit set on the first
/// byte. Names are ASCII, so a request id can never collide with a reply id
/// and both directions can run the same RPC concurrently.
const REPLY_FLAG: u8 = 0x80;

pub fn rpc_id(name: &str) -> RpcId {
    let mut id = [0u8; 8];
    let bytes = name.as_bytes();
    let n = bytes.len().min(8);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

/// The id a response to `id` is sent under.
pub fn reply_id(id: &RpcId) -> RpcId {
    let mut reply = *id;
    reply[0] |= REPLY_FLAG;
    reply
}

pub fn is_reply(id: &RpcId) -> bool {
    id[0] & REPLY_FLAG != 0
}

/// The request id a reply id answers.
pub fn request_id(id: &RpcId) -> RpcId {
    let mut request = *id;
    request[0] &= !REPLY_FLAG;
    request
}

/// Printable form of an rpc id, for logging.
pub fn rpc_name(id: &RpcId) -> String {
    let end = id.iter().position(|&b| b == 0).unwrap_or(8);
    String::from_utf8_lossy(&id[..end]).into_owned()
}

/// The greeting exchanged in both directions when a connection forms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub version: String,
    pub gateway_id: [u8; 8],
    /// The sender's advertised dialback address.
    pub net_address: NetAddress,
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u64).to_le_bytes());
    out.extend_from_slice(b);
}

fn get_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let end = *pos + 8;
    if buf.len() < end {
        return Err(Error::InvalidArgument("truncated length prefix".into()));
    }
    let mut le = [0u8; 8];
    le.copy_from_slice(&buf[*pos..end]);
    *pos = end;
    Ok(u64::from_le_bytes(le))
}

fn get_bytes<'a>(buf: &'a [u8], pos: &mut usize, max: u64) -> Result<&'a [u8]> {
    let len = get_u64(buf, pos)?;
    if len > max {
        return Err(Error::InvalidArgument(format!("field of {len} bytes exceeds limit {max}")));
    }
    let end = *pos + len as usize;
    if buf.len() < end {
        return Err(Error::InvalidArgument("truncated field".into()));
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

fn get_str(buf: &[u8], pos: &mut usize) -> Result<String> {
    let raw = get_bytes(buf, pos, MAX_STR_LEN)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidArgument("field is not utf-8".into()))
}

pub fn encode_handshake(hs: &Handshake) -> Vec<u8> {
    let mut out = Vec::new();
    put_bytes(&mut out, hs.version.as_bytes());
    out.extend_from_slice(&hs.gateway_id);
    put_bytes(&mut out, hs.net_address.as_str().as_bytes());
    out
}

pub fn decode_handshake(buf: &[u8]) -> Result<Handshake> {
    let mut pos = 0;
    let version = get_str(buf, &mut pos)?;
    if buf.len() < pos + 8 {
        return Err(Error::InvalidArgument("truncated gateway id".into()));
    }
    let mut gateway_id = [0u8; 8];
    gateway_id.copy_from_slice(&buf[pos..pos + 8]);
    pos += 8;
    let net_address = NetAddress::new(get_str(buf, &mut pos)?);
    if pos != buf.len() {
        return Err(Error::InvalidArgument("trailing bytes in handshake".into()));
    }
    Ok(Handshake { version, gateway_id, net_address })
}

/// Encode a frame: 8-byte rpc id, u64-LE payload length, payload.
pub fn encode_frame(id: RpcId, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() as u64 > MAX_FRAME_PAYLOAD {
        return Err(Error::InvalidArgument(format!("frame payload of {} bytes too large", payload.len())));
    }
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&id);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// ShareNodes reply payload: u64-LE count, then length-prefixed addresses.
pub fn encode_node_list(addrs: &[NetAddress]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(addrs.len() as u64).to_le_bytes());
    for addr in addrs {
        put_bytes(&mut out, addr.as_str().as_bytes());
    }
    out
}

pub fn decode_node_list(buf: &[u8]) -> Result<Vec<NetAddress>> {
    let mut pos = 0;
    let count = get_u64(buf, &mut pos)?;
    if count as usize > MAX_SHARED_NODES {
        return Err(Error::InvalidArgument(format!("node list of {count} entries too long")));
    }
    let mut addrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        addrs.push(NetAddress::new(get_str(buf, &mut pos)?));
    }
    if pos != buf.len() {
        return Err(Error::InvalidArgument("trailing bytes in node list".into()));
    }
    Ok(addrs)
}

/// Single length-prefixed string payload (DiscoverIP reply).
pub fn encode_str(s: &str) -> Vec<u8> {
    let mut out = Vec::new();
    put_bytes(&mut out, s.as_bytes());
    out
}

pub fn decode_str(buf: &[u8]) -> Result<String> {
    let mut pos = 0;
    let s = get_str(buf, &mut pos)?;
    if pos != buf.len() {
        return Err(Error::InvalidArgument("trailing bytes in string payload".into()));
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_id_padding_and_truncation() {
        assert_eq!(rpc_id("ShareNodes"), *b"ShareNod");
        assert_eq!(rpc_id("Ping"), *b"Ping\0\0\0\0");
        assert_eq!(rpc_name(&rpc_id("Ping")), "Ping");
        assert_eq!(rpc_name(&rpc_id("DiscoverIP")), "Discover");
    }

    #[test]
    fn reply_ids_are_distinct_and_reversible() {
        let id = rpc_id("ShareNodes");
        let reply = reply_id(&id);
        assert!(!is_reply(&id));
        assert!(is_reply(&reply));
        assert_ne!(id, reply);
        assert_eq!(request_id(&reply), id);
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake {
            version: PROTOCOL_VERSION.to_string(),
            gateway_id: [1, 2, 3, 4, 5, 6, 7, 8],
            net_address: NetAddress::new("1.2.3.4:9981"),
        };
        let buf = encode_handshake(&hs);
        assert!(buf.len() as u64 <= MAX_HANDSHAKE_LEN);
        assert_eq!(decode_handshake(&buf).unwrap(), hs);
    }

    #[test]
    fn handshake_truncated() {
        let hs = Handshake {
            version: "1.0.0".to_string(),
            gateway_id: [9; 8],
            net_address: NetAddress::new("1.2.3.4:9981"),
        };
        let buf = encode_handshake(&hs);
        for cut in [0, 3, 10, buf.len() - 1] {
            assert!(decode_handshake(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn frame_layout() {
        let frame = encode_frame(rpc_id("ShareNodes"), b"abc").unwrap();
        assert_eq!(&frame[..8], b"ShareNod");
        assert_eq!(u64::from_le_bytes(frame[8..16].try_into().unwrap()), 3);
        assert_eq!(&frame[16..], b"abc");
    }

    #[test]
    fn frame_payload_bounded() {
        let big = vec![0u8; MAX_FRAME_PAYLOAD as usize + 1];
        assert!(encode_frame(rpc_id("X"), &big).is_err());
    }

    #[test]
    fn node_list_roundtrip() {
        let addrs = vec![
            NetAddress::new("1.2.3.4:9981"),
            NetAddress::new("5.6.7.8:9981"),
        ];
        let buf = encode_node_list(&addrs);
        assert_eq!(decode_node_list(&buf).unwrap(), addrs);
        assert_eq!(decode_node_list(&encode_node_list(&[])).unwrap(), vec![]);
    }

    #[test]
    fn node_list_rejects_oversized_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(1000u64).to_le_bytes());
        assert!(decode_node_list(&buf).is_err());
    }

    #[test]
    fn str_roundtrip() {
        let buf = encode_str("5.5.5.5");
        assert_eq!(decode_str(&buf).unwrap(), "5.5.5.5");
        assert!(decode_str(&buf[..buf.len() - 1]).is_err());
    }
}
