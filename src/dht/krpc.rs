//! The KRPC message model of BEP-5: single bencoded dictionaries over UDP,
//! carrying queries, responses, and errors, correlated by transaction id.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde_bytes::ByteBuf;

use super::routing::NodeId;
use crate::error::*;

/// Protocol error, also used for bad tokens.
pub(crate) const ERROR_PROTOCOL: i64 = 203;
/// Method unknown.
pub(crate) const ERROR_METHOD_UNKNOWN: i64 = 204;

pub(crate) const QUERY_PING: &str = "ping";
pub(crate) const QUERY_FIND_NODE: &str = "find_node";
pub(crate) const QUERY_GET_PEERS: &str = "get_peers";
pub(crate) const QUERY_ANNOUNCE_PEER: &str = "announce_peer";

/// A KRPC message of any kind.
///
/// Fields are declared in lexicographic order so the derived serialization
/// produces canonical bencode.
#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct KrpcMessage {
    /// The arguments of a query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Args>,
    /// An error: code and message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<(i64, String)>,
    /// The query name of a `y = "q"` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// The body of a `y = "r"` response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<ResponseBody>,
    /// Transaction id, echoed verbatim by the responder.
    pub t: ByteBuf,
    /// "q", "r", or "e".
    pub y: String,
}

impl KrpcMessage {
    pub fn query(t: Vec<u8>, name: &str, args: Args) -> Self {
        Self {
            a: Some(args),
            e: None,
            q: Some(name.to_string()),
            r: None,
            t: ByteBuf::from(t),
            y: "q".to_string(),
        }
    }

    pub fn response(t: Vec<u8>, body: ResponseBody) -> Self {
        Self {
            a: None,
            e: None,
            q: None,
            r: Some(body),
            t: ByteBuf::from(t),
            y: "r".to_string(),
        }
    }

    pub fn error(t: Vec<u8>, code: i64, message: &str) -> Self {
        Self {
            a: None,
            e: Some((code, message.to_string())),
            q: None,
            r: None,
            t: ByteBuf::from(t),
            y: "e".to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }
}

/// Query arguments. Every query carries the sender's node id; the rest
/// depends on the query name.
#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct Args {
    pub id: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

impl Args {
    pub fn new(id: NodeId) -> Self {
        Self {
            id: ByteBuf::from(id.0.to_vec()),
            ..Self::default()
        }
    }
}

/// Response body. `nodes` is compact node info, `values` compact peers.
#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct ResponseBody {
    pub id: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}

impl ResponseBody {
    pub fn new(id: NodeId) -> Self {
        Self {
            id: ByteBuf::from(id.0.to_vec()),
            ..Self::default()
        }
    }
}

/// Encodes `id(20) | ip(4) | port(2)` entries, skipping IPv6 addresses.
pub(crate) fn encode_compact_nodes(
    nodes: &[(NodeId, SocketAddr)],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        if let SocketAddr::V4(addr) = addr {
            buf.extend_from_slice(&id.0);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

/// Parses compact node info; a trailing partial entry is discarded.
pub(crate) fn parse_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    bytes
        .chunks_exact(26)
        .map(|chunk| {
            let mut id = [0; 20];
            id.copy_from_slice(&chunk[..20]);
            let ip =
                Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            (NodeId(id), SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_query_encoding_is_canonical() {
        let mut args = Args::new(NodeId([0x11; 20]));
        args.info_hash = Some(ByteBuf::from(vec![0x22; 20]));
        let msg = KrpcMessage::query(b"aa".to_vec(), QUERY_GET_PEERS, args);
        let buf = msg.encode().unwrap();
        let expected: Vec<u8> = [
            &b"d1:ad2:id20:"[..],
            &[0x11; 20],
            &b"9:info_hash20:"[..],
            &[0x22; 20],
            &b"e1:q9:get_peers1:t2:aa1:y1:qe"[..],
        ]
        .concat();
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_message_roundtrips() {
        let mut args = Args::new(NodeId([1; 20]));
        args.target = Some(ByteBuf::from(vec![2; 20]));
        let query =
            KrpcMessage::query(b"xy".to_vec(), QUERY_FIND_NODE, args);
        let decoded = KrpcMessage::decode(&query.encode().unwrap()).unwrap();
        assert_eq!(decoded.y, "q");
        assert_eq!(decoded.q.as_deref(), Some(QUERY_FIND_NODE));
        assert_eq!(decoded.t.as_ref(), b"xy");
        assert_eq!(
            decoded.a.unwrap().target.unwrap().as_ref(),
            &[2u8; 20][..]
        );

        let mut body = ResponseBody::new(NodeId([3; 20]));
        body.token = Some(ByteBuf::from(b"tok".to_vec()));
        body.values = Some(vec![ByteBuf::from(vec![127, 0, 0, 1, 0x1a, 0xe1])]);
        let response = KrpcMessage::response(b"xy".to_vec(), body);
        let decoded =
            KrpcMessage::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.y, "r");
        let body = decoded.r.unwrap();
        assert_eq!(body.token.unwrap().as_ref(), b"tok");
        assert_eq!(body.values.unwrap().len(), 1);

        let error = KrpcMessage::error(b"xy".to_vec(), ERROR_PROTOCOL, "Bad Token");
        let decoded = KrpcMessage::decode(&error.encode().unwrap()).unwrap();
        assert_eq!(decoded.y, "e");
        assert_eq!(
            decoded.e.unwrap(),
            (ERROR_PROTOCOL, "Bad Token".to_string())
        );
    }

    #[test]
    fn test_compact_nodes_roundtrip() {
        let nodes = vec![
            (NodeId([7; 20]), "1.2.3.4:6881".parse().unwrap()),
            (NodeId([9; 20]), "10.0.0.1:51413".parse().unwrap()),
        ];
        let encoded = encode_compact_nodes(&nodes);
        assert_eq!(encoded.len(), 52);
        assert_eq!(parse_compact_nodes(&encoded), nodes);

        // v6 nodes are skipped, partial trailing entries dropped
        let with_v6 = vec![
            (NodeId([7; 20]), "1.2.3.4:6881".parse().unwrap()),
            (NodeId([8; 20]), "[::1]:6881".parse().unwrap()),
        ];
        assert_eq!(encode_compact_nodes(&with_v6).len(), 26);
        assert_eq!(parse_compact_nodes(&encoded[..30]).len(), 1);
    }
}
