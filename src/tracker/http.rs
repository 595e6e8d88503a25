//! The original HTTP announce protocol with bencoded responses.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bencode::value::Value;
use url::Url;

use super::{Announce, Response};
use crate::error::*;

pub(crate) struct HttpTracker {
    client: reqwest::Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends the announce and decodes the bencoded response.
    ///
    /// A response carrying a `failure reason` is returned as an ordinary
    /// `Response`; deciding to go dormant on it is the torrent's call.
    pub async fn announce(&self, params: &Announce) -> Result<Response> {
        // the info hash and peer id are raw bytes and must be escaped by
        // hand; reqwest's query serializer would treat them as UTF-8
        let separator = if self.url.query().is_some() { '&' } else { '?' };
        let url = format!(
            "{}{}info_hash={}&peer_id={}",
            self.url,
            separator,
            percent_encode(&params.info_hash, NON_ALPHANUMERIC),
            percent_encode(&params.peer_id, NON_ALPHANUMERIC),
        );

        let mut query = vec![
            ("port".to_string(), params.port.to_string()),
            ("uploaded".to_string(), params.uploaded.to_string()),
            ("downloaded".to_string(), params.downloaded.to_string()),
            ("left".to_string(), params.left.to_string()),
            ("compact".to_string(), "1".to_string()),
        ];
        if let Some(event) = params.event {
            query.push(("event".to_string(), event.to_string()));
        }
        if let Some(peer_count) = params.peer_count {
            query.push(("numwant".to_string(), peer_count.to_string()));
        }
        if let Some(ip) = &params.ip {
            query.push(("ip".to_string(), ip.to_string()));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push(("trackerid".to_string(), tracker_id.clone()));
        }

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Tracker(format!(
                "tracker returned HTTP {}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let raw: RawResponse = serde_bencode::from_bytes(&body)?;
        Ok(raw.into())
    }
}

/// The bencoded response shape. `peers` is kept generic as trackers may
/// send either the compact byte string or a list of dictionaries.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<u64>,
    #[serde(rename = "tracker id", default)]
    tracker_id: Option<String>,
    #[serde(default)]
    complete: Option<usize>,
    #[serde(default)]
    incomplete: Option<usize>,
    #[serde(default)]
    peers: Option<Value>,
}

impl From<RawResponse> for Response {
    fn from(raw: RawResponse) -> Self {
        let peers = raw.peers.map(parse_peers).unwrap_or_default();
        Self {
            tracker_id: raw.tracker_id,
            failure_reason: raw.failure_reason,
            warning_message: raw.warning_message,
            interval: raw.interval.map(Duration::from_secs),
            min_interval: raw.min_interval.map(Duration::from_secs),
            seeder_count: raw.complete,
            leecher_count: raw.incomplete,
            peers,
        }
    }
}

fn parse_peers(value: Value) -> Vec<SocketAddr> {
    match value {
        // the compact format: 6 bytes per peer, 4 for the IPv4 address and
        // 2 for the big endian port
        Value::Bytes(bytes) => parse_compact_peers(&bytes),
        // the full format: a list of dicts with "ip" and "port" keys
        Value::List(list) => list
            .into_iter()
            .filter_map(|peer| {
                let dict = match peer {
                    Value::Dict(dict) => dict,
                    _ => return None,
                };
                let ip = match dict.get(&b"ip"[..]) {
                    Some(Value::Bytes(ip)) => {
                        std::str::from_utf8(ip).ok()?.parse::<IpAddr>().ok()?
                    }
                    _ => return None,
                };
                let port = match dict.get(&b"port"[..]) {
                    Some(Value::Int(port)) => *port as u16,
                    _ => return None,
                };
                Some(SocketAddr::new(ip, port))
            })
            .collect(),
        _ => {
            log::warn!("Unexpected peers format in tracker response");
            Vec::new()
        }
    }
}

/// Parses 6-byte compact peer entries, used by both trackers and the DHT.
pub(crate) fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Encodes addresses into the 6-byte compact form, ignoring IPv6 entries.
pub(crate) fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let SocketAddr::V4(addr) = peer {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}
