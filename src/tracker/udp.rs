//! The BEP-15 UDP announce protocol: a connect handshake whose connection
//! id is cached for a minute, then fixed-layout announce packets, with the
//! 15 * 2^n second retransmission ladder.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::{net::lookup_host, net::UdpSocket, time};
use url::Url;

use super::{Announce, Event, Response};
use crate::error::*;

const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// How long a connection id handed out by the tracker stays valid.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const MAX_RETRANSMISSIONS: u32 = 8;

pub(crate) struct UdpTracker {
    url: Url,
    /// The cached connection id and when it was obtained.
    conn: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub fn new(url: Url) -> Self {
        Self { url, conn: None }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(&mut self, params: &Announce) -> Result<Response> {
        let addr = self.resolve().await?;
        let mut socket =
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;

        let connection_id =
            self.obtain_connection_id(&mut socket, &addr).await?;

        let transaction_id: u32 = rand::random();
        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&params.info_hash);
        packet.extend_from_slice(&params.peer_id);
        packet.extend_from_slice(&params.downloaded.to_be_bytes());
        packet.extend_from_slice(&params.left.to_be_bytes());
        packet.extend_from_slice(&params.uploaded.to_be_bytes());
        let event: u32 = match params.event {
            None => 0,
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
        };
        packet.extend_from_slice(&event.to_be_bytes());
        let ip: u32 = match params.ip {
            Some(std::net::IpAddr::V4(ip)) => u32::from(ip),
            _ => 0,
        };
        packet.extend_from_slice(&ip.to_be_bytes());
        let key: u32 = rand::random();
        packet.extend_from_slice(&key.to_be_bytes());
        let peer_count = params.peer_count.map(|n| n as i32).unwrap_or(-1);
        packet.extend_from_slice(&peer_count.to_be_bytes());
        packet.extend_from_slice(&params.port.to_be_bytes());
        debug_assert_eq!(packet.len(), 98);

        let (action, payload) =
            exchange(&mut socket, &addr, &packet, transaction_id).await?;
        if action == ACTION_ERROR {
            // an error reply invalidates the cached connection
            self.conn = None;
            return Err(Error::Tracker(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }
        if action != ACTION_ANNOUNCE || payload.len() < 12 {
            return Err(Error::Tracker(
                "malformed announce reply".to_string(),
            ));
        }

        let interval =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let leechers =
            u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let seeders = u32::from_be_bytes([
            payload[8],
            payload[9],
            payload[10],
            payload[11],
        ]);
        let peer_bytes = &payload[12..];
        if peer_bytes.len() % 6 != 0 {
            return Err(Error::Tracker(
                "malformed peer list in announce reply".to_string(),
            ));
        }

        Ok(Response {
            tracker_id: None,
            failure_reason: None,
            warning_message: None,
            interval: Some(Duration::from_secs(u64::from(interval))),
            min_interval: None,
            seeder_count: Some(seeders as usize),
            leecher_count: Some(leechers as usize),
            peers: super::http::parse_compact_peers(peer_bytes),
        })
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| Error::Tracker("tracker URL has no host".into()))?;
        let port = self.url.port().unwrap_or(80);
        lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::Tracker(format!("cannot resolve {}", host)))
    }

    /// Returns a valid connection id, performing the connect exchange when
    /// the cached one is missing or older than a minute.
    async fn obtain_connection_id(
        &mut self,
        socket: &mut UdpSocket,
        addr: &SocketAddr,
    ) -> Result<u64> {
        if let Some((id, obtained_at)) = self.conn {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::random();
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        let (action, payload) =
            exchange(socket, addr, &packet, transaction_id).await?;
        if action == ACTION_ERROR {
            return Err(Error::Tracker(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }
        if action != ACTION_CONNECT || payload.len() < 8 {
            return Err(Error::Tracker("malformed connect reply".to_string()));
        }

        let id = u64::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3], payload[4],
            payload[5], payload[6], payload[7],
        ]);
        self.conn = Some((id, Instant::now()));
        Ok(id)
    }
}

/// Sends a packet and waits for the reply bearing the same transaction id,
/// retransmitting with the 15 * 2^n second timeout ladder.
async fn exchange(
    socket: &mut UdpSocket,
    addr: &SocketAddr,
    packet: &[u8],
    transaction_id: u32,
) -> Result<(u32, Vec<u8>)> {
    let mut buf = vec![0u8; 4096];
    for attempt in 0..MAX_RETRANSMISSIONS {
        socket.send_to(packet, addr).await?;
        let deadline = Duration::from_secs(15u64 << attempt);
        match time::timeout(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if from != *addr || len < 8 {
                    continue;
                }
                let action =
                    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let tid =
                    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                if tid != transaction_id {
                    log::debug!("Tracker reply with foreign transaction id");
                    continue;
                }
                return Ok((action, buf[8..len].to_vec()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                log::debug!(
                    "Tracker timeout, retransmitting (attempt {})",
                    attempt + 1
                );
            }
        }
    }
    Err(Error::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny in-process BEP-15 tracker that serves one connect and one
    /// announce exchange.
    async fn mock_tracker() -> SocketAddr {
        let mut server =
            UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];

            // connect
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(buf[..8], PROTOCOL_ID.to_be_bytes());
            assert_eq!(buf[8..12], ACTION_CONNECT.to_be_bytes());
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&0x1234_5678_u64.to_be_bytes());
            server.send_to(&reply, &from).await.unwrap();

            // announce
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            assert_eq!(buf[..8], 0x1234_5678_u64.to_be_bytes());
            assert_eq!(buf[8..12], ACTION_ANNOUNCE.to_be_bytes());
            // info hash starts at offset 16
            assert_eq!(&buf[16..36], &[0xab; 20]);
            // event "started" is code 2, at offset 80
            assert_eq!(buf[80..84], 2u32.to_be_bytes());
            // port at offset 96
            assert_eq!(buf[96..98], 6889u16.to_be_bytes());

            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&1800u32.to_be_bytes());
            reply.extend_from_slice(&7u32.to_be_bytes());
            reply.extend_from_slice(&3u32.to_be_bytes());
            // one compact peer: 10.1.2.3:6881
            reply.extend_from_slice(&[10, 1, 2, 3, 0x1a, 0xe1]);
            server.send_to(&reply, &from).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_and_announce() {
        let addr = mock_tracker().await;
        let mut tracker = UdpTracker::new(
            Url::parse(&format!("udp://{}", addr)).unwrap(),
        );

        let response = tracker
            .announce(&Announce {
                info_hash: [0xab; 20],
                peer_id: *b"-rp0010-012345678901",
                port: 6889,
                uploaded: 10,
                downloaded: 20,
                left: 30,
                event: Some(Event::Started),
                peer_count: Some(50),
                ip: None,
                tracker_id: None,
            })
            .await
            .unwrap();

        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.leecher_count, Some(7));
        assert_eq!(response.seeder_count, Some(3));
        assert_eq!(response.peers, vec!["10.1.2.3:6881".parse().unwrap()]);

        // the connection id is cached for the next announce
        assert!(tracker.conn.is_some());
    }
}
