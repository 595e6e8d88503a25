//! Tracker announces over HTTP and UDP, and the BEP-12 tier walk that picks
//! which tracker gets the next announce.

mod http;
mod udp;

use std::{fmt, net::IpAddr, net::SocketAddr, time::Duration};

use url::Url;

use crate::{error::*, PeerId, Sha1Hash};

pub(crate) use http::{encode_compact_peers, parse_compact_peers, HttpTracker};
pub(crate) use udp::UdpTracker;

/// The optional announce event. An absent event is a routine update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// The first announce of a download.
    Started,
    /// Sent once when the whole torrent verified.
    Completed,
    /// Sent when the torrent is stopped.
    Stopped,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The parameters of an announce, shared by the HTTP and UDP transports.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The TCP port on which we accept peer connections.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// The number of bytes still missing from the download.
    pub left: u64,
    pub event: Option<Event>,
    /// The number of peers we'd like to receive.
    pub peer_count: Option<usize>,
    /// Our externally visible address, if known.
    pub ip: Option<IpAddr>,
    /// The tracker id a previous response of this tracker handed out.
    pub tracker_id: Option<String>,
}

/// The relevant fields of a tracker's announce response, already decoded
/// from its transport representation.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Response {
    /// An opaque id to echo in future announces.
    pub tracker_id: Option<String>,
    /// If set, the announce failed and the torrent's announcing goes
    /// dormant.
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub seeder_count: Option<usize>,
    pub leecher_count: Option<usize>,
    pub peers: Vec<SocketAddr>,
}

/// A single tracker, dispatching on the URL's scheme.
pub(crate) enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn new(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(HttpTracker::new(url))),
            "udp" => Ok(Self::Udp(UdpTracker::new(url))),
            scheme => {
                Err(Error::Tracker(format!("unsupported scheme {}", scheme)))
            }
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Http(t) => t.url(),
            Self::Udp(t) => t.url(),
        }
    }

    pub async fn announce(&mut self, params: &Announce) -> Result<Response> {
        match self {
            Self::Http(t) => t.announce(params).await,
            Self::Udp(t) => t.announce(params).await,
        }
    }
}

/// The announce tiers of a torrent, walked in BEP-12 order.
///
/// Tiers are consulted in order; within a tier the URLs are tried in their
/// current order and a successful URL is moved to the tier's front, so it is
/// preferred on the next announce. Later tiers are only consulted when every
/// URL of the earlier tiers failed.
pub(crate) struct TrackerTiers {
    tiers: Vec<Vec<Tracker>>,
}

impl TrackerTiers {
    pub fn new(announce_list: &[Vec<String>]) -> Self {
        let tiers = announce_list
            .iter()
            .map(|tier| {
                tier.iter()
                    .filter_map(|announce| {
                        let url = Url::parse(announce)
                            .map_err(|e| {
                                log::warn!(
                                    "Skipping invalid tracker URL {}: {}",
                                    announce,
                                    e
                                );
                            })
                            .ok()?;
                        Tracker::new(url)
                            .map_err(|e| {
                                log::warn!(
                                    "Skipping tracker {}: {}",
                                    announce,
                                    e
                                );
                            })
                            .ok()
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|tier: &Vec<Tracker>| !tier.is_empty())
            .collect();
        Self { tiers }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Announces to the first tracker that answers, in tier order. Returns
    /// `None` when every tier failed; the caller schedules the torrent-wide
    /// retry.
    pub async fn announce(&mut self, params: &Announce) -> Option<Response> {
        for tier in self.tiers.iter_mut() {
            for i in 0..tier.len() {
                let url = tier[i].url().to_string();
                log::info!("Announcing '{:?}' to {}", params.event, url);
                match tier[i].announce(params).await {
                    Ok(response) => {
                        // move the good tracker to the tier's front so the
                        // next announce starts with it
                        tier[..=i].rotate_right(1);
                        return Some(response);
                    }
                    Err(e) => {
                        log::info!("Announce to {} failed: {}", url, e);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"-rp0010-012345678901",
            port: 6889,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Some(Event::Started),
            peer_count: Some(50),
            ip: None,
            tracker_id: None,
        }
    }

    #[test]
    fn test_event_strings() {
        assert_eq!(Event::Started.to_string(), "started");
        assert_eq!(Event::Completed.to_string(), "completed");
        assert_eq!(Event::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_invalid_urls_are_skipped() {
        let tiers = TrackerTiers::new(&[
            vec!["not a url".to_string(), "ftp://t.example/x".to_string()],
            vec!["http://t.example/ann".to_string()],
        ]);
        // the first tier became empty and was dropped entirely
        assert_eq!(tiers.tiers.len(), 1);
        assert_eq!(tiers.tiers[0].len(), 1);
    }

    #[tokio::test]
    async fn test_tier_order_and_promotion() {
        // first tier: a failing tracker and a good one; second tier must
        // never be consulted
        let failing = mockito::mock("GET", mockito::Matcher::Regex("^/bad".into()))
            .with_status(500)
            .expect_at_least(1)
            .create();
        let good = mockito::mock("GET", mockito::Matcher::Regex("^/good".into()))
            .with_status(200)
            .with_body(&b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e"[..])
            .expect_at_least(1)
            .create();
        let never = mockito::mock("GET", mockito::Matcher::Regex("^/never".into()))
            .expect(0)
            .create();

        let base = mockito::server_url();
        let mut tiers = TrackerTiers::new(&[
            vec![format!("{}/bad", base), format!("{}/good", base)],
            vec![format!("{}/never", base)],
        ]);

        let response = tiers.announce(&params()).await.unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            response.peers,
            vec!["127.0.0.1:6881".parse().unwrap()]
        );

        // the successful URL moved to the front of its tier; the failed one
        // is now second and tier 2 was never consulted
        assert!(tiers.tiers[0][0].url().path().starts_with("/good"));
        assert!(tiers.tiers[0][1].url().path().starts_with("/bad"));

        failing.assert();
        good.assert();
        never.assert();
    }

    #[tokio::test]
    async fn test_all_tiers_failing_returns_none() {
        let _bad = mockito::mock("GET", mockito::Matcher::Regex("^/only".into()))
            .with_status(503)
            .create();
        let mut tiers = TrackerTiers::new(&[vec![format!(
            "{}/only",
            mockito::server_url()
        )]]);
        assert!(tiers.announce(&params()).await.is_none());
    }
}
