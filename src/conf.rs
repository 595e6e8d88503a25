//! This module defines types used to configure the engine and its parts.

use std::{fmt, fs, path::Path, path::PathBuf, time::Duration};

use rand::Rng;

use crate::{PeerId, BLOCK_LEN};

/// The prefix of the client id announced to trackers and peers, in the
/// Azureus convention of http://bittorrent.org/beps/bep_0020.html.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-rp0010-";

/// Returns a fresh client id: the fixed prefix followed by 12 random
/// printable characters.
pub fn gen_client_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
///
/// All values have defaults; a configuration file only needs to name the
/// options it wants to override.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The root directory for all engine state.
    pub data_dir: PathBuf,
    /// Where resume state of active torrents is kept.
    pub active_dir: PathBuf,
    /// The folder watched for new .torrent files (the importer itself is an
    /// external collaborator, but the path is part of the configuration
    /// surface).
    pub watch_dir: PathBuf,
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,
    /// Where removed torrents' files are moved.
    pub trash_dir: PathBuf,

    /// The TCP port on which we accept peer connections.
    pub listen_port: u16,
    /// The UDP port of the DHT node.
    pub dht_port: u16,

    /// The max number of live peer connections across all torrents.
    pub max_connections: usize,
    /// The max number of outstanding block requests to a single peer.
    pub max_in_flight_per_peer: usize,
    /// The max number of pieces a single peer may hold open concurrently.
    pub max_pieces_per_peer: usize,
    /// The block length used when splitting pieces into requests. Only the
    /// canonical 16 KiB is exercised; other values are accepted from the
    /// configuration file but warned about.
    pub block_len: u32,
    /// Requests for blocks larger than this are refused.
    pub max_served_block_len: u32,

    /// The number of verified pieces kept in memory to serve requests.
    pub piece_cache_capacity: usize,
    /// How long a cached piece is served before it must be re-read.
    pub piece_cache_ttl: Duration,

    pub handshake_timeout: Duration,
    /// A connection on which no frame arrives for this long is dead.
    pub frame_idle: Duration,
    /// A keep-alive is sent when the outbound side has been idle this long.
    pub keep_alive_interval: Duration,
    pub dial_timeout: Duration,
    pub dht_query_timeout: Duration,

    /// How long a host stays off the dial list after a failure.
    pub host_cooldown: Duration,
    /// This many consecutive failures ban a host.
    pub max_fails: u32,

    /// The announce retry interval used when every tracker tier failed.
    pub announce_retry_on_fail: Duration,
}

impl Default for Conf {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            client_id: gen_client_id(),
            active_dir: data_dir.join("active"),
            watch_dir: data_dir.join("watch"),
            download_dir: data_dir.join("download"),
            trash_dir: data_dir.join("trash"),
            data_dir,
            listen_port: 6889,
            dht_port: 6999,
            max_connections: 15,
            max_in_flight_per_peer: 15,
            max_pieces_per_peer: 10,
            block_len: BLOCK_LEN,
            max_served_block_len: 2 * BLOCK_LEN,
            piece_cache_capacity: 100,
            piece_cache_ttl: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(1),
            frame_idle: Duration::from_secs(5 * 60),
            keep_alive_interval: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(1),
            dht_query_timeout: Duration::from_secs(2),
            host_cooldown: Duration::from_secs(60),
            max_fails: 3,
            announce_retry_on_fail: Duration::from_secs(5 * 60),
        }
    }
}

impl Conf {
    /// Reads the configuration from a JSON file, filling in defaults for
    /// everything the file doesn't mention.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfError> {
        let buf = fs::read(path.as_ref())
            .map_err(|e| ConfError::Io(path.as_ref().to_path_buf(), e))?;
        let raw: RawConf =
            serde_json::from_slice(&buf).map_err(ConfError::Parse)?;
        Ok(raw.resolve())
    }
}

/// The error type returned when the configuration file cannot be used. This
/// is fatal: the engine refuses to start on it.
#[derive(Debug)]
pub enum ConfError {
    Io(PathBuf, std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => {
                write!(f, "cannot read config {:?}: {}", path, e)
            }
            Self::Parse(e) => write!(f, "cannot parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfError {}

/// The on-disk shape of the configuration. Folder defaults derive from
/// `data_folder`, so resolution happens after parsing.
#[derive(Debug, Default, Deserialize)]
struct RawConf {
    data_folder: Option<PathBuf>,
    active_folder: Option<PathBuf>,
    watch_folder: Option<PathBuf>,
    download_folder: Option<PathBuf>,
    trash_folder: Option<PathBuf>,
    port: Option<u16>,
    dht_port: Option<u16>,
    max_connections: Option<usize>,
    max_in_flight_per_peer: Option<usize>,
    max_pieces_per_peer: Option<usize>,
    block_size: Option<u32>,
    max_served_block: Option<u32>,
    piece_cache_capacity: Option<usize>,
    piece_cache_ttl: Option<u64>,
    handshake_timeout: Option<u64>,
    frame_idle: Option<u64>,
    keep_alive_interval: Option<u64>,
    dial_timeout: Option<u64>,
    dht_query_timeout: Option<u64>,
    host_cooldown: Option<u64>,
    max_fails: Option<u32>,
    announce_retry_on_fail: Option<u64>,
}

impl RawConf {
    fn resolve(self) -> Conf {
        let defaults = Conf::default();
        let data_dir =
            self.data_folder.unwrap_or_else(|| defaults.data_dir.clone());
        let under_data = |dir: Option<PathBuf>, leaf: &str| {
            dir.unwrap_or_else(|| data_dir.join(leaf))
        };
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };

        let block_len = self.block_size.unwrap_or(BLOCK_LEN);
        if block_len != BLOCK_LEN {
            log::warn!(
                "block_size {} configured, engine requests {} byte blocks",
                block_len,
                BLOCK_LEN
            );
        }

        Conf {
            client_id: gen_client_id(),
            active_dir: under_data(self.active_folder, "active"),
            watch_dir: under_data(self.watch_folder, "watch"),
            download_dir: under_data(self.download_folder, "download"),
            trash_dir: under_data(self.trash_folder, "trash"),
            data_dir,
            listen_port: self.port.unwrap_or(defaults.listen_port),
            dht_port: self.dht_port.unwrap_or(defaults.dht_port),
            max_connections: self
                .max_connections
                .unwrap_or(defaults.max_connections),
            max_in_flight_per_peer: self
                .max_in_flight_per_peer
                .unwrap_or(defaults.max_in_flight_per_peer),
            max_pieces_per_peer: self
                .max_pieces_per_peer
                .unwrap_or(defaults.max_pieces_per_peer),
            block_len,
            max_served_block_len: self
                .max_served_block
                .unwrap_or(defaults.max_served_block_len),
            piece_cache_capacity: self
                .piece_cache_capacity
                .unwrap_or(defaults.piece_cache_capacity),
            piece_cache_ttl: secs(
                self.piece_cache_ttl,
                defaults.piece_cache_ttl,
            ),
            handshake_timeout: secs(
                self.handshake_timeout,
                defaults.handshake_timeout,
            ),
            frame_idle: secs(self.frame_idle, defaults.frame_idle),
            keep_alive_interval: secs(
                self.keep_alive_interval,
                defaults.keep_alive_interval,
            ),
            dial_timeout: secs(self.dial_timeout, defaults.dial_timeout),
            dht_query_timeout: secs(
                self.dht_query_timeout,
                defaults.dht_query_timeout,
            ),
            host_cooldown: secs(self.host_cooldown, defaults.host_cooldown),
            max_fails: self.max_fails.unwrap_or(defaults.max_fails),
            announce_retry_on_fail: secs(
                self.announce_retry_on_fail,
                defaults.announce_retry_on_fail,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = gen_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn test_resolve_folder_defaults() {
        let raw: RawConf =
            serde_json::from_str(r#"{"data_folder": "/srv/bt"}"#).unwrap();
        let conf = raw.resolve();
        assert_eq!(conf.data_dir, PathBuf::from("/srv/bt"));
        assert_eq!(conf.active_dir, PathBuf::from("/srv/bt/active"));
        assert_eq!(conf.download_dir, PathBuf::from("/srv/bt/download"));
        assert_eq!(conf.listen_port, 6889);
        assert_eq!(conf.dht_port, 6999);
    }

    #[test]
    fn test_resolve_overrides() {
        let raw: RawConf = serde_json::from_str(
            r#"{
                "port": 7000,
                "max_connections": 3,
                "keep_alive_interval": 20,
                "download_folder": "/mnt/dl"
            }"#,
        )
        .unwrap();
        let conf = raw.resolve();
        assert_eq!(conf.listen_port, 7000);
        assert_eq!(conf.max_connections, 3);
        assert_eq!(conf.keep_alive_interval, Duration::from_secs(20));
        assert_eq!(conf.download_dir, PathBuf::from("/mnt/dl"));
        // untouched options keep their defaults
        assert_eq!(conf.max_fails, 3);
        assert_eq!(conf.frame_idle, Duration::from_secs(300));
    }
}
