//! Admission control and dial scheduling: which hosts may be dialed, which
//! are cooling down after failures, and which are banned.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::Sha1Hash;

/// What the engine knows about a remote host, across torrents.
#[derive(Debug)]
struct HostInfo {
    /// The torrents this address was handed to us for.
    torrents: HashSet<Sha1Hash>,
    last_fail: Option<Instant>,
    /// Consecutive failures; any success resets it.
    fails: u32,
    /// A host with a live (or in-progress) connection is not dialed again.
    in_use: bool,
}

impl HostInfo {
    fn new() -> Self {
        Self {
            torrents: HashSet::new(),
            last_fail: None,
            fails: 0,
            in_use: false,
        }
    }

    fn on_cooldown(&self, cooldown: Duration) -> bool {
        match self.last_fail {
            Some(at) => self.fails > 0 && at.elapsed() < cooldown,
            None => false,
        }
    }
}

pub(crate) struct PeerManager {
    hosts: HashMap<SocketAddr, HostInfo>,
    banned: HashSet<SocketAddr>,
    /// Live peer connections across all torrents, inbound included.
    connected: usize,
    max_connections: usize,
    host_cooldown: Duration,
    max_fails: u32,
}

impl PeerManager {
    pub fn new(
        max_connections: usize,
        host_cooldown: Duration,
        max_fails: u32,
    ) -> Self {
        Self {
            hosts: HashMap::new(),
            banned: HashSet::new(),
            connected: 0,
            max_connections,
            host_cooldown,
            max_fails,
        }
    }

    /// Records addresses a tracker or the DHT handed us for a torrent.
    pub fn add_candidates<I>(&mut self, info_hash: Sha1Hash, peers: I)
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        for addr in peers {
            if self.banned.contains(&addr) {
                continue;
            }
            self.hosts
                .entry(addr)
                .or_insert_with(HostInfo::new)
                .torrents
                .insert(info_hash);
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.connected < self.max_connections
    }

    pub fn connection_count(&self) -> usize {
        self.connected
    }

    /// Accounts for a new live connection (outbound dial started or inbound
    /// accepted).
    pub fn session_started(&mut self) {
        self.connected += 1;
    }

    /// Picks hosts to dial: not banned, not cooling down, not in use, least
    /// failed first. Each host is paired with one of its torrents accepted
    /// by `is_active` and marked in use. Dial accounting (capacity) is the
    /// caller's job.
    pub fn dial_candidates<F>(
        &mut self,
        want: usize,
        is_active: F,
    ) -> Vec<(SocketAddr, Sha1Hash)>
    where
        F: Fn(&Sha1Hash) -> bool,
    {
        let cooldown = self.host_cooldown;
        let mut suitable: Vec<(&SocketAddr, &HostInfo)> = self
            .hosts
            .iter()
            .filter(|(_, host)| {
                !host.in_use && !host.on_cooldown(cooldown)
            })
            .collect();
        suitable.sort_by_key(|(_, host)| host.fails);

        let mut picked = Vec::new();
        for (addr, host) in suitable {
            if picked.len() == want {
                break;
            }
            if let Some(info_hash) =
                host.torrents.iter().find(|hash| is_active(hash))
            {
                picked.push((*addr, *info_hash));
            }
        }

        for (addr, _) in picked.iter() {
            if let Some(host) = self.hosts.get_mut(addr) {
                host.in_use = true;
            }
        }
        picked
    }

    /// A dial or handshake to the host failed.
    pub fn mark_failed(&mut self, addr: &SocketAddr) {
        if let Some(host) = self.hosts.get_mut(addr) {
            host.fails += 1;
            host.last_fail = Some(Instant::now());
        }
    }

    /// The handshake succeeded; the host's failure streak is forgiven.
    pub fn mark_connected(&mut self, addr: &SocketAddr) {
        let host = self.hosts.entry(*addr).or_insert_with(HostInfo::new);
        host.fails = 0;
        host.in_use = true;
    }

    /// Returns the host to the candidate pool after its session (or dial
    /// attempt) ended. Hosts that kept failing are banned instead.
    pub fn release(&mut self, addr: &SocketAddr) {
        self.connected = self.connected.saturating_sub(1);
        let host = match self.hosts.get_mut(addr) {
            Some(host) => host,
            None => return,
        };
        if host.fails >= self.max_fails {
            log::info!("Banning peer {} after {} failures", addr, host.fails);
            self.hosts.remove(addr);
            self.banned.insert(*addr);
        } else {
            host.in_use = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_A: Sha1Hash = [0xaa; 20];
    const HASH_B: Sha1Hash = [0xbb; 20];

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", i).parse().unwrap()
    }

    fn manager() -> PeerManager {
        PeerManager::new(2, Duration::from_secs(1000), 3)
    }

    #[test]
    fn test_dial_candidates_mark_in_use() {
        let mut manager = manager();
        manager.add_candidates(HASH_A, vec![addr(1), addr(2)]);

        let picked = manager.dial_candidates(10, |_| true);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|(_, hash)| *hash == HASH_A));

        // everything is in use now
        assert!(manager.dial_candidates(10, |_| true).is_empty());

        // releasing a host makes it dialable again
        manager.release(&addr(1));
        assert_eq!(manager.dial_candidates(10, |_| true).len(), 1);
    }

    #[test]
    fn test_inactive_torrents_are_skipped() {
        let mut manager = manager();
        manager.add_candidates(HASH_A, vec![addr(1)]);
        manager.add_candidates(HASH_B, vec![addr(2)]);

        let picked = manager.dial_candidates(10, |hash| *hash == HASH_B);
        assert_eq!(picked, vec![(addr(2), HASH_B)]);
    }

    #[test]
    fn test_cooldown_blocks_redial() {
        let mut manager = manager();
        manager.add_candidates(HASH_A, vec![addr(1)]);

        let picked = manager.dial_candidates(10, |_| true);
        assert_eq!(picked.len(), 1);
        manager.mark_failed(&addr(1));
        manager.release(&addr(1));

        // one failure: not banned, but cooling down
        assert!(manager.dial_candidates(10, |_| true).is_empty());
    }

    #[test]
    fn test_ban_after_max_fails() {
        let mut manager = PeerManager::new(2, Duration::from_secs(0), 3);
        manager.add_candidates(HASH_A, vec![addr(1)]);

        for _ in 0..3 {
            let picked = manager.dial_candidates(10, |_| true);
            assert_eq!(picked.len(), 1, "zero cooldown keeps host dialable");
            manager.mark_failed(&addr(1));
            manager.release(&addr(1));
        }

        // three consecutive failures: banned, and not even new candidate
        // updates resurrect it
        assert!(manager.dial_candidates(10, |_| true).is_empty());
        manager.add_candidates(HASH_A, vec![addr(1)]);
        assert!(manager.dial_candidates(10, |_| true).is_empty());
    }

    #[test]
    fn test_success_resets_failures() {
        let mut manager = PeerManager::new(2, Duration::from_secs(0), 3);
        manager.add_candidates(HASH_A, vec![addr(1)]);

        for _ in 0..2 {
            manager.dial_candidates(10, |_| true);
            manager.mark_failed(&addr(1));
            manager.release(&addr(1));
        }
        manager.dial_candidates(10, |_| true);
        manager.mark_connected(&addr(1));
        manager.release(&addr(1));

        // the streak was broken; two more failures still don't ban
        for _ in 0..2 {
            manager.dial_candidates(10, |_| true);
            manager.mark_failed(&addr(1));
            manager.release(&addr(1));
        }
        assert_eq!(manager.dial_candidates(10, |_| true).len(), 1);
    }

    #[test]
    fn test_capacity_accounting() {
        let mut manager = manager();
        assert!(manager.has_capacity());
        manager.session_started();
        manager.session_started();
        assert!(!manager.has_capacity());
        assert_eq!(manager.connection_count(), 2);

        manager.release(&addr(9));
        assert!(manager.has_capacity());
    }
}
