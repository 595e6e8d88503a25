//! The announce_peer token scheme: an HMAC over the querier's IP address
//! with a rotating secret, so tokens expire without any per-peer state.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use hmac::{Hmac, Mac, NewMac};
use rand::Rng;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const SECRET_LEN: usize = 20;

/// How often the secret rotates. The previous secret stays valid for one
/// more period, so a token lives between five and ten minutes.
pub(crate) const ROTATION_PERIOD: Duration = Duration::from_secs(5 * 60);

pub(crate) struct TokenStore {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
    rotated_at: Instant,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            current: gen_secret(),
            previous: gen_secret(),
            rotated_at: Instant::now(),
        }
    }

    /// Rotates the secret if a rotation period elapsed. Called from the DHT
    /// maintenance tick.
    pub fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() >= ROTATION_PERIOD {
            self.previous = self.current;
            self.current = gen_secret();
            self.rotated_at = Instant::now();
        }
    }

    /// Creates the token handed to a get_peers querier. Opaque to the
    /// remote.
    pub fn create(&self, ip: &IpAddr) -> Vec<u8> {
        token(&self.current, ip)
    }

    /// Verifies a token echoed back in announce_peer. Tokens minted from
    /// the previous secret are still accepted.
    pub fn verify(&self, ip: &IpAddr, candidate: &[u8]) -> bool {
        candidate == token(&self.current, ip).as_slice()
            || candidate == token(&self.previous, ip).as_slice()
    }
}

fn gen_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0; SECRET_LEN];
    rand::thread_rng().fill(&mut secret[..]);
    secret
}

fn token(secret: &[u8], ip: &IpAddr) -> Vec<u8> {
    let mut mac = HmacSha1::new_varkey(secret)
        .expect("HMAC accepts keys of any length");
    match ip {
        IpAddr::V4(ip) => mac.update(&ip.octets()),
        IpAddr::V6(ip) => mac.update(&ip.octets()),
    }
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_verifies_for_same_ip_only() {
        let store = TokenStore::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let other: IpAddr = "1.2.3.5".parse().unwrap();

        let token = store.create(&ip);
        assert!(store.verify(&ip, &token));
        assert!(!store.verify(&other, &token));

        // a tampered token is rejected
        let mut tampered = token.clone();
        tampered[0] ^= 1;
        assert!(!store.verify(&ip, &tampered));
    }

    #[test]
    fn test_rotation_grace_period() {
        let mut store = TokenStore::new();
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        let token = store.create(&ip);

        // one rotation: the token was minted from what is now the previous
        // secret and must still verify
        store.previous = store.current;
        store.current = gen_secret();
        assert!(store.verify(&ip, &token));

        // a second rotation retires it
        store.previous = store.current;
        store.current = gen_secret();
        assert!(!store.verify(&ip, &token));
    }

    #[test]
    fn test_maybe_rotate_respects_period() {
        let mut store = TokenStore::new();
        let before = store.current;
        // freshly created: no rotation yet
        store.maybe_rotate();
        assert_eq!(store.current, before);

        // backdate the last rotation (checked: the monotonic clock may not
        // reach back far enough on a freshly booted machine)
        if let Some(past) = Instant::now().checked_sub(ROTATION_PERIOD) {
            store.rotated_at = past;
            store.maybe_rotate();
            assert_ne!(store.current, before);
            assert_eq!(store.previous, before);
        }
    }
}
