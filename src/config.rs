use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Config {
    // Unique 20-byte identifier sent in our handshakes.
    pub client_id: [u8; 20],

    // Max block requests kept in flight to a single peer.
    pub max_piped_requests: u32,

    // Max piece messages queued to a peer before we flush with a
    // choke/unchoke pair and stop serving requests.
    pub max_piece_msgs: u32,

    // Peers that leave queued output unwritten for this long are dropped.
    pub write_timeout: Duration,

    // Idle connections get a keepalive at this interval.
    pub keepalive_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: random_client_id(),
            max_piped_requests: 10,
            max_piece_msgs: 64,
            write_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(120),
        }
    }
}

const CLIENT_ID_PREFIX: &[u8; 8] = b"-PW0010-";

pub fn random_client_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = random_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert_ne!(id[8..], [0u8; 12]);
    }
}
