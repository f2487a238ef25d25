//! Cluster rendezvous topic: `SHA-256(utf8(cluster_name))`, 32 bytes, used
//! verbatim as the overlay topic key. Every node hashing the same name joins
//! the same swarm.

use sha2::{Digest, Sha256};

pub fn cluster_topic(cluster_name: &str) -> [u8; 32] {
    let digest = Sha256::digest(cluster_name.as_bytes());
    digest.into()
}

/// Hex rendering used in overlay hello frames and logs.
pub fn cluster_topic_hex(cluster_name: &str) -> String {
    hex::encode(cluster_topic(cluster_name))
}
