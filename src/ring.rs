//! A consistent-hash ring with virtual nodes, used by the session
//! policy to map an opaque session key onto one of the currently
//! registered endpoint URLs.
//!
//! Each URL is placed at
//! `VNODES` positions on a 32-bit ring, and a key's endpoint is the one
//! owning the next position clockwise from the key's own hash. This
//! bounds the fraction of keys remapped when membership changes to
//! roughly `1/n` regardless of how many endpoints existed before,
//! rather than the `(n-1)/n` remap a modulo-based picker would cause.

use std::io::Cursor;

const VNODES: u32 = 128;

fn hash(bytes: &[u8]) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(bytes), 0).expect("murmur3 hash over an in-memory buffer cannot fail")
}

/// Built fresh from a sorted slice of endpoint URLs on every
/// membership change; cheap to construct (`VNODES * n` hashes, a sort).
pub struct Ring {
    /// Sorted `(position, url_index)` pairs.
    positions: Vec<(u32, usize)>,
    urls: Vec<String>,
}

impl Ring {
    pub fn new(sorted_urls: &[String]) -> Self {
        let mut positions = Vec::with_capacity(sorted_urls.len() * VNODES as usize);
        for (idx, url) in sorted_urls.iter().enumerate() {
            for vnode in 0..VNODES {
                let key = format!("{}-{}", vnode, url);
                positions.push((hash(key.as_bytes()), idx));
            }
        }
        positions.sort_unstable_by_key(|(pos, idx)| (*pos, *idx));
        Ring {
            positions,
            urls: sorted_urls.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// The endpoint owning the ring position immediately succeeding
    /// `key`'s hash, wrapping around to the first position past 0.
    pub fn endpoint_for(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let key_hash = hash(key.as_bytes());
        let idx = match self.positions.binary_search_by_key(&key_hash, |(pos, _)| *pos) {
            Ok(i) => i,
            Err(i) => i % self.positions.len(),
        };
        let (_, url_idx) = self.positions[idx];
        Some(self.urls[url_idx].as_str())
    }
}
