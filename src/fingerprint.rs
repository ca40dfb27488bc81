//! Safety number derivation for out-of-band identity verification.
//!
//! Both parties derive the same short numeric string from the pair of
//! identity public keys and compare it over a trusted channel to detect
//! man-in-the-middle attacks.

use crate::keys::DhPublicKey;

use sha2::{Digest, Sha256};

/// Number of iterated SHA-256 passes over the concatenated identities
const HASH_ITERATIONS: usize = 5;

/// Stride between digest read positions
const GROUP_STRIDE: usize = 5;

/// Bytes read per group
const GROUP_WIDTH: usize = 4;

/// Derive the safety number for a pair of identity keys.
///
/// The two canonical JWK encodings are ordered lexicographically before
/// hashing, so both sides compute the same string regardless of which key
/// is "local": `safety_number(a, b) == safety_number(b, a)`.
///
/// Output is six 5-digit groups separated by single spaces (35 chars).
#[must_use]
pub fn safety_number(local: &DhPublicKey, remote: &DhPublicKey) -> String {
    let mut first = local.canonical_json().into_bytes();
    let mut second = remote.canonical_json().into_bytes();
    if first > second {
        std::mem::swap(&mut first, &mut second);
    }

    let mut digest = [first, second].concat();
    for _ in 0..HASH_ITERATIONS {
        digest = Sha256::digest(&digest).to_vec();
    }

    let groups: Vec<String> = digest
        .chunks(GROUP_STRIDE)
        .take_while(|chunk| chunk.len() >= GROUP_WIDTH)
        .map(|chunk| {
            let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            format!("{:05}", value % 100_000)
        })
        .collect();

    groups.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_dh_keypair;

    #[test]
    fn commutative_for_any_pair() {
        let a = generate_dh_keypair().public();
        let b = generate_dh_keypair().public();
        assert_eq!(safety_number(&a, &b), safety_number(&b, &a));
    }

    #[test]
    fn format_is_six_groups_of_five_digits() {
        let a = generate_dh_keypair().public();
        let b = generate_dh_keypair().public();
        let number = safety_number(&a, &b);

        assert_eq!(number.len(), 35);
        let groups: Vec<&str> = number.split(' ').collect();
        assert_eq!(groups.len(), 6);
        for group in groups {
            assert_eq!(group.len(), 5);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn deterministic_for_same_pair() {
        let a = generate_dh_keypair().public();
        let b = generate_dh_keypair().public();
        assert_eq!(safety_number(&a, &b), safety_number(&a, &b));
    }

    #[test]
    fn differs_for_different_identities() {
        let a = generate_dh_keypair().public();
        let b = generate_dh_keypair().public();
        let c = generate_dh_keypair().public();
        assert_ne!(safety_number(&a, &b), safety_number(&a, &c));
    }
}
