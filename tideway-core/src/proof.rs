//! Attachment digests and proof-of-possession.
//!
//! A peer that merely knows a digest must not be able to obtain the bytes by
//! announcing a revision that references it; the nonce challenge proves it
//! holds the data.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore as _;
use sha1::{Digest as _, Sha1};

/// Length of a possession-proof nonce.
pub const NONCE_LEN: usize = 20;

/// The digest key identifying an attachment blob: `sha1-<base64>`.
#[must_use]
pub fn digest_key(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("sha1-{}", STANDARD.encode(hasher.finalize()))
}

/// The proof a peer holding `data` must produce for `nonce`:
/// `sha1-<base64(sha1(len(nonce) || nonce || data))>`.
#[must_use]
pub fn prove(nonce: &[u8], data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update([(nonce.len() & 0xff) as u8]);
    hasher.update(nonce);
    hasher.update(data);
    format!("sha1-{}", STANDARD.encode(hasher.finalize()))
}

/// A fresh random nonce and the proof expected for `data`.
#[must_use]
pub fn generate_proof(data: &[u8]) -> ([u8; NONCE_LEN], String) {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let proof = prove(&nonce, data);
    (nonce, proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_key_of_empty_input() {
        // base64 of the well-known SHA-1 of the empty string.
        assert_eq!(digest_key(b""), "sha1-2jmj7l5rSw0yVb/vlWAYkK/YBwk=");
    }

    #[test]
    fn digest_key_is_deterministic_and_content_bound() {
        assert_eq!(digest_key(b"hello"), digest_key(b"hello"));
        assert_ne!(digest_key(b"hello"), digest_key(b"world"));
        assert!(digest_key(b"hello").starts_with("sha1-"));
    }

    #[test]
    fn proof_depends_on_nonce_and_data() {
        let p1 = prove(b"nonce-1", b"data");
        assert_eq!(p1, prove(b"nonce-1", b"data"));
        assert_ne!(p1, prove(b"nonce-2", b"data"));
        assert_ne!(p1, prove(b"nonce-1", b"other"));
    }

    #[test]
    fn generated_proof_matches_recomputation() {
        let (nonce, proof) = generate_proof(b"attachment bytes");
        assert_eq!(proof, prove(&nonce, b"attachment bytes"));
    }

    #[test]
    fn proof_binds_the_nonce_length() {
        // The length byte prevents nonce/data boundary ambiguity.
        assert_ne!(prove(b"ab", b"cd"), prove(b"abc", b"d"));
    }
}
