//! X25519 keypair generation and Diffie-Hellman, used both for the
//! long-term identity keys ([`super::super::identity`]) and the ephemeral
//! keys exchanged during pair-verify ([`super::super::verify`]).

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::Error;

/// Generates a fresh X25519 keypair.
pub fn generate_keypair() -> (PublicKey, StaticSecret) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public, secret)
}

/// Performs X25519 Diffie-Hellman, returning the 32-byte shared secret.
///
/// `peer_public_key` must be exactly 32 bytes.
pub fn ecdh(secret: &StaticSecret, peer_public_key: &[u8]) -> Result<[u8; 32], Error> {
    let peer_bytes: [u8; 32] = peer_public_key
        .try_into()
        .map_err(|_| Error::InvalidKeyLength(peer_public_key.len(), 32))?;
    let peer = PublicKey::from(peer_bytes);
    Ok(secret.diffie_hellman(&peer).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_shared_secret() {
        let (a_pk, a_sk) = generate_keypair();
        let (b_pk, b_sk) = generate_keypair();

        let from_a = ecdh(&a_sk, b_pk.as_bytes()).unwrap();
        let from_b = ecdh(&b_sk, a_pk.as_bytes()).unwrap();

        assert_eq!(from_a, from_b);
    }

    #[test]
    fn rejects_a_wrong_length_peer_key() {
        let (_, sk) = generate_keypair();
        let err = ecdh(&sk, &[0u8; 31]).unwrap_err();
        assert!(matches!(err, Error::InvalidKeyLength(31, 32)));
    }
}
