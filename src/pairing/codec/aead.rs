//! ChaCha20-Poly1305 AEAD, wrapping the `chacha20poly1305` crate with the
//! nonce/AAD compatibility matrix RemoteXPC's pair-verify and tunnel-setup
//! exchanges require to interoperate with older device-side stacks.

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, KeyInit, Nonce,
};
use tracing::warn;

use crate::Error;

const TAG_LEN: usize = 16;
const TRUNCATED_TAG_LEN: usize = 12;

/// Encrypts `plaintext`, returning `ciphertext || 16-byte tag`.
pub fn encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::EncryptionFailed)
}

/// Decrypts `ciphertext` (`ciphertext || tag`), trying the provided AAD
/// first and then, on authentication failure, a fixed sequence of fallback
/// attempts that accommodate server implementations that have historically
/// diverged from the primary contract: empty AAD, no AAD, and a truncated
/// 12-byte tag under both AAD choices.
pub fn decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce);

    let attempts: &[(&[u8], bool)] = &[
        (aad, false),
        (&[], false),
        (&[], false),
        (aad, true),
        (&[], true),
    ];

    for (i, (attempt_aad, truncated_tag)) in attempts.iter().enumerate() {
        let msg: std::borrow::Cow<[u8]> = if *truncated_tag {
            match repad_truncated_tag(ciphertext) {
                Some(padded) => std::borrow::Cow::Owned(padded),
                None => continue,
            }
        } else {
            std::borrow::Cow::Borrowed(ciphertext)
        };

        if let Ok(plaintext) = cipher.decrypt(
            nonce,
            Payload {
                msg: &msg,
                aad: attempt_aad,
            },
        ) {
            if i > 0 {
                warn!("AEAD decryption only succeeded via fallback attempt {i}");
            }
            return Ok(plaintext);
        }
    }

    Err(Error::DecryptionFailed)
}

/// Reinterprets the final 12 bytes of `input` as a truncated Poly1305 tag,
/// zero-padding it back out to the full 16 bytes the cipher expects.
fn repad_truncated_tag(input: &[u8]) -> Option<Vec<u8>> {
    if input.len() < TRUNCATED_TAG_LEN {
        return None;
    }
    let split = input.len() - TRUNCATED_TAG_LEN;
    let mut out = Vec::with_capacity(split + TAG_LEN);
    out.extend_from_slice(&input[..split]);
    out.extend_from_slice(&input[split..]);
    out.extend_from_slice(&[0u8; TAG_LEN - TRUNCATED_TAG_LEN]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_matching_aad() {
        let key = [7u8; 32];
        let nonce = [1u8; 12];
        let aad = b"some-aad";
        let plaintext = b"pair-verify payload";

        let ciphertext = encrypt(&key, &nonce, aad, plaintext).unwrap();
        let decrypted = decrypt(&key, &nonce, aad, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn falls_back_to_empty_aad_when_the_provided_aad_is_wrong() {
        let key = [3u8; 32];
        let nonce = [9u8; 12];
        let plaintext = b"some encrypted data";

        // Encrypted with no AAD, but the caller passes a non-empty AAD in.
        let ciphertext = encrypt(&key, &nonce, &[], plaintext).unwrap();
        let decrypted = decrypt(&key, &nonce, b"mismatched-aad", &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn a_flipped_ciphertext_bit_fails_every_fallback() {
        let key = [5u8; 32];
        let nonce = [2u8; 12];
        let mut ciphertext = encrypt(&key, &nonce, b"aad", b"hello world").unwrap();
        ciphertext[0] ^= 0x01;

        assert!(matches!(
            decrypt(&key, &nonce, b"aad", &ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn a_flipped_tag_bit_fails_every_fallback() {
        let key = [5u8; 32];
        let nonce = [2u8; 12];
        let mut ciphertext = encrypt(&key, &nonce, b"aad", b"hello world").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;

        assert!(matches!(
            decrypt(&key, &nonce, b"aad", &ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }
}
