//! Leaf codecs the rest of the pairing/tunnel stack is built on: the OPACK2
//! JSON-like binary encoding, TLV8, ChaCha20-Poly1305 AEAD, and X25519.

pub mod aead;
pub mod opack;
pub mod tlv;
pub mod x25519;
