//! On-disk persistence for a host's RemoteXPC pairing identity.
//!
//! A `DeviceIdentity` is the host-side half of a pair-verify relationship:
//! a long-lived X25519/Ed25519 keypair plus, once pairing has succeeded at
//! least once, the peer's remembered public key. It round-trips through an
//! opaque plist dictionary on disk, the same "blob of key/value pairs"
//! contract the rest of this crate treats plists as.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::Error;

/// A host identity used across pair-verify attempts with one device.
///
/// Unlike the ephemeral keys used within a single pair-verify exchange
/// (see [`super::verify`]), this keypair is generated once and persisted,
/// since the device remembers the host's public key from the original
/// pairing and will reject a pair-verify from a host presenting a
/// different one.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub(crate) x_private_key: StaticSecret,
    pub(crate) x_public_key: X25519PublicKey,
    pub(crate) e_private_key: SigningKey,
    pub(crate) e_public_key: VerifyingKey,
    /// Host-chosen identifier sent in pairing-data TLV8 records.
    pub identifier: String,
    /// The device's public key, once learned from a completed pair-verify.
    pub peer_public_key: Option<[u8; 32]>,
    /// The device's remote-unlock host key, if one was issued during pairing.
    pub remote_unlock_host_key: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RawDeviceIdentity {
    #[serde(rename = "XPrivateKey")]
    x_private_key: plist::Data,
    #[serde(rename = "EPrivateKey")]
    e_private_key: plist::Data,
    #[serde(rename = "Identifier")]
    identifier: String,
    #[serde(rename = "PeerPublicKey")]
    peer_public_key: Option<plist::Data>,
    #[serde(rename = "RemoteUnlockHostKey")]
    remote_unlock_host_key: Option<String>,
}

impl DeviceIdentity {
    /// Generates a fresh identity with a random identifier and no remembered peer.
    pub fn generate() -> Self {
        let x_private_key = StaticSecret::random_from_rng(OsRng);
        let x_public_key = X25519PublicKey::from(&x_private_key);

        let e_private_key = SigningKey::generate(&mut OsRng);
        let e_public_key = VerifyingKey::from(&e_private_key);

        let identifier = format!("{:016X}", rand_identifier());

        Self {
            x_private_key,
            x_public_key,
            e_private_key,
            e_public_key,
            identifier,
            peer_public_key: None,
            remote_unlock_host_key: None,
        }
    }

    pub fn x25519_public_key(&self) -> X25519PublicKey {
        self.x_public_key
    }

    pub fn ed25519_public_key(&self) -> VerifyingKey {
        self.e_public_key
    }

    /// Signs `message` with the host's long-term Ed25519 key, as required
    /// by pair-verify M3.
    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        use ed25519_dalek::Signer;
        self.e_private_key.sign(message)
    }

    /// Reads a persisted identity from a plist file on disk.
    pub fn read_from_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Parses a persisted identity from an in-memory plist.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: RawDeviceIdentity = plist::from_bytes(bytes)?;
        raw.try_into()
    }

    /// Serializes the identity as a binary plist, suitable for writing to disk.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let raw = RawDeviceIdentity::from(self);
        let mut out = Vec::new();
        plist::to_writer_binary(&mut out, &raw)?;
        Ok(out)
    }

    /// Writes the identity to disk as a binary plist.
    pub fn write_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), Error> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("identifier", &self.identifier)
            .field("has_peer_public_key", &self.peer_public_key.is_some())
            .field(
                "has_remote_unlock_host_key",
                &self.remote_unlock_host_key.is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl From<&DeviceIdentity> for RawDeviceIdentity {
    fn from(id: &DeviceIdentity) -> Self {
        Self {
            x_private_key: id.x_private_key.to_bytes().to_vec().into(),
            e_private_key: id.e_private_key.to_bytes().to_vec().into(),
            identifier: id.identifier.clone(),
            peer_public_key: id.peer_public_key.map(|k| k.to_vec().into()),
            remote_unlock_host_key: id.remote_unlock_host_key.clone(),
        }
    }
}

impl TryFrom<RawDeviceIdentity> for DeviceIdentity {
    type Error = Error;

    fn try_from(raw: RawDeviceIdentity) -> Result<Self, Error> {
        let x_bytes: [u8; 32] = raw
            .x_private_key
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidKeyLength(raw.x_private_key.as_ref().len(), 32))?;
        let x_private_key = StaticSecret::from(x_bytes);
        let x_public_key = X25519PublicKey::from(&x_private_key);

        let e_bytes: [u8; 32] = raw
            .e_private_key
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidKeyLength(raw.e_private_key.as_ref().len(), 32))?;
        let e_private_key = SigningKey::from_bytes(&e_bytes);
        let e_public_key = VerifyingKey::from(&e_private_key);

        let peer_public_key = match raw.peer_public_key {
            Some(data) => {
                let bytes: [u8; 32] = data
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::InvalidKeyLength(data.as_ref().len(), 32))?;
                Some(bytes)
            }
            None => None,
        };

        Ok(Self {
            x_private_key,
            x_public_key,
            e_private_key,
            e_public_key,
            identifier: raw.identifier,
            peer_public_key,
            remote_unlock_host_key: raw.remote_unlock_host_key,
        })
    }
}

fn rand_identifier() -> u64 {
    use rand_core::RngCore;
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_binary_plist() {
        let mut identity = DeviceIdentity::generate();
        identity.peer_public_key = Some([7u8; 32]);
        identity.remote_unlock_host_key = Some("host-key-blob".to_string());

        let bytes = identity.serialize().unwrap();
        let restored = DeviceIdentity::from_bytes(&bytes).unwrap();

        assert_eq!(restored.identifier, identity.identifier);
        assert_eq!(restored.peer_public_key, identity.peer_public_key);
        assert_eq!(
            restored.remote_unlock_host_key,
            identity.remote_unlock_host_key
        );
        assert_eq!(
            restored.x_public_key.as_bytes(),
            identity.x_public_key.as_bytes()
        );
    }
}
