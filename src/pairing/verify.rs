//! Pair-verify: the four-message exchange (M1-M4) that turns a stored
//! [`DeviceIdentity`] into a fresh set of [`VerificationKeys`] for one
//! tunnel session.
//!
//! ```text
//! INIT -> M1_SENT -> M2_RECVD -> M3_SENT -> M4_RECVD -> ESTABLISHED
//! ```
//!
//! Every failure here is fatal to the session: a device that rejects the
//! host's proof, or a signature that doesn't check out, means the stored
//! identity no longer matches what the device remembers, and the caller
//! needs a different pairing record, not a retry on this one.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use json::object;
use sha2::Sha512;
use tracing::debug;

use crate::{Error, ReadWrite};

use super::codec::tlv::{PairingDataComponentType as TlvType, TLV8Entry};
use super::codec::{aead, tlv, x25519};
use super::identity::DeviceIdentity;
use super::socket::FramedTransport;

/// Session keys produced by a completed pair-verify. Lives only as long as
/// the tunnel session; never persisted.
#[derive(Clone)]
pub struct VerificationKeys {
    pub shared_secret: [u8; 32],
    pub client_encryption_key: [u8; 32],
    pub server_encryption_key: [u8; 32],
    pub psk: [u8; 32],
}

impl std::fmt::Debug for VerificationKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKeys").finish_non_exhaustive()
    }
}

fn hkdf_sha512(salt: &[u8], info: &[u8], shared: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha512>::new(Some(salt), shared);
    let mut okm = [0u8; 32];
    // `info` is always non-empty and `okm` is 32 bytes, well within the
    // HKDF-SHA512 expand limit; this cannot fail.
    hk.expand(info, &mut okm).expect("HKDF-SHA512 expand of 32 bytes never fails");
    okm
}

fn pad_nonce(label: &[u8; 8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(label);
    nonce
}

/// Runs the pair-verify state machine to completion against an already
/// connected `RPPairing` control transport, returning the session keys on
/// success.
pub async fn pair_verify<R: ReadWrite>(
    transport: &mut FramedTransport<R>,
    identity: &DeviceIdentity,
) -> Result<VerificationKeys, Error> {
    // M1: host -> device
    let (epk_h, esk_h) = x25519::generate_keypair();
    let m1 = tlv::serialize_tlv8(&[
        TLV8Entry {
            tlv_type: TlvType::State,
            data: vec![1],
        },
        TLV8Entry {
            tlv_type: TlvType::PublicKey,
            data: epk_h.as_bytes().to_vec(),
        },
    ]);
    transport
        .send_packet(&object! { "kind": "pairVerify", "data": B64.encode(m1) })
        .await?;
    debug!("pair-verify M1 sent");

    // M2: device -> host
    let res = transport.receive_response().await?;
    let m2_entries = read_pairing_data(&res)?;

    let state = find_u8(&m2_entries, TlvType::State)?;
    if state != 2 {
        return Err(Error::InvalidPairingState("expected M2"));
    }
    let epk_d_bytes = find_entry(&m2_entries, TlvType::PublicKey)?;
    let encrypted_data = find_entry(&m2_entries, TlvType::EncryptedData)?;

    let shared_secret = x25519::ecdh(&esk_h, epk_d_bytes)?;
    let session_key = hkdf_sha512(
        b"Pair-Verify-Encrypt-Salt",
        b"Pair-Verify-Encrypt-Info",
        &shared_secret,
    );

    let nonce = pad_nonce(b"PV-Msg02");
    let inner = aead::decrypt(&session_key, &nonce, &[], encrypted_data)?;
    let inner_entries = tlv::deserialize_tlv8(&inner)?;

    let device_identifier = find_entry(&inner_entries, TlvType::Identifier)?.to_vec();
    let device_signature = find_entry(&inner_entries, TlvType::Signature)?;

    let peer_public_key = identity.peer_public_key.ok_or(Error::NoPairingRecord)?;
    let verifying_key =
        VerifyingKey::from_bytes(&peer_public_key).map_err(|_| Error::InvalidSignature)?;

    let mut signed_over = Vec::with_capacity(32 + device_identifier.len() + 32);
    signed_over.extend_from_slice(epk_d_bytes);
    signed_over.extend_from_slice(&device_identifier);
    signed_over.extend_from_slice(epk_h.as_bytes());

    let signature_bytes: [u8; 64] = device_signature
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify_strict(&signed_over, &signature)
        .map_err(|_| Error::InvalidSignature)?;
    debug!("pair-verify M2 signature verified");

    // M3: host -> device
    let mut to_sign = Vec::with_capacity(32 + identity.identifier.len() + 32);
    to_sign.extend_from_slice(epk_h.as_bytes());
    to_sign.extend_from_slice(identity.identifier.as_bytes());
    to_sign.extend_from_slice(epk_d_bytes);
    let host_signature = identity.sign(&to_sign);

    let m3_inner = tlv::serialize_tlv8(&[
        TLV8Entry {
            tlv_type: TlvType::Identifier,
            data: identity.identifier.as_bytes().to_vec(),
        },
        TLV8Entry {
            tlv_type: TlvType::Signature,
            data: host_signature.to_vec(),
        },
    ]);
    let nonce = pad_nonce(b"PV-Msg03");
    let m3_encrypted = aead::encrypt(&session_key, &nonce, &[], &m3_inner)?;

    let m3 = tlv::serialize_tlv8(&[
        TLV8Entry {
            tlv_type: TlvType::State,
            data: vec![3],
        },
        TLV8Entry {
            tlv_type: TlvType::EncryptedData,
            data: m3_encrypted,
        },
    ]);
    transport
        .send_packet(&object! { "kind": "pairVerify", "data": B64.encode(m3) })
        .await?;
    debug!("pair-verify M3 sent");

    // M4: device -> host
    let res = transport.receive_response().await?;
    let m4_entries = read_pairing_data(&res)?;
    let state = find_u8(&m4_entries, TlvType::State)?;
    if state != 4 {
        return Err(Error::PairVerifyFailed);
    }
    debug!("pair-verify established");

    Ok(VerificationKeys {
        shared_secret,
        client_encryption_key: hkdf_sha512(
            b"ClientEncrypt-main",
            b"ClientEncrypt-Sub",
            &shared_secret,
        ),
        server_encryption_key: hkdf_sha512(
            b"ServerEncrypt-main",
            b"ServerEncrypt-Sub",
            &shared_secret,
        ),
        psk: hkdf_sha512(
            b"RemotePairingCDXKit",
            b"RemotePairingCDXKit",
            &shared_secret,
        ),
    })
}

fn read_pairing_data(msg: &json::JsonValue) -> Result<Vec<TLV8Entry>, Error> {
    let data = msg["data"]
        .as_str()
        .ok_or(Error::UnexpectedResponse)?;
    tlv::deserialize_tlv8(&B64.decode(data)?)
}

fn find_entry(entries: &[TLV8Entry], ty: TlvType) -> Result<&[u8], Error> {
    entries
        .iter()
        .find(|e| e.tlv_type == ty)
        .map(|e| e.data.as_slice())
        .ok_or(Error::UnexpectedResponse)
}

fn find_u8(entries: &[TLV8Entry], ty: TlvType) -> Result<u8, Error> {
    let data = find_entry(entries, ty)?;
    data.first().copied().ok_or(Error::UnexpectedResponse)
}
