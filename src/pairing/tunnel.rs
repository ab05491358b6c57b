//! Tunnel listener bring-up: the one encrypted-stream RPC
//! (`createListener`) that turns a completed pair-verify into a TLS-PSK
//! endpoint address.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use json::object;
use tracing::debug;

use crate::{Error, ReadWrite};

use super::codec::{aead, opack};
use super::socket::FramedTransport;
use super::verify::VerificationKeys;

/// Per-session monotonic counters. `control_seq` counts plaintext
/// `RPPairing` frames (see [`super::socket::FramedTransport`]);
/// `encrypted_seq` and `peer_encrypted_seq` count AEAD-protected messages
/// sent and received over the same control channel, each feeding the
/// nonce for its direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceCounters {
    pub control_seq: u64,
    pub encrypted_seq: u64,
    pub peer_encrypted_seq: u64,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Identifying information for the process that owns this tunnel,
/// included in `createListener`'s `peerConnectionsInfo` entry.
#[derive(Debug, Clone)]
pub struct OwningProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// The TLS-PSK endpoint the device created in response to `createListener`.
#[derive(Debug, Clone)]
pub struct TunnelEndpoint {
    pub port: u16,
    pub service_name: String,
    pub device_public_key: Vec<u8>,
}

fn stream_nonce(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Sends the encrypted `createListener` request and parses the device's
/// response into a [`TunnelEndpoint`].
pub async fn create_listener<R: ReadWrite>(
    transport: &mut FramedTransport<R>,
    keys: &VerificationKeys,
    seq: &mut SequenceCounters,
    process_info: OwningProcessInfo,
) -> Result<TunnelEndpoint, Error> {
    let request = object! {
        "key": B64.encode(keys.psk),
        "transportProtocolType": "tcp",
        "peerConnectionsInfo": [
            {
                "pid": process_info.pid,
                "name": process_info.name,
            }
        ],
    };
    let opacked = opack::encode(&request);

    let nonce = stream_nonce(seq.encrypted_seq);
    let ciphertext = aead::encrypt(&keys.client_encryption_key, &nonce, &[], &opacked)?;
    seq.encrypted_seq += 1;

    transport
        .send_packet(&object! {
            "kind": "encryptedStream",
            "data": B64.encode(ciphertext),
        })
        .await?;
    debug!("createListener request sent");

    let res = transport.receive_response().await?;
    let data = res["data"].as_str().ok_or(Error::UnexpectedResponse)?;
    let ciphertext = B64.decode(data)?;

    let nonce = stream_nonce(seq.peer_encrypted_seq);
    let plaintext = aead::decrypt(&keys.server_encryption_key, &nonce, &[], &ciphertext)?;
    seq.peer_encrypted_seq += 1;

    let (response, _) = opack::decode(&plaintext)?;
    debug!("createListener response: {response:#}");

    let port = response["port"]
        .as_u16()
        .ok_or(Error::UnexpectedResponse)?;
    let service_name = response["serviceName"]
        .as_str()
        .ok_or(Error::UnexpectedResponse)?
        .to_string();
    let device_public_key = response["devicePublicKey"]
        .as_str()
        .map(|s| B64.decode(s))
        .transpose()?
        .ok_or(Error::UnexpectedResponse)?;

    Ok(TunnelEndpoint {
        port,
        service_name,
        device_public_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_nonce_places_the_sequence_in_the_low_bytes() {
        let n = stream_nonce(1);
        assert_eq!(&n[..8], &1u64.to_le_bytes());
        assert_eq!(&n[8..], &[0, 0, 0, 0]);
    }
}
