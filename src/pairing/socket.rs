//! Framed `RPPairing` control transport: the JSON request/response channel
//! pair-verify and tunnel setup run over before a TLS-PSK socket exists.
//!
//! Strictly lockstep — one outstanding request at a time — matching the
//! rest of this crate's one-socket-per-session discipline.

use std::time::Duration;

use json::JsonValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use crate::{Error, ReadWrite};

const MAGIC: &[u8] = b"RPPairing";

/// Default deadline for a single send/receive round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A length-prefixed JSON control channel over an already-connected socket.
pub struct FramedTransport<R: ReadWrite> {
    socket: R,
    deadline: Duration,
    control_seq: u64,
}

impl<R: ReadWrite> FramedTransport<R> {
    pub fn new(socket: R) -> Self {
        Self {
            socket,
            deadline: DEFAULT_TIMEOUT,
            control_seq: 0,
        }
    }

    pub fn with_timeout(socket: R, deadline: Duration) -> Self {
        Self {
            socket,
            deadline,
            control_seq: 0,
        }
    }

    /// Number of plaintext frames sent on this transport so far.
    pub fn control_seq(&self) -> u64 {
        self.control_seq
    }

    /// Serializes `obj` and writes it as one `RPPairing`-framed message,
    /// stamping it with the next `control_seq` value.
    pub async fn send_packet(&mut self, obj: &JsonValue) -> Result<(), Error> {
        let mut obj = obj.clone();
        obj["sequenceNumber"] = self.control_seq.into();
        self.control_seq += 1;

        let body = obj.to_string().into_bytes();
        let mut frame = Vec::with_capacity(MAGIC.len() + 2 + body.len());
        frame.extend_from_slice(MAGIC);
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);

        trace!("sending RPPairing frame ({} body bytes)", body.len());
        self.guarded(self.socket.write_all(&frame)).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Reads exactly one `RPPairing`-framed message and parses its JSON body.
    pub async fn receive_response(&mut self) -> Result<JsonValue, Error> {
        let mut header = [0u8; 9 + 2];
        self.read_exact_timed(&mut header).await?;

        if &header[..9] != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let len = u16::from_be_bytes([header[9], header[10]]) as usize;

        let mut body = vec![0u8; len];
        self.read_exact_timed(&mut body).await?;

        let text = String::from_utf8(body)?;
        Ok(json::parse(&text)?)
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.guarded(self.socket.read_exact(buf)).await
    }

    async fn guarded<T>(
        &self,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, Error> {
        match timeout(self.deadline, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::PeerClosed),
            Ok(Err(e)) => Err(Error::Socket(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Consumes the transport, returning the underlying socket (e.g. to
    /// hand off to the TLS-PSK layer after tunnel setup).
    pub fn into_inner(self) -> R {
        self.socket
    }
}

impl<R: ReadWrite> std::fmt::Debug for FramedTransport<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_json_packet_through_a_duplex_pipe() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut transport = FramedTransport::new(client);

        let body = json::object! { "hello": "world" };
        transport.send_packet(&body).await.unwrap();

        let mut header = [0u8; 11];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..9], MAGIC);
        let len = u16::from_be_bytes([header[9], header[10]]) as usize;
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        let received = json::parse(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(received["hello"], body["hello"]);
        assert_eq!(received["sequenceNumber"], 0);
    }

    #[tokio::test]
    async fn receive_parses_a_framed_message() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut transport = FramedTransport::new(server);

        let payload = json::object! { "state": 1 }.to_string().into_bytes();
        let mut frame = MAGIC.to_vec();
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        client.write_all(&frame).await.unwrap();

        let res = transport.receive_response().await.unwrap();
        assert_eq!(res["state"], 1);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut transport = FramedTransport::new(server);
        client.write_all(b"NOTRPPAIR\x00\x00").await.unwrap();

        assert!(matches!(
            transport.receive_response().await,
            Err(Error::InvalidMagic)
        ));
    }

    #[tokio::test]
    async fn times_out_waiting_for_a_response() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut transport =
            FramedTransport::with_timeout(server, Duration::from_millis(20));

        assert!(matches!(
            transport.receive_response().await,
            Err(Error::Timeout)
        ));
    }
}
