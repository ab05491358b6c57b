//! Pairing and tunnel bring-up: turns a `(ip, port, identifier)` device
//! tuple and a persisted [`identity::DeviceIdentity`] into a TLS-PSK
//! socket ready for the AFC or DTX layers to speak their own protocol
//! over.
//!
//! ```text
//! FramedTransport (RPPairing JSON) -> pair_verify (M1-M4) -> create_listener -> tls_psk::connect
//! ```
//!
//! Each step is a free function rather than a method on some shared
//! "pairing service" object: there is no long-lived pairing session state
//! beyond the socket and the keys each step hands to the next, and no
//! global/default pairing-storage instance — callers own their
//! [`identity::DeviceIdentity`] and decide how to load and store it.

pub mod codec;
pub mod identity;
pub mod socket;
pub mod tls_psk;
pub mod tunnel;
pub mod verify;

use tokio::net::TcpStream;
use tracing::debug;

use crate::Error;

pub use identity::DeviceIdentity;
pub use socket::FramedTransport;
pub use tunnel::{OwningProcessInfo, SequenceCounters, TunnelEndpoint};
pub use verify::VerificationKeys;

/// Runs the full pairing/tunnel bring-up against `(ip, port)`: connects,
/// pair-verifies with `identity`, requests a tunnel listener, and returns a
/// TLS-PSK socket connected to it plus the session keys that produced it.
pub async fn establish_tunnel(
    ip: std::net::IpAddr,
    port: u16,
    identity: &DeviceIdentity,
    process_info: OwningProcessInfo,
) -> Result<(tokio_openssl::SslStream<TcpStream>, VerificationKeys), Error> {
    let control_socket = TcpStream::connect((ip, port)).await?;
    let mut transport = FramedTransport::new(control_socket);

    let keys = verify::pair_verify(&mut transport, identity).await?;
    debug!("pair-verify complete, requesting tunnel listener");

    let mut seq = SequenceCounters::new();
    let endpoint = tunnel::create_listener(&mut transport, &keys, &mut seq, process_info).await?;
    debug!(port = endpoint.port, "tunnel listener ready");

    let tunnel_socket = TcpStream::connect((ip, endpoint.port)).await?;
    let tls = tls_psk::connect(tunnel_socket, keys.psk).await?;

    Ok((tls, keys))
}
