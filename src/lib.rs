#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]
#![warn(missing_copy_implementations)]

mod obfuscation;
pub(crate) mod cursor;
pub mod afc;
pub mod dtx;
pub mod pairing;

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A trait combining all required characteristics for a device communication socket.
///
/// Convenience trait for any type usable as an asynchronous read/write socket for
/// device communication. Tokio's `TcpStream` implements this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets.
pub type BoxedSocket = Box<dyn ReadWrite>;

/// Comprehensive error type for all RemoteXPC tunnel, AFC, and DTX operations.
///
/// Variants are grouped to mirror the seven failure categories a caller needs to
/// distinguish: transport, protocol framing, cryptography, pairing state, AFC
/// device-reported errors, DTX multiplexer errors, and deadline/cancellation.
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum Error {
    // --- Network ---
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("operation timed out")]
    Timeout = -2,
    #[error("peer closed the connection")]
    PeerClosed = -3,
    #[error("operation was cancelled")]
    Cancelled = -4,

    // --- Protocol / framing ---
    #[error("unexpected response from device")]
    UnexpectedResponse = -10,
    #[error("malformed frame: {0}")]
    MalformedFrame(String) = -11,
    #[error("invalid magic bytes in frame header")]
    InvalidMagic = -12,
    #[error("proclaimed packet size does not match actual size")]
    PacketSizeMismatch = -13,
    #[error("json control message failed to parse")]
    Json(#[from] json::Error) = -14,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -15,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -16,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize) = -17,
    #[error("malformed TLV8 data")]
    MalformedTlv = -18,
    #[error("unknown TLV8 type `{0:#x}`")]
    UnknownTlv(u8) = -19,
    #[error("base64 decode failed")]
    Base64(#[from] base64::DecodeError) = -20,

    // --- Cryptography ---
    #[error("AEAD encryption failed")]
    EncryptionFailed = -30,
    #[error("AEAD decryption failed under every known nonce/AAD fallback")]
    DecryptionFailed = -31,
    #[error("public key has the wrong length: expected {1}, got {0}")]
    InvalidKeyLength(usize, usize) = -32,
    #[error("ed25519 signature verification failed")]
    InvalidSignature = -33,
    #[error("TLS error")]
    Tls(#[from] openssl::ssl::Error) = -34,
    #[error("TLS setup failed")]
    TlsSetup(#[from] openssl::error::ErrorStack) = -35,
    #[error("no PSK cipher suite could be negotiated")]
    PskCipherUnavailable = -36,

    // --- Pairing ---
    #[error("pair-verify failed: device rejected the proof")]
    PairVerifyFailed = -40,
    #[error("no persisted pairing record for this identifier")]
    NoPairingRecord = -41,
    #[error("pair-verify state machine used out of order (in state {0:?})")]
    InvalidPairingState(&'static str) = -42,
    #[error("device reported a pairing error response")]
    DeviceReportedError = -43,

    // --- AFC ---
    #[error("afc error: {0}")]
    Afc(#[from] afc::AfcError) = -50,
    #[error("unknown afc opcode")]
    UnknownAfcOpcode = -51,
    #[error("missing file attribute `{0}`")]
    AfcMissingAttribute(&'static str) = -52,
    #[error("path is outside of the requested walk root")]
    AfcPathEscape = -53,

    // --- DTX ---
    #[error("NSKeyedArchive error")]
    NsKeyedArchiveError(#[from] ns_keyed_archive::ConverterError) = -60,
    #[error("unknown DTX auxiliary value type `{0}`")]
    UnknownAuxValueType(u32) = -61,
    #[error("message addressed to unknown or closed DTX channel `{0}`")]
    UnknownChannel(i32) = -62,
    #[error("device sent a compressed DTX message, which is unsupported")]
    CompressedMessagesUnsupported = -63,
    #[error("DTX handshake has not completed")]
    DtxHandshakeIncomplete = -64,
    #[error("device rejected DTX channel creation")]
    ChannelCreationFailed = -65,

    #[error("internal error: {0}")]
    InternalError(String) = -90,
}
