//! TLS-PSK client: wraps the tunnel listener's raw TCP socket in TLS 1.2
//! using the pair-verify-derived `psk` as the pre-shared key. Certificate
//! validation is deliberately disabled — the PSK itself is the mutual
//! authentication contract, not a bug to be "fixed" with a certificate.

use std::pin::Pin;

use openssl::ssl::{SslConnector, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;

use crate::Error;

/// Cipher suites offered, in preference order. All of OpenSSL's PSK
/// suites are included as a catch-all for builds that lack the specific
/// legacy ones devices have historically negotiated.
const PSK_CIPHERS: &str =
    "PSK-AES256-CBC-SHA:PSK-AES128-CBC-SHA:PSK-3DES-EDE-CBC-SHA:PSK-RC4-SHA:PSK";

/// Establishes a TLS 1.2 PSK session over `socket`, using the empty string
/// as the PSK identity and `psk` as the pre-shared key.
pub async fn connect<S>(socket: S, psk: [u8; 32]) -> Result<SslStream<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_cipher_list(PSK_CIPHERS)?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_options(SslOptions::NO_TLSV1_3 | SslOptions::NO_TLSV1_1 | SslOptions::NO_TLSV1);
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        // Empty PSK identity: a single NUL terminator and nothing else.
        identity_out[0] = 0;
        psk_out[..psk.len()].copy_from_slice(&psk);
        Ok(psk.len())
    });

    let connector = builder.build();
    let config = connector.configure()?;
    // SNI/hostname is irrelevant under PSK; no certificate is ever checked.
    let ssl = config.into_ssl("remotexpc")?;

    let mut stream = SslStream::new(ssl, socket).map_err(Error::TlsSetup)?;
    match Pin::new(&mut stream).connect().await {
        Ok(()) => Ok(stream),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("cipher") {
                Err(Error::PskCipherUnavailable)
            } else {
                Err(Error::Tls(e))
            }
        }
    }
}
