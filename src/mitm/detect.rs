//! TLS ClientHello sniffing.
//!
//! The sniffer inspects the first six bytes of a stream: record content
//! type, protocol version, record length, and the first handshake byte.
//! Sniffed bytes are never lost; they are handed back for replay at the
//! head of whatever processes the stream next.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

/// Bytes needed before classification can run.
pub const SNIFF_LEN: usize = 6;

/// Classify a stream prefix as the start of a TLS handshake record.
///
/// `[content_type, ver_major, ver_minor, len_hi, len_lo, handshake_type]`:
/// content type must be 0x16 and the handshake type one of the defined
/// handshake messages.
pub fn is_tls_client_hello(prefix: &[u8]) -> bool {
    if prefix.len() < SNIFF_LEN {
        return false;
    }
    prefix[0] == 0x16
        && matches!(prefix[5], 0x00 | 0x01 | 0x02 | 0x04 | 0x0B..=0x10 | 0x14)
}

/// Read until classification is possible, starting from bytes that were
/// already buffered during negotiation.
///
/// Returns the verdict together with every byte taken from the stream, in
/// arrival order, so the caller can replay them downstream. A stream that
/// ends before six bytes is classified as not TLS.
pub async fn sniff<S>(stream: &mut S, mut buffered: Vec<u8>) -> Result<(bool, Vec<u8>)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while buffered.len() < SNIFF_LEN {
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok((false, buffered));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
    let verdict = is_tls_client_hello(&buffered);
    Ok((verdict, buffered))
}
