//! SOCKS5 protocol endpoints (RFC 1928, RFC 1929).
//!
//! `client` drives the handshake against an upstream SOCKS proxy; `server`
//! negotiates with a downstream client and hands the connection off to an
//! outbound dialer. Only the CONNECT command and the `0x00`/`0x02` auth
//! methods are supported.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

pub mod client;
pub mod server;

pub use client::ClientAuth;
pub use server::{Established, ServerAuth};

/// Accumulate bytes until `decode` produces a full message, then consume
/// exactly that message from the buffer.
pub(crate) async fn read_message<S, T, F>(
    stream: &mut S,
    buf: &mut BytesMut,
    decode: F,
) -> Result<T>
where
    S: AsyncRead + Unpin + ?Sized,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>>,
{
    loop {
        if let Some((msg, consumed)) = decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(msg);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during SOCKS negotiation",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Greeting;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_message_across_split_writes() {
        let (mut near, mut far) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            far.write_all(&[0x05]).await.unwrap();
            tokio::task::yield_now().await;
            far.write_all(&[0x02, 0x00]).await.unwrap();
            tokio::task::yield_now().await;
            far.write_all(&[0x02]).await.unwrap();
        });

        let mut buf = BytesMut::new();
        let greeting = read_message(&mut near, &mut buf, Greeting::decode)
            .await
            .unwrap();
        assert_eq!(greeting.methods, vec![0x00, 0x02]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let (mut near, far) = tokio::io::duplex(16);
        drop(far);
        let mut buf = BytesMut::new();
        let err = read_message(&mut near, &mut buf, Greeting::decode)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
