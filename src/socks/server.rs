//! SOCKS5 server negotiation: greeting, optional username/password check,
//! CONNECT dispatch through an outbound dialer.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::address::Address;
use crate::codec::{
    AuthStatus, Greeting, MethodSelection, Reply, Request, UserPass, CMD_CONNECT, METHOD_NO_AUTH,
    METHOD_NO_ACCEPTABLE, METHOD_USER_PASS, REP_COMMAND_NOT_SUPPORTED, REP_HOST_UNREACHABLE,
};
use crate::error::{ProxyError, Result};
use crate::outbound::{Outbound, ProxyStream};

use super::read_message;

/// Credentials a client must present when authentication is required.
#[derive(Debug, Clone)]
pub struct ServerAuth {
    pub username: String,
    pub password: String,
}

impl ServerAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn accepts(&self, presented: &UserPass) -> bool {
        self.username == presented.username && self.password == presented.password
    }
}

/// A successfully negotiated CONNECT: the dialed outbound, the requested
/// target, and any client bytes that arrived after the request.
pub struct Established {
    pub outbound: Box<dyn ProxyStream>,
    pub target: Address,
    /// Bytes read past the end of the request. They belong at the head of
    /// the tunneled stream, ahead of everything the client sends later.
    pub leftover: Vec<u8>,
}

async fn write_message<S, F>(stream: &mut S, encode: F) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut out = Vec::new();
    encode(&mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Negotiate with a SOCKS5 client and dial the requested destination.
///
/// On dial failure the client gets a host-unreachable reply with the
/// requested address echoed as the bound address, and the dial error is
/// returned.
pub async fn serve<S>(
    stream: &mut S,
    auth: Option<&ServerAuth>,
    dialer: &dyn Outbound,
) -> Result<Established>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(512);

    let greeting = read_message(stream, &mut buf, Greeting::decode).await?;
    let selected = match auth {
        Some(_) if greeting.offers(METHOD_USER_PASS) => METHOD_USER_PASS,
        None if greeting.offers(METHOD_NO_AUTH) => METHOD_NO_AUTH,
        _ => {
            write_message(stream, |out| {
                MethodSelection {
                    method: METHOD_NO_ACCEPTABLE,
                }
                .encode(out);
                Ok(())
            })
            .await?;
            return Err(ProxyError::NoAcceptableMethod);
        }
    };
    write_message(stream, |out| {
        MethodSelection { method: selected }.encode(out);
        Ok(())
    })
    .await?;

    if selected == METHOD_USER_PASS {
        let presented = read_message(stream, &mut buf, UserPass::decode).await?;
        // `selected` can only be USER_PASS when auth is configured
        let accepted = auth.is_some_and(|a| a.accepts(&presented));
        write_message(stream, |out| {
            AuthStatus {
                status: if accepted { 0x00 } else { 0x01 },
            }
            .encode(out);
            Ok(())
        })
        .await?;
        if !accepted {
            return Err(ProxyError::BadCredentials);
        }
    }

    let request = read_message(stream, &mut buf, Request::decode).await?;
    if request.command != CMD_CONNECT {
        write_message(stream, |out| {
            Reply {
                code: REP_COMMAND_NOT_SUPPORTED,
                bound: request.address.clone(),
            }
            .encode(out)
        })
        .await?;
        return Err(ProxyError::InvalidState("only CONNECT is supported"));
    }

    let target = request.address;
    match dialer.dial(&target).await {
        Ok(outbound) => {
            let bound: Address = outbound
                .local_addr()
                .map(Address::from)
                .unwrap_or_else(|_| target.clone());
            write_message(stream, |out| Reply::succeeded(bound).encode(out)).await?;
            debug!(dest = %target, "SOCKS5 connect accepted");
            Ok(Established {
                outbound,
                target,
                leftover: buf.to_vec(),
            })
        }
        Err(e) => {
            write_message(stream, |out| {
                Reply {
                    code: REP_HOST_UNREACHABLE,
                    bound: target.clone(),
                }
                .encode(out)
            })
            .await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct FakeStream {
        io: DuplexStream,
        local: SocketAddr,
    }

    impl tokio::io::AsyncRead for FakeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for FakeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.io).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_shutdown(cx)
        }
    }

    impl ProxyStream for FakeStream {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
    }

    /// Dialer that hands out one half of a duplex pipe.
    struct FakeDialer {
        local: SocketAddr,
        stream: parking_lot::Mutex<Option<DuplexStream>>,
        fail: bool,
    }

    impl FakeDialer {
        fn succeeding(local: SocketAddr) -> (Self, DuplexStream) {
            let (near, far) = tokio::io::duplex(256);
            (
                Self {
                    local,
                    stream: parking_lot::Mutex::new(Some(near)),
                    fail: false,
                },
                far,
            )
        }

        fn failing() -> Self {
            Self {
                local: "0.0.0.0:0".parse().unwrap(),
                stream: parking_lot::Mutex::new(None),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Outbound for FakeDialer {
        async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>> {
            if self.fail {
                return Err(ProxyError::HostUnreachable(addr.to_string()));
            }
            let io = self.stream.lock().take().expect("dialed twice");
            Ok(Box::new(FakeStream {
                io,
                local: self.local,
            }))
        }
    }

    #[tokio::test]
    async fn test_no_auth_connect_with_early_data() {
        let (mut client, mut server_side) = tokio::io::duplex(256);
        let (dialer, _origin) = FakeDialer::succeeding("192.168.1.1:80".parse().unwrap());

        let server = tokio::spawn(async move {
            let established = serve(&mut server_side, None, &dialer).await.unwrap();
            established.leftover
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x00]);

        // Request plus bytes that race ahead of the reply
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 168, 1, 1, 0x00, 0x50, 1, 2, 3, 4, 5])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 192, 168, 1, 1, 0x00, 0x50]);

        assert_eq!(server.await.unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_dial_failure_replies_host_unreachable() {
        let (mut client, mut server_side) = tokio::io::duplex(256);
        let dialer = FakeDialer::failing();

        let server =
            tokio::spawn(async move { serve(&mut server_side, None, &dialer).await.map(|_| ()) });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 9, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        // Host unreachable, requested address echoed back
        assert_eq!(reply, [0x05, 0x04, 0x00, 0x01, 10, 0, 0, 9, 0x00, 0x50]);

        assert!(matches!(
            server.await.unwrap(),
            Err(ProxyError::HostUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_required_flow() {
        let (mut client, mut server_side) = tokio::io::duplex(256);
        let (dialer, _origin) = FakeDialer::succeeding("10.0.0.1:1080".parse().unwrap());
        let auth = ServerAuth::new("user", "secret");

        let server = tokio::spawn(async move {
            serve(&mut server_side, Some(&auth), &dialer).await.map(|e| e.target)
        });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x02]);

        let mut auth_msg = vec![0x01, 4];
        auth_msg.extend_from_slice(b"user");
        auth_msg.push(6);
        auth_msg.extend_from_slice(b"secret");
        client.write_all(&auth_msg).await.unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 7, b'a', b'.', b'b', b'.', b'c', b'.', b'd', 0x01, 0xBB])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        assert_eq!(
            server.await.unwrap().unwrap(),
            Address::Domain("a.b.c.d".to_string(), 443)
        );
    }

    #[tokio::test]
    async fn test_auth_rejects_bad_credentials() {
        let (mut client, mut server_side) = tokio::io::duplex(256);
        let (dialer, _origin) = FakeDialer::succeeding("10.0.0.1:1080".parse().unwrap());
        let auth = ServerAuth::new("user", "secret");

        let server = tokio::spawn(async move {
            serve(&mut server_side, Some(&auth), &dialer).await.map(|_| ())
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        let mut auth_msg = vec![0x01, 4];
        auth_msg.extend_from_slice(b"user");
        auth_msg.push(5);
        auth_msg.extend_from_slice(b"wrong");
        client.write_all(&auth_msg).await.unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        assert!(matches!(
            server.await.unwrap(),
            Err(ProxyError::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, mut server_side) = tokio::io::duplex(256);
        let (dialer, _origin) = FakeDialer::succeeding("10.0.0.1:1080".parse().unwrap());
        // Auth required but the client only offers no-auth
        let auth = ServerAuth::new("user", "secret");

        let server = tokio::spawn(async move {
            serve(&mut server_side, Some(&auth), &dialer).await.map(|_| ())
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0xFF]);

        assert!(matches!(
            server.await.unwrap(),
            Err(ProxyError::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (mut client, mut server_side) = tokio::io::duplex(256);
        let (dialer, _origin) = FakeDialer::succeeding("10.0.0.1:1080".parse().unwrap());

        let server = tokio::spawn(async move {
            serve(&mut server_side, None, &dialer).await.map(|_| ())
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);

        assert!(matches!(
            server.await.unwrap(),
            Err(ProxyError::InvalidState(_))
        ));
    }
}
