//! SOCKS5 client handshake: greeting, optional username/password
//! sub-negotiation, CONNECT request, reply.
//!
//! The handshake runs on an already-connected stream and resolves to the
//! proxy's bound address; afterwards the stream relays bytes transparently.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::address::Address;
use crate::codec::{
    AuthStatus, Greeting, MethodSelection, Reply, Request, UserPass, METHOD_NO_AUTH,
    METHOD_NO_ACCEPTABLE, METHOD_USER_PASS, REP_SUCCEEDED,
};
use crate::error::{ProxyError, Result};
use crate::relay::WriteQueue;

use super::read_message;

/// Credentials for RFC 1929 username/password authentication.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    pub username: String,
    pub password: String,
}

impl ClientAuth {
    /// Credentials longer than 255 bytes cannot be framed.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        if username.len() > 255 || password.len() > 255 {
            return Err(ProxyError::InvalidAddress(
                "SOCKS5 credentials exceed 255 bytes".to_string(),
            ));
        }
        Ok(Self { username, password })
    }
}

/// Negotiate a CONNECT tunnel to `target` over `stream`.
///
/// Offers exactly one method: no-auth without credentials, username/password
/// with them. Returns the bound address from the proxy's reply.
pub async fn handshake<S>(stream: &mut S, target: &Address, auth: Option<&ClientAuth>) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    target.ensure_connectable()?;

    let method = match auth {
        Some(_) => METHOD_USER_PASS,
        None => METHOD_NO_AUTH,
    };

    let mut out = Vec::new();
    Greeting {
        methods: vec![method],
    }
    .encode(&mut out);
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(64);
    let selection = read_message(stream, &mut buf, MethodSelection::decode).await?;
    match selection.method {
        // A server may waive authentication even when it was offered
        METHOD_NO_AUTH | METHOD_USER_PASS => {}
        METHOD_NO_ACCEPTABLE => return Err(ProxyError::NoAcceptableMethod),
        // Anything else is a method we cannot run
        _ => return Err(ProxyError::NoAcceptableMethod),
    }

    if selection.method == METHOD_USER_PASS {
        // Offering 0x02 implies credentials are present
        let Some(auth) = auth else {
            return Err(ProxyError::AuthRequired);
        };
        out.clear();
        UserPass {
            username: auth.username.clone(),
            password: auth.password.clone(),
        }
        .encode(&mut out)?;
        stream.write_all(&out).await?;
        stream.flush().await?;

        let status = read_message(stream, &mut buf, AuthStatus::decode).await?;
        if status.status != 0x00 {
            return Err(ProxyError::BadCredentials);
        }
    }

    out.clear();
    Request::connect(target.clone()).encode(&mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;

    let reply = read_message(stream, &mut buf, Reply::decode).await?;
    if reply.code != REP_SUCCEEDED {
        return Err(ProxyError::ReplyFailed(reply.code));
    }

    debug!(dest = %target, bound = %reply.bound, "SOCKS5 handshake completed");
    Ok(reply.bound)
}

/// Like [`handshake`], draining `pending` into the stream once the tunnel is
/// established: the flushed prefix first (with a flush), then the rest.
///
/// When the handshake fails, the queued writes are resolved with the
/// handshake error instead of reaching the wire.
pub async fn handshake_buffered<S>(
    stream: &mut S,
    target: &Address,
    auth: Option<&ClientAuth>,
    pending: &mut WriteQueue,
) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match handshake(stream, target, auth).await {
        Ok(bound) => {
            pending.drain(stream).await?;
            Ok(bound)
        }
        Err(e) => {
            pending.cancel();
            Err(e)
        }
    }
}
