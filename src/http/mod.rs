//! HTTP/1.1 proxy endpoints: message heads and body framing, the CONNECT
//! client, and the proxy server with its forwarding loop.

pub mod connect;
pub mod message;
pub mod server;

pub use connect::basic_auth;
pub use message::{BodyFraming, Headers, RequestHead, ResponseHead};
pub use server::{Accepted, ProxyAuth};
