//! Transport seam and address fallbacks.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// The byte channel a session runs over.
///
/// Any ordered, reliable duplex byte stream works; no framing is assumed.
/// The address hooks are optional and only feed `local_addr`/`remote_addr`
/// on the session and its streams.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for tokio::net::TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::local_addr(self).ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl Transport for tokio::io::DuplexStream {}

/// Address of one end of a session.
///
/// `Virtual` is the fallback when the transport cannot name an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Socket(SocketAddr),
    Virtual(&'static str),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Socket(addr) => write!(f, "{addr}"),
            PeerAddr::Virtual(label) => write!(f, "bytemux:{label}"),
        }
    }
}
