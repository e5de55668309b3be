//! Bidirectional stream multiplexing over a single reliable byte transport.
//!
//! This crate layers many independent, flow-controlled byte streams over
//! one ordered transport such as a TCP connection. It allows applications
//! to:
//!
//! - Open and accept arbitrarily many concurrent streams per connection
//! - Half-close, reset, and apply per-stream read/write deadlines
//! - Keep per-stream congestion local via bounded inbound queues
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓  read / write / close / reset
//! Stream (per-stream state, inbound queue, deadlines)
//!     ↓  frames
//! Session (read loop, write serializer, channel table)
//!     ↓  bytes
//! Transport (TCP, duplex pipe, anything ordered and reliable)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use bytemux::{Role, Session};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TcpStream::connect("127.0.0.1:4000").await?;
//!     let session = Session::new(transport, Role::Client);
//!
//!     let stream = session.open_named("echo").await?;
//!     stream.write(b"hello world").await?;
//!
//!     let mut buf = vec![0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("echoed: {:?}", &buf[..n]);
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod addr;
pub mod config;
mod deadline;
pub mod error;
pub mod frame;
pub mod pool;
pub mod session;
pub mod stream;
mod writer;

// Re-export main types
pub use addr::{PeerAddr, Transport};
pub use config::Config;
pub use error::{Error, Result};
pub use frame::{FrameKind, StreamId, Tag};
pub use pool::{BufferPool, PooledBuf};
pub use session::{Role, Session};
pub use stream::Stream;
