//! Simple echo demo
//!
//! Starts a TCP listener, wraps the first connection in a server-role
//! session, and echoes every accepted stream. A client session in the same
//! process opens a few named streams and prints the echoes.

use bytemux::{Error, Role, Session, Stream};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,bytemux=debug")
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!("Echo server listening on {}", addr);

    tokio::spawn(async move {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Error accepting connection: {}", e);
                return;
            }
        };
        info!("Connection from {}", peer);
        let session = Session::new(conn, Role::Server);

        // Accept streams in a loop
        loop {
            match session.accept().await {
                Ok(stream) => {
                    info!("Accepted stream {:?}", stream.name());
                    tokio::spawn(async move {
                        if let Err(e) = handle_stream(stream).await {
                            error!("Stream error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    info!("No more streams: {}", e);
                    break;
                }
            }
        }
    });

    let conn = TcpStream::connect(addr).await?;
    let session = Session::new(conn, Role::Client);

    for i in 0..3 {
        let stream = session.open_named(format!("echo-{i}")).await?;
        let message = format!("hello from stream {i}");
        stream.write(message.as_bytes()).await?;

        let mut buf = vec![0u8; 1024];
        let mut echoed = Vec::new();
        while echoed.len() < message.len() {
            let n = stream.read(&mut buf).await?;
            echoed.extend_from_slice(&buf[..n]);
        }
        info!("Stream {} echoed: {}", i, String::from_utf8_lossy(&echoed));
        stream.close().await?;
    }

    session.close().await?;
    Ok(())
}

async fn handle_stream(stream: Stream) -> bytemux::Result<()> {
    let mut buf = vec![0u8; 1024];

    loop {
        match stream.read(&mut buf).await {
            Ok(n) => {
                stream.write(&buf[..n]).await?;
            }
            Err(Error::Eof) => {
                info!("Stream {:?} closed by peer", stream.name());
                stream.close().await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
