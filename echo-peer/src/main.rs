use singularity_shared::codec::{encode_frame, FrameMarkers};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Answer every line from one client with `S<line>E` plus a newline
///
/// The newline is noise to the WiFi frame decoder and the message
/// terminator for the Bluetooth TCP simulation, so both transports can use
/// the same peer.
async fn serve(socket: TcpStream) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        info!("[PEER] >> {}", line);
        writer
            .write_all(&encode_frame(line, FrameMarkers::default()))
            .await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "0.0.0.0:9000".into());
    let listener = TcpListener::bind(&addr).await?;
    info!("[PEER] Echo peer listening on {}", addr);

    loop {
        let (socket, remote) = listener.accept().await?;
        info!("[PEER] Client {} connected", remote);
        tokio::spawn(async move {
            match serve(socket).await {
                Ok(()) => info!("[PEER] Client {} left", remote),
                Err(e) => warn!("[PEER] Client {} failed: {}", remote, e),
            }
        });
    }
}
