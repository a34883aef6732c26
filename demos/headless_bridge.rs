//! Headless bridge example.
//!
//! Joins a single owner viewer against a real VNC server and prints the
//! drawing commands the gateway runtime would encode onto the wire. Useful
//! for watching what a downstream viewer would receive without a gateway.
//!
//! Usage:
//!   cargo run --example headless_bridge -- [hostname] [port]

use std::error::Error;

use vncbridge::{viewer_channel, Bridge, WireCommand};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let hostname = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1".to_string());
    let port = std::env::args().nth(2).unwrap_or_else(|| "5900".to_string());
    println!("Bridging VNC server at {hostname}:{port}...");

    let bridge = Bridge::new();
    let (socket, mut commands) = viewer_channel();
    let viewer = bridge
        .join(1, socket, &[("hostname", hostname.as_str()), ("port", port.as_str())])
        .await?;

    let mut frames = 0u64;
    while let Some(command) = commands.recv().await {
        match &command {
            WireCommand::Resize { width, height } => {
                println!("resize {width}x{height}");
            }
            WireCommand::Draw { x, y, width, height, pixels } => {
                println!("draw {width}x{height} at ({x},{y}) [{} bytes]", pixels.len());
            }
            WireCommand::Copy { src_x, src_y, width, height, dst_x, dst_y } => {
                println!("copy {width}x{height} ({src_x},{src_y}) -> ({dst_x},{dst_y})");
            }
            WireCommand::CursorArgb { width, height, .. } => {
                println!("cursor {width}x{height}");
            }
            WireCommand::Clipboard { text } => {
                println!("clipboard: {} chars", text.chars().count());
            }
            WireCommand::EndFrame => {
                frames += 1;
                if frames % 100 == 0 {
                    println!("{frames} frames");
                }
            }
            WireCommand::Abort { code, message } => {
                println!("session aborted ({}): {message}", code.code());
                break;
            }
            _ => {}
        }
    }

    bridge.leave(viewer).await;
    Ok(())
}
