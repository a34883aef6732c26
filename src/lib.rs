// Copyright 2026 the vncbridge authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! # vncbridge
//!
//! A session engine that bridges one upstream VNC (RFB) connection to any
//! number of downstream viewers of a remote-desktop gateway.
//!
//! The upstream side is a VNC client: the bridge connects to a VNC server
//! (directly, through a repeater, or by listening for a reverse connection),
//! negotiates a pixel format, and drains decoded framebuffer updates. The
//! downstream side is a stream of drawing commands: updates are translated
//! into a fixed 24/32-bit layout, composited into a shared display surface,
//! and flushed to every attached viewer at a paced frame rate that adapts to
//! how far behind the viewers are. Viewers that are not read-only feed mouse,
//! keyboard and clipboard events back onto the upstream socket.
//!
//! ## Quick Start
//!
//! ```no_run
//! use vncbridge::{viewer_channel, Bridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = Bridge::new();
//!
//!     // The gateway runtime drains `commands` onto the viewer's socket.
//!     let (socket, mut commands) = viewer_channel();
//!
//!     // The first viewer to join owns the upstream connection.
//!     let viewer = bridge
//!         .join(1, socket, &[("hostname", "127.0.0.1"), ("port", "5900")])
//!         .await?;
//!
//!     while let Some(command) = commands.recv().await {
//!         // Encode the command for the downstream protocol here.
//!         let _ = &command;
//!     }
//!
//!     bridge.leave(viewer).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   RFB    ┌─────────────────────────────────────┐
//! │  VNC server  ├─────────►│        upstream adapter (rfb)       │
//! └──────────────┘          │  decode events · forward input      │
//!        ▲                  └──────────────────┬──────────────────┘
//!        │ pointer/key/cut-text                │ typed events
//!        │                  ┌──────────────────▼──────────────────┐
//!        │                  │     frame-paced session (session)   │
//!        └──────────────────┤  translate pixels · pace frames     │
//!                           └──────────────────┬──────────────────┘
//!                                              │ draw/copy/cursor
//!                           ┌──────────────────▼──────────────────┐
//!                           │      shared display (display)       │
//!                           │  surface · cursor · dirty state     │
//!                           └──────┬──────────┬──────────┬────────┘
//!                                  ▼          ▼          ▼
//!                              Viewer 1   Viewer 2   Viewer N
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clipboard;
pub mod display;
pub mod error;
pub mod settings;
pub mod translate;
pub mod wire;

// Internal modules
mod rfb;
mod session;
mod viewer;

// Re-exports
pub use clipboard::{ClipboardEncoding, CLIPBOARD_MAX_LEN};
pub use display::{DirtyRegion, SharedDisplay};
pub use error::{AbortCode, BridgeError, Result};
pub use session::{CONNECT_INTERVAL, FRAME_DURATION, FRAME_START_TIMEOUT, FRAME_TIMEOUT};
pub use settings::Settings;
pub use translate::WireFormat;
pub use viewer::{Bridge, Viewer, ViewerRole};
pub use wire::{viewer_channel, ViewerSocket, WireCommand};
