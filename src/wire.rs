//! Downstream drawing commands consumed by the gateway runtime.
//!
//! The bridge does not speak the downstream wire protocol itself. Each viewer
//! hands the bridge an unbounded channel at attach time; the bridge writes
//! [`WireCommand`]s into it and the gateway runtime drains them onto the real
//! socket. Writes to a given viewer's channel are strictly ordered, which is
//! all the frame model requires.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::AbortCode;

/// Sending half of a viewer's command stream.
pub type ViewerSocket = mpsc::UnboundedSender<WireCommand>;

/// Creates a connected command channel for one viewer.
///
/// The sender is passed to [`Bridge::join`](crate::Bridge::join); the gateway
/// runtime keeps the receiver and serialises the commands onto the viewer's
/// downstream socket.
#[must_use]
pub fn viewer_channel() -> (ViewerSocket, mpsc::UnboundedReceiver<WireCommand>) {
    mpsc::unbounded_channel()
}

/// A single drawing or control command for one viewer's socket.
///
/// Pixel payloads are packed 32-bit words in little-endian byte order,
/// row-major with no padding between rows: `0x00RRGGBB` for surface content
/// and `0xAARRGGBB` for cursor images.
#[derive(Debug, Clone)]
pub enum WireCommand {
    /// The display surface changed dimensions.
    Resize {
        /// New surface width in pixels.
        width: u16,
        /// New surface height in pixels.
        height: u16,
    },

    /// Composite a rectangle of pixels onto the surface.
    Draw {
        /// X coordinate of the destination rectangle.
        x: u16,
        /// Y coordinate of the destination rectangle.
        y: u16,
        /// Rectangle width in pixels.
        width: u16,
        /// Rectangle height in pixels.
        height: u16,
        /// Packed `0x00RRGGBB` words, 4 bytes per pixel.
        pixels: Bytes,
    },

    /// Copy a rectangle from one surface location to another.
    Copy {
        /// Source rectangle X coordinate.
        src_x: u16,
        /// Source rectangle Y coordinate.
        src_y: u16,
        /// Rectangle width in pixels.
        width: u16,
        /// Rectangle height in pixels.
        height: u16,
        /// Destination X coordinate.
        dst_x: u16,
        /// Destination Y coordinate.
        dst_y: u16,
    },

    /// Replace the cursor with an ARGB image.
    CursorArgb {
        /// Cursor hotspot X, relative to the image's top-left corner.
        hotspot_x: u16,
        /// Cursor hotspot Y, relative to the image's top-left corner.
        hotspot_y: u16,
        /// Cursor image width in pixels.
        width: u16,
        /// Cursor image height in pixels.
        height: u16,
        /// Packed `0xAARRGGBB` words, 4 bytes per pixel.
        pixels: Bytes,
    },

    /// Switch to the built-in arrow cursor.
    CursorPointer,

    /// Switch to the built-in dot cursor.
    CursorDot,

    /// Clipboard text received from the upstream server, as UTF-8.
    Clipboard {
        /// Clipboard contents.
        text: String,
    },

    /// Delimits the commands of one frame.
    EndFrame,

    /// Flush the viewer's downstream socket.
    Flush,

    /// The session died; the viewer connection must be terminated.
    Abort {
        /// Machine-readable status code.
        code: AbortCode,
        /// Human-readable reason.
        message: String,
    },
}

/// Packs translated pixel words into the little-endian byte payload carried
/// by [`WireCommand::Draw`] and [`WireCommand::CursorArgb`].
#[must_use]
pub fn pack_words(words: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(words.len() * 4);
    for &word in words {
        buf.put_u32_le(word);
    }
    buf.freeze()
}
