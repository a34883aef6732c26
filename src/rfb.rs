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


//! Upstream RFB adapter.
//!
//! Wraps the `vnc` client library: builds the connection (direct, reverse, or
//! through a repeater), requests the pixel format and encodings derived from
//! the settings, and then pumps the library's event stream into a typed
//! channel the session loop consumes. Input travels the other way through a
//! single forwarder task, which serialises all calls into the library.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use vnc::{PixelFormat, VncClient, VncConnector, VncEncoding, VncEvent, X11Event};

use crate::error::{BridgeError, Result};
use crate::settings::Settings;
use crate::translate::WireFormat;

/// Size of the destination block exchanged with a VNC repeater before the
/// RFB handshake starts.
const REPEATER_DEST_LEN: usize = 250;

/// One decoded message from the upstream server.
///
/// The library has already done the wire decoding; pixel payloads are still
/// in the negotiated wire format and carry the format that was in effect when
/// they were produced, so translation never races a renegotiation.
#[derive(Debug)]
pub(crate) enum UpstreamEvent {
    /// The framebuffer changed dimensions (including the initial size).
    Resize {
        width: u16,
        height: u16,
    },
    /// A decoded framebuffer rectangle.
    Update {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        data: Vec<u8>,
        format: WireFormat,
    },
    /// An intra-framebuffer copy.
    CopyRect {
        src_x: u16,
        src_y: u16,
        width: u16,
        height: u16,
        dst_x: u16,
        dst_y: u16,
    },
    /// A new cursor image. `mask` is 1 bit per pixel, MSB first,
    /// `(width + 7) / 8` bytes per row.
    CursorShape {
        hotspot_x: u16,
        hotspot_y: u16,
        width: u16,
        height: u16,
        pixels: Vec<u8>,
        mask: Vec<u8>,
        format: WireFormat,
    },
    /// Cut text from the server, still in the server's clipboard encoding.
    Clipboard(Vec<u8>),
    /// Bell request.
    Bell,
}

/// Input travelling from viewers to the upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InputEvent {
    Pointer { x: u16, y: u16, button_mask: u8 },
    Key { keysym: u32, pressed: bool },
    CutText(String),
    /// Ask the server for the next incremental framebuffer update.
    Refresh,
}

/// A live upstream connection: the event stream, the input channel, and the
/// tasks that service both.
pub(crate) struct Upstream {
    /// Decoded server messages, in arrival order. The channel closes when the
    /// connection dies.
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
    /// Input events to forward to the server.
    pub input: mpsc::UnboundedSender<InputEvent>,
    client: Arc<VncClient>,
    pump: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream").finish_non_exhaustive()
    }
}

impl Upstream {
    /// Shuts the connection down and stops both service tasks.
    pub async fn close(self) {
        self.pump.abort();
        self.forwarder.abort();
        if let Err(e) = self.client.close().await {
            debug!("Upstream close: {e}");
        }
    }
}

/// Establishes one upstream connection per the settings.
///
/// Sequence: TCP (direct dial, or reverse listen for up to `listen_timeout`
/// milliseconds), optional repeater destination block, then the RFB handshake
/// requesting the pixel format for the configured colour depth and the
/// configured encodings. Retry policy lives in the session, not here.
pub(crate) async fn connect(settings: &Settings) -> Result<Upstream> {
    let mut stream = establish_tcp(settings).await?;

    if let Some(dest_host) = &settings.dest_host {
        let dest_port = settings.dest_port.unwrap_or(settings.port);
        write_repeater_dest(&mut stream, dest_host, dest_port).await?;
    }

    let (requested, wire_format) = requested_format(settings.color_depth)?;
    let password = settings.password.clone().unwrap_or_default();

    let mut connector = VncConnector::new(stream)
        .set_auth_method(async move { Ok(password) })
        .allow_shared(true)
        .set_pixel_format(requested);
    for encoding in encoding_prefs(settings) {
        connector = connector.add_encoding(encoding);
    }

    let client = connector.build()?.try_start().await?.finish()?;
    let client = Arc::new(client);
    info!(
        "Upstream connection established ({} bpp requested)",
        settings.color_depth
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let pump = spawn_pump(client.clone(), event_tx, wire_format);
    let forwarder = spawn_forwarder(client.clone(), input_rx);

    Ok(Upstream {
        events: event_rx,
        input: input_tx,
        client,
        pump,
        forwarder,
    })
}

/// Opens the TCP stream, dialing out or listening for a reverse connection.
async fn establish_tcp(settings: &Settings) -> Result<TcpStream> {
    if settings.reverse_connect {
        let listener = TcpListener::bind(("0.0.0.0", settings.listen_port)).await?;
        info!(
            "Listening on port {} for a reverse VNC connection",
            settings.listen_port
        );
        match timeout(Duration::from_millis(settings.listen_timeout), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!("Reverse VNC connection from {peer}");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BridgeError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "no reverse connection within {} ms",
                    settings.listen_timeout
                ),
            ))),
        }
    } else {
        Ok(TcpStream::connect((settings.hostname.as_str(), settings.port)).await?)
    }
}

/// Sends the zero-padded destination block a VNC repeater expects before the
/// protocol handshake.
async fn write_repeater_dest(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let dest = format!("{host}:{port}");
    if dest.len() >= REPEATER_DEST_LEN {
        return Err(BridgeError::Config(format!(
            "repeater destination \"{dest}\" too long"
        )));
    }
    let mut block = [0u8; REPEATER_DEST_LEN];
    block[..dest.len()].copy_from_slice(dest.as_bytes());
    stream.write_all(&block).await?;
    info!("Sent repeater destination {dest}");
    Ok(())
}

/// Builds the pixel format to request for a colour depth, together with the
/// matching translator descriptor.
///
/// The server may still report its own format after the handshake; the pump
/// tracks whatever format is actually in effect.
fn requested_format(color_depth: u8) -> Result<(PixelFormat, WireFormat)> {
    let (bpp, depth, rmax, gmax, bmax, rsh, gsh, bsh): (u8, u8, u16, u16, u16, u8, u8, u8) =
        match color_depth {
            8 => (8, 8, 7, 7, 3, 0, 3, 6),
            16 => (16, 16, 31, 63, 31, 11, 5, 0),
            _ => (32, 24, 255, 255, 255, 16, 8, 0),
        };

    let mut raw = [0u8; 16];
    raw[0] = bpp;
    raw[1] = depth;
    raw[2] = 0; // little-endian
    raw[3] = 1; // true colour
    raw[4..6].copy_from_slice(&rmax.to_be_bytes());
    raw[6..8].copy_from_slice(&gmax.to_be_bytes());
    raw[8..10].copy_from_slice(&bmax.to_be_bytes());
    raw[10] = rsh;
    raw[11] = gsh;
    raw[12] = bsh;

    let requested = PixelFormat::try_from(raw)?;
    let wire_format = wire_format_of(&requested)?;
    Ok((requested, wire_format))
}

/// Derives the translator descriptor from a library pixel format.
fn wire_format_of(format: &PixelFormat) -> Result<WireFormat> {
    let wire_format = WireFormat {
        bytes_per_pixel: usize::from(format.bits_per_pixel / 8).max(1),
        big_endian: format.big_endian_flag != 0,
        red_shift: format.red_shift,
        green_shift: format.green_shift,
        blue_shift: format.blue_shift,
        red_max: format.red_max,
        green_max: format.green_max,
        blue_max: format.blue_max,
    };
    wire_format.validate()?;
    Ok(wire_format)
}

/// Resolves the encoding preference list for the handshake.
fn encoding_prefs(settings: &Settings) -> Vec<VncEncoding> {
    let mut encodings = match settings.encodings.as_deref() {
        Some(list) => parse_encodings(list),
        None => Vec::new(),
    };
    if encodings.is_empty() {
        encodings = vec![
            VncEncoding::Tight,
            VncEncoding::Zrle,
            VncEncoding::CopyRect,
            VncEncoding::Raw,
        ];
    }
    if !settings.remote_cursor {
        encodings.push(VncEncoding::CursorPseudo);
    }
    encodings.push(VncEncoding::DesktopSizePseudo);
    encodings
}

/// Parses a comma or space separated encoding preference string. Unknown
/// names are skipped with a warning.
fn parse_encodings(list: &str) -> Vec<VncEncoding> {
    list.split([',', ' '])
        .filter(|name| !name.is_empty())
        .filter_map(|name| match name.to_ascii_lowercase().as_str() {
            "raw" => Some(VncEncoding::Raw),
            "copyrect" => Some(VncEncoding::CopyRect),
            "tight" => Some(VncEncoding::Tight),
            "trle" => Some(VncEncoding::Trle),
            "zrle" => Some(VncEncoding::Zrle),
            other => {
                warn!("Ignoring unsupported encoding \"{other}\"");
                None
            }
        })
        .collect()
}

/// Pumps library events into the session's typed channel. Dropping the sender
/// on exit is how the session learns the connection died.
fn spawn_pump(
    client: Arc<VncClient>,
    tx: mpsc::UnboundedSender<UpstreamEvent>,
    initial_format: WireFormat,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut format = initial_format;
        loop {
            match client.poll_event().await {
                Ok(Some(event)) => {
                    if !forward_event(&tx, &mut format, event) {
                        break;
                    }
                }
                Ok(None) => tokio::task::yield_now().await,
                Err(e) => {
                    debug!("Upstream event stream ended: {e}");
                    break;
                }
            }
        }
    })
}

/// Converts one library event. Returns `false` once the session side is gone.
fn forward_event(
    tx: &mpsc::UnboundedSender<UpstreamEvent>,
    format: &mut WireFormat,
    event: VncEvent,
) -> bool {
    let sent = match event {
        VncEvent::SetResolution(screen) => tx.send(UpstreamEvent::Resize {
            width: screen.width,
            height: screen.height,
        }),
        VncEvent::SetPixelFormat(reported) => {
            // The server refused the requested format; translate with the one
            // it actually uses from here on.
            match wire_format_of(&reported) {
                Ok(reported) => *format = reported,
                Err(e) => warn!("Ignoring unusable reported pixel format: {e}"),
            }
            Ok(())
        }
        VncEvent::RawImage(rect, data) => tx.send(UpstreamEvent::Update {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            data,
            format: *format,
        }),
        VncEvent::Copy(dst, src) => tx.send(UpstreamEvent::CopyRect {
            src_x: src.x,
            src_y: src.y,
            width: dst.width,
            height: dst.height,
            dst_x: dst.x,
            dst_y: dst.y,
        }),
        VncEvent::SetCursor(rect, pixels) => {
            let mask = mask_from_pixels(&pixels, rect.width, rect.height, format);
            tx.send(UpstreamEvent::CursorShape {
                hotspot_x: rect.x,
                hotspot_y: rect.y,
                width: rect.width,
                height: rect.height,
                pixels,
                mask,
                format: *format,
            })
        }
        VncEvent::Text(text) => tx.send(UpstreamEvent::Clipboard(text.into_bytes())),
        VncEvent::Bell => tx.send(UpstreamEvent::Bell),
        other => {
            debug!("Ignoring upstream event {other:?}");
            Ok(())
        }
    };
    sent.is_ok()
}

/// Index of the pixel byte carrying no colour channel, if there is one.
/// For the usual little-endian 32bpp RGB layout this is byte 3.
fn spare_byte_index(format: &WireFormat) -> Option<usize> {
    let channel_bits = (u32::from(format.red_max) << format.red_shift)
        | (u32::from(format.green_max) << format.green_shift)
        | (u32::from(format.blue_max) << format.blue_shift);
    (0..4).find_map(|byte| {
        if channel_bits & (0xFF << (byte * 8)) == 0 {
            Some(if format.big_endian { 3 - byte } else { byte })
        } else {
            None
        }
    })
}

/// Reconstructs the 1-bit cursor transparency mask.
///
/// The library folds the wire mask into the spare byte of each 32bpp cursor
/// pixel. A cursor whose spare bytes are all zero carried no transparency
/// information, as do sub-32bpp formats with no spare byte; those cursors are
/// treated as fully opaque.
fn mask_from_pixels(pixels: &[u8], width: u16, height: u16, format: &WireFormat) -> Vec<u8> {
    let w = usize::from(width);
    let h = usize::from(height);
    let stride = (w + 7) / 8;
    let opaque = vec![0xFF; stride * h];

    if format.bytes_per_pixel != 4 {
        return opaque;
    }
    let Some(spare) = spare_byte_index(format) else {
        return opaque;
    };

    let mut mask = vec![0u8; stride * h];
    let mut any_opaque = false;
    for y in 0..h {
        for x in 0..w {
            let index = (y * w + x) * 4 + spare;
            if pixels.get(index).copied().unwrap_or(0) != 0 {
                mask[y * stride + x / 8] |= 0x80 >> (x % 8);
                any_opaque = true;
            }
        }
    }
    if any_opaque {
        mask
    } else {
        opaque
    }
}

/// Maps an input event onto the library call and forwards it. One task per
/// connection, so every call into the library is serialised.
fn spawn_forwarder(
    client: Arc<VncClient>,
    mut rx: mpsc::UnboundedReceiver<InputEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let x11 = match event {
                InputEvent::Pointer { x, y, button_mask } => {
                    X11Event::PointerEvent((x, y, button_mask).into())
                }
                InputEvent::Key { keysym, pressed } => X11Event::KeyEvent((keysym, pressed).into()),
                InputEvent::CutText(text) => X11Event::CopyText(text),
                InputEvent::Refresh => X11Event::Refresh,
            };
            if let Err(e) = client.input(x11).await {
                debug!("Input forwarding stopped: {e}");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_format_depth_table() {
        let (_, wf8) = requested_format(8).unwrap();
        assert_eq!(wf8.bytes_per_pixel, 1);
        assert_eq!((wf8.red_shift, wf8.red_max), (0, 7));
        assert_eq!((wf8.green_shift, wf8.green_max), (3, 7));
        assert_eq!((wf8.blue_shift, wf8.blue_max), (6, 3));

        let (_, wf16) = requested_format(16).unwrap();
        assert_eq!(wf16.bytes_per_pixel, 2);
        assert_eq!((wf16.red_shift, wf16.red_max), (11, 31));
        assert_eq!((wf16.green_shift, wf16.green_max), (5, 63));
        assert_eq!((wf16.blue_shift, wf16.blue_max), (0, 31));

        for depth in [24, 32] {
            let (_, wf) = requested_format(depth).unwrap();
            assert_eq!(wf.bytes_per_pixel, 4);
            assert_eq!((wf.red_shift, wf.red_max), (16, 255));
            assert_eq!((wf.green_shift, wf.green_max), (8, 255));
            assert_eq!((wf.blue_shift, wf.blue_max), (0, 255));
            assert!(!wf.big_endian);
        }
    }

    #[test]
    fn test_parse_encodings_skips_unknown() {
        let parsed = parse_encodings("zrle,ultra copyrect,raw");
        assert_eq!(
            parsed,
            vec![VncEncoding::Zrle, VncEncoding::CopyRect, VncEncoding::Raw]
        );
    }

    #[test]
    fn test_encoding_prefs_respect_remote_cursor() {
        let mut settings = Settings::default();
        let with_cursor = encoding_prefs(&settings);
        assert!(with_cursor.contains(&VncEncoding::CursorPseudo));
        assert!(with_cursor.contains(&VncEncoding::DesktopSizePseudo));

        settings.remote_cursor = true;
        let without_cursor = encoding_prefs(&settings);
        assert!(!without_cursor.contains(&VncEncoding::CursorPseudo));
        assert!(without_cursor.contains(&VncEncoding::DesktopSizePseudo));
    }

    #[test]
    fn test_spare_byte_index_rgb888() {
        let (_, wf) = requested_format(32).unwrap();
        assert_eq!(spare_byte_index(&wf), Some(3));

        let (_, wf16) = requested_format(16).unwrap();
        assert_eq!(spare_byte_index(&wf16), None);
    }

    #[test]
    fn test_mask_from_pixels_uses_spare_byte() {
        let (_, wf) = requested_format(32).unwrap();
        // Two pixels: first opaque (spare byte 0xFF), second transparent.
        let pixels = [0x10, 0x20, 0x30, 0xFF, 0x40, 0x50, 0x60, 0x00];
        let mask = mask_from_pixels(&pixels, 2, 1, &wf);
        assert_eq!(mask, vec![0b1000_0000]);
    }

    #[test]
    fn test_mask_from_pixels_all_zero_is_opaque() {
        let (_, wf) = requested_format(32).unwrap();
        let pixels = [0x10, 0x20, 0x30, 0x00, 0x40, 0x50, 0x60, 0x00];
        assert_eq!(mask_from_pixels(&pixels, 2, 1, &wf), vec![0xFF]);
    }

    #[test]
    fn test_mask_from_pixels_sub32bpp_is_opaque() {
        let (_, wf) = requested_format(16).unwrap();
        let pixels = [0u8; 4];
        assert_eq!(mask_from_pixels(&pixels, 2, 1, &wf), vec![0xFF]);
    }

    #[tokio::test]
    async fn test_reverse_listen_times_out() {
        let settings = Settings {
            reverse_connect: true,
            listen_port: 0,
            listen_timeout: 50,
            ..Settings::default()
        };
        let err = establish_tcp(&settings).await.unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
