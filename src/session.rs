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


//! The frame-paced session loop.
//!
//! One task per session drains decoded upstream messages, groups them into
//! viewer-visible frames, and flushes the shared display at frame boundaries.
//! Pacing adapts in two directions: a frame closes once its time budget
//! ([`FRAME_DURATION`]) is spent, but when downstream viewers report
//! processing lag the frame is stretched instead, which both batches more
//! server data into one frame and gives the viewers time to catch up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::display::SharedDisplay;
use crate::error::{AbortCode, BridgeError, Result};
use crate::rfb::{self, InputEvent, UpstreamEvent};
use crate::settings::Settings;
use crate::translate;
use crate::wire::WireCommand;

/// Target frame period.
pub const FRAME_DURATION: Duration = Duration::from_millis(40);

/// Maximum idle wait for the start of a new frame.
pub const FRAME_START_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wait for further data while a frame is open and viewers are keeping up.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(0);

/// Back-off between initial connect attempts.
pub const CONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// One upstream VNC connection and the state shared with its viewers.
pub struct Session {
    display: Arc<SharedDisplay>,
    settings: Settings,
    running: AtomicBool,
    processing_lag_ms: AtomicU64,
    /// Set by the CopyRect handler; the next update event is the library's
    /// redundant redraw of the copied region and is suppressed.
    copy_rect_used: AtomicBool,
    /// Present only while the upstream connection is up. Input arriving
    /// before that is silently dropped.
    input: StdRwLock<Option<mpsc::UnboundedSender<InputEvent>>>,
    /// Most recent inbound clipboard text, replayed to late joiners.
    clipboard_text: StdMutex<Option<String>>,
}

impl Session {
    /// Creates the session for an owner viewer's settings. The loop itself
    /// starts when [`Session::run`] is spawned.
    pub(crate) fn new(settings: Settings, display: Arc<SharedDisplay>) -> Arc<Self> {
        Arc::new(Self {
            display,
            settings,
            running: AtomicBool::new(true),
            processing_lag_ms: AtomicU64::new(0),
            copy_rect_used: AtomicBool::new(false),
            input: StdRwLock::new(None),
            clipboard_text: StdMutex::new(None),
        })
    }

    /// Requests shutdown. The loop observes the flag at its next iteration
    /// boundary; an unfinished frame drops its accumulated dirty state.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the session loop should keep running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Updates the gateway's measure of how far downstream viewers are
    /// behind, in milliseconds.
    pub fn set_processing_lag(&self, lag_ms: u64) {
        self.processing_lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    /// Latest clipboard text received from the server, if any.
    pub fn latest_clipboard(&self) -> Option<String> {
        self.clipboard_text.lock().unwrap().clone()
    }

    /// Forwards a pointer event upstream. Dropped while no connection exists.
    pub(crate) fn send_pointer(&self, x: u16, y: u16, button_mask: u8) {
        self.send_input(InputEvent::Pointer { x, y, button_mask });
    }

    /// Forwards a key event upstream. Dropped while no connection exists.
    pub(crate) fn send_key(&self, keysym: u32, pressed: bool) {
        self.send_input(InputEvent::Key { keysym, pressed });
    }

    /// Encodes viewer clipboard text and forwards it upstream.
    pub(crate) fn send_clipboard(&self, text: &str) {
        let encoded = self.settings.clipboard_encoding.encode(text);
        let text = match String::from_utf8(encoded) {
            Ok(text) => text,
            Err(err) => {
                // The library's cut-text call only carries UTF-8; bytes the
                // configured encoding produced outside it get substituted.
                warn!(
                    "Outbound clipboard not representable in {}; sending lossy text",
                    self.settings.clipboard_encoding.name()
                );
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        };
        self.send_input(InputEvent::CutText(text));
    }

    fn send_input(&self, event: InputEvent) {
        match self.input.read().unwrap().as_ref() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!("Dropping input event; upstream not connected"),
        }
    }

    fn install_input(&self, tx: Option<mpsc::UnboundedSender<InputEvent>>) {
        *self.input.write().unwrap() = tx;
    }

    /// Runs the session to completion: connect with retries, pace frames,
    /// tear down.
    pub(crate) async fn run(self: Arc<Self>) {
        match self.connect_upstream().await {
            Ok(mut upstream) => {
                self.install_input(Some(upstream.input.clone()));
                if self.settings.remote_cursor {
                    self.display.cursor_set_dot().await;
                } else {
                    self.display.cursor_set_pointer().await;
                }
                let _ = upstream.input.send(InputEvent::Refresh);

                self.frame_loop(&mut upstream.events, &upstream.input).await;

                self.install_input(None);
                upstream.close().await;
                info!("Upstream connection closed, session ended");
            }
            Err(e) => {
                error!("Unable to reach upstream server: {e}");
                self.abort(AbortCode::UpstreamNotFound, "Unable to reach VNC server.")
                    .await;
            }
        }
        self.running.store(false, Ordering::Release);
    }

    /// Attempts the upstream connection, retrying on a fixed back-off.
    async fn connect_upstream(&self) -> Result<rfb::Upstream> {
        let attempts = self.settings.retries + 1;
        for attempt in 1..=attempts {
            if !self.is_running() {
                return Err(BridgeError::Disconnected);
            }
            match rfb::connect(&self.settings).await {
                Ok(upstream) => return Ok(upstream),
                Err(e) => {
                    warn!("Connect attempt {attempt}/{attempts} failed: {e}");
                    if attempt < attempts {
                        sleep(CONNECT_INTERVAL).await;
                    }
                }
            }
        }
        Err(BridgeError::UpstreamUnreachable { attempts })
    }

    /// The paced message loop. Exits when the session stops or the upstream
    /// event channel closes.
    async fn frame_loop(
        &self,
        events: &mut mpsc::UnboundedReceiver<UpstreamEvent>,
        input: &mpsc::UnboundedSender<InputEvent>,
    ) {
        let mut last_frame_end = Instant::now();

        while self.is_running() {
            match timeout(FRAME_START_TIMEOUT, events.recv()).await {
                // Idle; fall through and deliver an (empty) frame boundary.
                Err(_) => {}

                Ok(None) => {
                    self.abort(AbortCode::UpstreamError, "Connection closed.").await;
                    break;
                }

                Ok(Some(event)) => {
                    let frame_start = Instant::now();
                    let processing_lag =
                        Duration::from_millis(self.processing_lag_ms.load(Ordering::Relaxed));
                    if !self.handle_event(event).await {
                        break;
                    }

                    let mut channel_closed = false;
                    loop {
                        let frame_end = Instant::now();
                        let frame_remaining =
                            (frame_start + FRAME_DURATION).saturating_duration_since(frame_end);
                        let time_elapsed = frame_end.saturating_duration_since(last_frame_end);
                        let required_wait = processing_lag.saturating_sub(time_elapsed);

                        let wait_for = if required_wait > FRAME_TIMEOUT {
                            // Viewers are behind; stretch the frame. The wait
                            // both batches more server data and lets the
                            // viewers drain their queues.
                            required_wait
                        } else if !frame_remaining.is_zero() {
                            FRAME_TIMEOUT
                        } else {
                            break;
                        };

                        match timeout(wait_for, events.recv()).await {
                            Err(_) => break,
                            Ok(None) => {
                                channel_closed = true;
                                break;
                            }
                            Ok(Some(event)) => {
                                if !self.handle_event(event).await {
                                    break;
                                }
                            }
                        }
                    }

                    // The previous frame's *start* time deliberately becomes
                    // the baseline: server-side rendering time is assumed
                    // stable across adjacent frames, and excluding it keeps
                    // slow-frame spikes from compounding.
                    last_frame_end = frame_start;

                    if channel_closed {
                        self.abort(AbortCode::UpstreamError, "Connection closed.").await;
                        break;
                    }
                    if !self.is_running() {
                        break;
                    }
                }
            }

            self.display.surface_flush().await;
            self.display.broadcast(WireCommand::EndFrame).await;
            self.display.broadcast(WireCommand::Flush).await;
            let _ = input.send(InputEvent::Refresh);
        }
    }

    /// Applies one upstream event to the shared display. Returns `false`
    /// after aborting the session on a fatal error.
    async fn handle_event(&self, event: UpstreamEvent) -> bool {
        match event {
            UpstreamEvent::Resize { width, height } => {
                self.display.resize(width, height).await;
                true
            }

            UpstreamEvent::Update { x, y, width, height, data, format } => {
                if self.copy_rect_used.swap(false, Ordering::AcqRel) {
                    // The copy handler already drew this region.
                    return true;
                }
                if let Err(e) = format.validate() {
                    self.abort(AbortCode::UpstreamError, &format!("Bad pixel format: {e}"))
                        .await;
                    return false;
                }
                let stride = usize::from(width) * format.bytes_per_pixel;
                match translate::rect_to_rgb(
                    &data,
                    usize::from(width),
                    usize::from(height),
                    stride,
                    &format,
                    self.settings.swap_red_blue,
                ) {
                    Ok(words) => {
                        self.display
                            .surface_draw(x, y, width, height, &words, usize::from(width))
                            .await;
                        true
                    }
                    Err(e) => {
                        self.abort(
                            AbortCode::UpstreamError,
                            &format!("Pixel translation failed: {e}"),
                        )
                        .await;
                        false
                    }
                }
            }

            UpstreamEvent::CopyRect { src_x, src_y, width, height, dst_x, dst_y } => {
                self.display
                    .surface_copy(src_x, src_y, width, height, dst_x, dst_y)
                    .await;
                self.copy_rect_used.store(true, Ordering::Release);
                true
            }

            UpstreamEvent::CursorShape {
                hotspot_x,
                hotspot_y,
                width,
                height,
                pixels,
                mask,
                format,
            } => {
                match translate::cursor_to_argb(
                    &pixels,
                    &mask,
                    usize::from(width),
                    usize::from(height),
                    &format,
                    self.settings.swap_red_blue,
                ) {
                    Ok(words) => {
                        self.display
                            .cursor_set_argb(hotspot_x, hotspot_y, width, height, &words)
                            .await;
                    }
                    // A malformed cursor is not worth the session.
                    Err(e) => warn!("Ignoring cursor shape: {e}"),
                }
                true
            }

            UpstreamEvent::Clipboard(bytes) => {
                let text = self.settings.clipboard_encoding.decode(&bytes);
                *self.clipboard_text.lock().unwrap() = Some(text.clone());
                self.display.broadcast(WireCommand::Clipboard { text }).await;
                true
            }

            UpstreamEvent::Bell => {
                debug!("Bell from upstream server");
                true
            }
        }
    }

    /// Terminates the session, notifying every viewer.
    async fn abort(&self, code: AbortCode, message: &str) {
        error!("Session aborted ({code:?}): {message}");
        self.display
            .broadcast(WireCommand::Abort { code, message: message.to_string() })
            .await;
        self.running.store(false, Ordering::Release);
    }
}
