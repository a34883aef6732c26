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


//! Shared display state: one surface and one cursor, many viewers.
//!
//! The session task is the only writer of surface content, so the surface
//! needs no locking against itself; the lock exists because viewers attach,
//! detach and replay (`dup_to`) concurrently. The cursor is different: it is
//! written both by the session task (cursor shapes from the server) and by
//! viewer tasks (mouse movement), so it synchronises internally. Contention
//! on it is bounded by human input rates.
//!
//! Surface mutations accumulate dirty state; nothing reaches a viewer socket
//! until [`SharedDisplay::surface_flush`] runs at a frame boundary. After a
//! flush, every attached viewer's command stream describes an image identical
//! to the surface.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use log::debug;
use tokio::sync::RwLock;

use crate::wire::{pack_words, ViewerSocket, WireCommand};

/// Maximum queued dirty rectangles before they collapse into one bounding
/// box. Matches the batching cap used by common server implementations.
const MAX_DIRTY_RECTS: usize = 50;

/// A modified rectangle awaiting flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegion {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl DirtyRegion {
    /// Creates a new region.
    #[must_use]
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    fn right(&self) -> u32 {
        u32::from(self.x) + u32::from(self.width)
    }

    fn bottom(&self) -> u32 {
        u32::from(self.y) + u32::from(self.height)
    }

    /// Whether two regions overlap.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        u32::from(self.x) < other.right()
            && u32::from(other.x) < self.right()
            && u32::from(self.y) < other.bottom()
            && u32::from(other.y) < self.bottom()
    }

    /// Smallest region covering both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self {
            x,
            y,
            width: (right - u32::from(x)) as u16,
            height: (bottom - u32::from(y)) as u16,
        }
    }
}

/// A queued intra-surface copy.
#[derive(Debug, Clone, Copy)]
struct CopyOp {
    src_x: u16,
    src_y: u16,
    width: u16,
    height: u16,
    dst_x: u16,
    dst_y: u16,
}

impl CopyOp {
    fn source(&self) -> DirtyRegion {
        DirtyRegion::new(self.src_x, self.src_y, self.width, self.height)
    }

    fn destination(&self) -> DirtyRegion {
        DirtyRegion::new(self.dst_x, self.dst_y, self.width, self.height)
    }
}

/// Surface content plus the per-frame dirty state.
struct SurfaceState {
    width: u16,
    height: u16,
    /// `0x00RRGGBB` words, row-major.
    pixels: Vec<u32>,
    dirty: Vec<DirtyRegion>,
    copies: Vec<CopyOp>,
    resized: bool,
}

impl SurfaceState {
    fn allocated(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Queues a dirty region, merging it into an overlapping one if present.
    fn push_dirty(&mut self, region: DirtyRegion) {
        if region.width == 0 || region.height == 0 {
            return;
        }
        for existing in &mut self.dirty {
            if existing.intersects(&region) {
                *existing = existing.union(&region);
                return;
            }
        }
        self.dirty.push(region);
        if self.dirty.len() > MAX_DIRTY_RECTS {
            let collapsed = self
                .dirty
                .drain(..)
                .reduce(|a, b| a.union(&b))
                .unwrap_or(region);
            self.dirty.push(collapsed);
        }
    }

    /// Clamps a region to the surface bounds.
    fn clip(&self, region: DirtyRegion) -> DirtyRegion {
        let x = region.x.min(self.width);
        let y = region.y.min(self.height);
        DirtyRegion {
            x,
            y,
            width: region.width.min(self.width - x),
            height: region.height.min(self.height - y),
        }
    }

    /// Extracts a rectangle of surface words as a wire payload.
    fn extract(&self, region: DirtyRegion) -> Bytes {
        let mut words = Vec::with_capacity(usize::from(region.width) * usize::from(region.height));
        for dy in 0..usize::from(region.height) {
            let start = (usize::from(region.y) + dy) * usize::from(self.width) + usize::from(region.x);
            words.extend_from_slice(&self.pixels[start..start + usize::from(region.width)]);
        }
        pack_words(&words)
    }
}

/// The shared cursor image, as replayed to late joiners.
#[derive(Debug, Clone)]
enum CursorShape {
    /// Built-in arrow cursor.
    Pointer,
    /// Built-in dot cursor.
    Dot,
    /// Server-provided ARGB image.
    Argb {
        hotspot_x: u16,
        hotspot_y: u16,
        width: u16,
        height: u16,
        pixels: Bytes,
    },
}

impl CursorShape {
    fn to_command(&self) -> WireCommand {
        match self {
            CursorShape::Pointer => WireCommand::CursorPointer,
            CursorShape::Dot => WireCommand::CursorDot,
            CursorShape::Argb { hotspot_x, hotspot_y, width, height, pixels } => {
                WireCommand::CursorArgb {
                    hotspot_x: *hotspot_x,
                    hotspot_y: *hotspot_y,
                    width: *width,
                    height: *height,
                    pixels: pixels.clone(),
                }
            }
        }
    }
}

/// Mouse state shared across viewers.
struct CursorState {
    x: i32,
    y: i32,
    button_mask: u8,
    /// Viewer whose mouse event set the current position.
    owner: Option<u64>,
    shape: Option<CursorShape>,
}

/// The display one session shares with all of its viewers.
pub struct SharedDisplay {
    state: RwLock<SurfaceState>,
    cursor: StdMutex<CursorState>,
    viewers: RwLock<HashMap<u64, ViewerSocket>>,
}

impl Default for SharedDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDisplay {
    /// Creates an unallocated display. Dimensions arrive with the upstream
    /// handshake.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SurfaceState {
                width: 0,
                height: 0,
                pixels: Vec::new(),
                dirty: Vec::new(),
                copies: Vec::new(),
                resized: false,
            }),
            cursor: StdMutex::new(CursorState {
                x: 0,
                y: 0,
                button_mask: 0,
                owner: None,
                shape: None,
            }),
            viewers: RwLock::new(HashMap::new()),
        }
    }

    /// Attaches a viewer's command channel.
    pub async fn attach(&self, viewer: u64, socket: ViewerSocket) {
        self.viewers.write().await.insert(viewer, socket);
    }

    /// Detaches a viewer and drops its cursor contribution.
    pub async fn detach(&self, viewer: u64) {
        self.viewers.write().await.remove(&viewer);
        self.cursor_remove_viewer(viewer);
    }

    /// Whether the surface has been allocated yet.
    pub async fn is_allocated(&self) -> bool {
        self.state.read().await.allocated()
    }

    /// Current surface dimensions.
    pub async fn dimensions(&self) -> (u16, u16) {
        let state = self.state.read().await;
        (state.width, state.height)
    }

    /// Initial allocation after the upstream handshake.
    pub async fn allocate(&self, width: u16, height: u16) {
        debug!("Allocating {width}x{height} display surface");
        self.resize(width, height).await;
    }

    /// Resizes the surface. Idempotent when the dimensions already match;
    /// otherwise the content is discarded, the whole surface is marked dirty,
    /// and every viewer sees the new dimensions on the next flush.
    pub async fn resize(&self, width: u16, height: u16) {
        let mut state = self.state.write().await;
        if state.width == width && state.height == height {
            return;
        }
        state.width = width;
        state.height = height;
        state.pixels = vec![0; usize::from(width) * usize::from(height)];
        state.copies.clear();
        state.dirty.clear();
        state.resized = true;
        state.push_dirty(DirtyRegion::new(0, 0, width, height));
    }

    /// Composites a rectangle of `0x00RRGGBB` words onto the surface.
    ///
    /// `stride` is the source row pitch in words. Out-of-bounds parts are
    /// clipped.
    pub async fn surface_draw(
        &self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        pixels: &[u32],
        stride: usize,
    ) {
        let mut state = self.state.write().await;
        if !state.allocated() || x >= state.width || y >= state.height {
            return;
        }
        let copy_w = usize::from(width.min(state.width - x));
        let copy_h = usize::from(height.min(state.height - y));
        let surface_w = usize::from(state.width);
        for dy in 0..copy_h {
            let src = dy * stride;
            let dst = (usize::from(y) + dy) * surface_w + usize::from(x);
            state.pixels[dst..dst + copy_w].copy_from_slice(&pixels[src..src + copy_w]);
        }
        state.push_dirty(DirtyRegion::new(x, y, copy_w as u16, copy_h as u16));
    }

    /// Copies a rectangle within the surface, source and destination may
    /// overlap.
    ///
    /// The copy is applied to the surface immediately and queued for the next
    /// flush as a wire copy. If the source region was itself modified earlier
    /// in this frame, viewers would copy stale content, so the destination is
    /// queued as a plain draw instead.
    pub async fn surface_copy(
        &self,
        src_x: u16,
        src_y: u16,
        width: u16,
        height: u16,
        dst_x: u16,
        dst_y: u16,
    ) {
        let mut state = self.state.write().await;
        if !state.allocated() {
            return;
        }
        let op = CopyOp { src_x, src_y, width, height, dst_x, dst_y };
        let src = state.clip(op.source());
        let dst = state.clip(op.destination());
        let copy_w = usize::from(src.width.min(dst.width));
        let copy_h = usize::from(src.height.min(dst.height));
        if copy_w == 0 || copy_h == 0 {
            return;
        }

        let surface_w = usize::from(state.width);
        let mut row = vec![0u32; copy_w];
        // Row order matters when the regions overlap vertically.
        let rows: Box<dyn Iterator<Item = usize>> = if dst_y > src_y {
            Box::new((0..copy_h).rev())
        } else {
            Box::new(0..copy_h)
        };
        for dy in rows {
            let from = (usize::from(src.y) + dy) * surface_w + usize::from(src.x);
            let to = (usize::from(dst.y) + dy) * surface_w + usize::from(dst.x);
            row.copy_from_slice(&state.pixels[from..from + copy_w]);
            state.pixels[to..to + copy_w].copy_from_slice(&row);
        }

        let dirty_source = state.dirty.iter().any(|r| r.intersects(&op.source()));
        if dirty_source {
            state.push_dirty(dst);
        } else {
            state.copies.push(CopyOp {
                width: copy_w as u16,
                height: copy_h as u16,
                ..op
            });
        }
    }

    /// Emits the accumulated dirty state to every attached viewer.
    pub async fn surface_flush(&self) {
        let mut state = self.state.write().await;
        if !state.allocated() {
            return;
        }

        let mut commands = Vec::new();
        if state.resized {
            state.resized = false;
            commands.push(WireCommand::Resize { width: state.width, height: state.height });
        }
        for op in std::mem::take(&mut state.copies) {
            commands.push(WireCommand::Copy {
                src_x: op.src_x,
                src_y: op.src_y,
                width: op.width,
                height: op.height,
                dst_x: op.dst_x,
                dst_y: op.dst_y,
            });
        }
        for region in std::mem::take(&mut state.dirty) {
            let region = state.clip(region);
            if region.width == 0 || region.height == 0 {
                continue;
            }
            commands.push(WireCommand::Draw {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                pixels: state.extract(region),
            });
        }
        drop(state);

        if commands.is_empty() {
            return;
        }
        let viewers = self.viewers.read().await;
        for socket in viewers.values() {
            for command in &commands {
                let _ = socket.send(command.clone());
            }
        }
    }

    /// Sends one command to every attached viewer.
    pub async fn broadcast(&self, command: WireCommand) {
        let viewers = self.viewers.read().await;
        for socket in viewers.values() {
            let _ = socket.send(command.clone());
        }
    }

    /// Replays the current surface and cursor onto one viewer's socket, as a
    /// complete frame. Used when a guest joins an existing session.
    ///
    /// Returns `false` without sending anything when the surface has not been
    /// allocated yet; the joiner then receives the full first frame through
    /// the ordinary flush path once the upstream handshake completes.
    pub async fn dup_to(&self, socket: &ViewerSocket) -> bool {
        let state = self.state.read().await;
        if !state.allocated() {
            return false;
        }
        let full = DirtyRegion::new(0, 0, state.width, state.height);
        let _ = socket.send(WireCommand::Resize { width: state.width, height: state.height });
        let _ = socket.send(WireCommand::Draw {
            x: 0,
            y: 0,
            width: state.width,
            height: state.height,
            pixels: state.extract(full),
        });
        drop(state);

        let shape = self.cursor.lock().unwrap().shape.clone();
        if let Some(shape) = shape {
            let _ = socket.send(shape.to_command());
        }
        let _ = socket.send(WireCommand::EndFrame);
        let _ = socket.send(WireCommand::Flush);
        true
    }

    /// Replaces the cursor with a server-provided ARGB image and pushes it to
    /// all viewers.
    pub async fn cursor_set_argb(
        &self,
        hotspot_x: u16,
        hotspot_y: u16,
        width: u16,
        height: u16,
        pixels: &[u32],
    ) {
        let shape = CursorShape::Argb {
            hotspot_x,
            hotspot_y,
            width,
            height,
            pixels: pack_words(pixels),
        };
        let command = shape.to_command();
        self.cursor.lock().unwrap().shape = Some(shape);
        self.broadcast(command).await;
    }

    /// Switches to the built-in arrow cursor.
    pub async fn cursor_set_pointer(&self) {
        self.cursor.lock().unwrap().shape = Some(CursorShape::Pointer);
        self.broadcast(WireCommand::CursorPointer).await;
    }

    /// Switches to the built-in dot cursor. Used when the server renders the
    /// real cursor into the framebuffer.
    pub async fn cursor_set_dot(&self) {
        self.cursor.lock().unwrap().shape = Some(CursorShape::Dot);
        self.broadcast(WireCommand::CursorDot).await;
    }

    /// Records the latest mouse state from a viewer.
    pub fn cursor_update(&self, viewer: u64, x: i32, y: i32, button_mask: u8) {
        let mut cursor = self.cursor.lock().unwrap();
        cursor.x = x;
        cursor.y = y;
        cursor.button_mask = button_mask;
        cursor.owner = Some(viewer);
    }

    /// Drops a leaving viewer's contribution to the cursor state.
    pub fn cursor_remove_viewer(&self, viewer: u64) {
        let mut cursor = self.cursor.lock().unwrap();
        if cursor.owner == Some(viewer) {
            cursor.owner = None;
            cursor.button_mask = 0;
        }
    }

    /// Current cursor position, button mask and owning viewer.
    pub fn cursor_position(&self) -> (i32, i32, u8, Option<u64>) {
        let cursor = self.cursor.lock().unwrap();
        (cursor.x, cursor.y, cursor.button_mask, cursor.owner)
    }
}
