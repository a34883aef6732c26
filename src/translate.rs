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


//! Pixel format translation from the upstream wire format to downstream words.
//!
//! The upstream server delivers framebuffer rectangles in whatever true-colour
//! layout was negotiated during the handshake: 1, 2 or 4 bytes per pixel, any
//! per-channel shift and maximum, either byte order. Downstream viewers only
//! ever see one layout: packed 32-bit words holding 24-bit RGB, with an 8-bit
//! alpha channel added for cursor images. This module is the conversion
//! between the two.
//!
//! Translation is direct per-pixel arithmetic rather than lookup tables.
//! The optimizer does well on the shift/multiply/divide sequence, and the
//! formats only change on a renegotiation, so there is nothing worth caching.

use crate::error::{BridgeError, Result};

/// Describes how raw framebuffer bytes encode a pixel.
///
/// Built by the upstream adapter from the format the server actually reports,
/// which is not necessarily the one that was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    /// Bytes per pixel on the wire: 1, 2 or 4.
    pub bytes_per_pixel: usize,
    /// Multi-byte pixels are big-endian when set.
    pub big_endian: bool,
    /// Right-shift that brings the red channel to the least significant bits.
    pub red_shift: u8,
    /// Right-shift for the green channel.
    pub green_shift: u8,
    /// Right-shift for the blue channel.
    pub blue_shift: u8,
    /// Maximum red value; also the channel mask after shifting.
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
}

impl WireFormat {
    /// Checks the format can be translated at all.
    ///
    /// A channel maximum of zero would divide by `max + 1 = 1` harmlessly but
    /// means the server advertised a channel with no bits, which RFB forbids.
    /// The adapter rejects such formats before any pixel data arrives.
    pub fn validate(&self) -> Result<()> {
        if self.bytes_per_pixel != 1 && self.bytes_per_pixel != 2 && self.bytes_per_pixel != 4 {
            return Err(BridgeError::Translate(format!(
                "unsupported bytes per pixel: {}",
                self.bytes_per_pixel
            )));
        }
        if self.red_max == 0 || self.green_max == 0 || self.blue_max == 0 {
            return Err(BridgeError::Translate(
                "pixel format has an empty colour channel".into(),
            ));
        }
        Ok(())
    }

    /// Reads one raw pixel value at `offset`.
    fn read_pixel(&self, raw: &[u8], offset: usize) -> u32 {
        match self.bytes_per_pixel {
            1 => u32::from(raw[offset]),
            2 => {
                let b = [raw[offset], raw[offset + 1]];
                if self.big_endian {
                    u32::from(u16::from_be_bytes(b))
                } else {
                    u32::from(u16::from_le_bytes(b))
                }
            }
            _ => {
                let b = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
                if self.big_endian {
                    u32::from_be_bytes(b)
                } else {
                    u32::from_le_bytes(b)
                }
            }
        }
    }

    /// Extracts and rescales one channel to the 0..256 range.
    #[inline]
    fn channel(value: u32, shift: u8, max: u16) -> u32 {
        ((value >> shift) & u32::from(max)) * 256 / (u32::from(max) + 1)
    }

    /// Translates one raw pixel value into a `0x00RRGGBB` word.
    #[inline]
    fn to_rgb(&self, value: u32, swap_red_blue: bool) -> u32 {
        let red = Self::channel(value, self.red_shift, self.red_max);
        let green = Self::channel(value, self.green_shift, self.green_max);
        let blue = Self::channel(value, self.blue_shift, self.blue_max);
        if swap_red_blue {
            (blue << 16) | (green << 8) | red
        } else {
            (red << 16) | (green << 8) | blue
        }
    }
}

/// Translates a rectangle of raw framebuffer data into `0x00RRGGBB` words.
///
/// `stride` is the source row pitch in bytes; for tightly packed buffers it is
/// `width * bytes_per_pixel`. The output is tightly packed, one word per
/// pixel, row-major.
///
/// # Errors
///
/// Returns [`BridgeError::Translate`] if `raw` is too short for the declared
/// geometry.
pub fn rect_to_rgb(
    raw: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    format: &WireFormat,
    swap_red_blue: bool,
) -> Result<Vec<u32>> {
    let row_bytes = width * format.bytes_per_pixel;
    if height > 0 && raw.len() < stride * (height - 1) + row_bytes {
        return Err(BridgeError::Translate(format!(
            "pixel buffer too short: {} bytes for {}x{} at stride {}",
            raw.len(),
            width,
            height,
            stride
        )));
    }

    let mut out = Vec::with_capacity(width * height);
    for dy in 0..height {
        let mut offset = dy * stride;
        for _ in 0..width {
            let value = format.read_pixel(raw, offset);
            out.push(format.to_rgb(value, swap_red_blue));
            offset += format.bytes_per_pixel;
        }
    }
    Ok(out)
}

/// Translates a cursor image into `0xAARRGGBB` words.
///
/// `raw` holds tightly packed pixels in the wire format. `mask` is one bit per
/// pixel, row-major, `(width + 7) / 8` bytes per row, most significant bit
/// first: a set bit makes the pixel opaque (`alpha = 0xFF`), a clear bit makes
/// it fully transparent.
///
/// # Errors
///
/// Returns [`BridgeError::Translate`] if either buffer is shorter than the
/// declared geometry requires. The mask length check matters: the upstream
/// library hands the mask over as a bare allocation and a row count mismatch
/// must not read past it.
pub fn cursor_to_argb(
    raw: &[u8],
    mask: &[u8],
    width: usize,
    height: usize,
    format: &WireFormat,
    swap_red_blue: bool,
) -> Result<Vec<u32>> {
    let mask_stride = (width + 7) / 8;
    if mask.len() < mask_stride * height {
        return Err(BridgeError::Translate(format!(
            "cursor mask too short: {} bytes for {}x{}",
            mask.len(),
            width,
            height
        )));
    }
    if raw.len() < width * height * format.bytes_per_pixel {
        return Err(BridgeError::Translate(format!(
            "cursor pixel buffer too short: {} bytes for {}x{}",
            raw.len(),
            width,
            height
        )));
    }

    let mut out = Vec::with_capacity(width * height);
    for dy in 0..height {
        for dx in 0..width {
            let value = format.read_pixel(raw, (dy * width + dx) * format.bytes_per_pixel);
            let rgb = format.to_rgb(value, swap_red_blue);
            let bit = mask[dy * mask_stride + dx / 8] >> (7 - (dx % 8)) & 1;
            let alpha = if bit != 0 { 0xFF } else { 0x00 };
            out.push((alpha << 24) | rgb);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb888() -> WireFormat {
        WireFormat {
            bytes_per_pixel: 4,
            big_endian: false,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
        }
    }

    fn rgb565() -> WireFormat {
        WireFormat {
            bytes_per_pixel: 2,
            big_endian: false,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
        }
    }

    fn bgr233() -> WireFormat {
        WireFormat {
            bytes_per_pixel: 1,
            big_endian: false,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
        }
    }

    #[test]
    fn test_rgb888_little_endian() {
        // Blue then green in 32bpp little-endian RGB888.
        let raw = [0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00, 0xFF];
        let out = rect_to_rgb(&raw, 2, 1, 8, &rgb888(), false).unwrap();
        assert_eq!(out, vec![0x0000FF, 0x00FF00]);
    }

    #[test]
    fn test_channel_never_overflows() {
        // For every (shift, max) pair in use and every raw value the scaled
        // channel stays below 256, even when the raw value has bits outside
        // the channel.
        for &(shift, max) in &[(0u8, 7u16), (3, 7), (6, 3), (11, 31), (5, 63), (0, 255)] {
            for value in [0u32, 1, 0xFF, 0xFFFF, 0xFFFF_FFFF] {
                let c = WireFormat::channel(value, shift, max);
                assert!(c < 256, "channel({value:#x}, {shift}, {max}) = {c}");
            }
        }
    }

    #[test]
    fn test_channel_full_scale() {
        assert_eq!(WireFormat::channel(0xFF, 0, 255), 255);
        assert_eq!(WireFormat::channel(31, 0, 31), 248);
        assert_eq!(WireFormat::channel(0, 0, 31), 0);
    }

    #[test]
    fn test_rgb565_red() {
        // Maximum red in RGB565 is 0xF800.
        let raw = 0xF800u16.to_le_bytes();
        let out = rect_to_rgb(&raw, 1, 1, 2, &rgb565(), false).unwrap();
        assert_eq!(out, vec![0xF80000]);
    }

    #[test]
    fn test_bgr233_channels() {
        // red=7 green=7 blue=3 -> full-intensity channels after scaling.
        let raw = [0b11_111_111u8];
        let out = rect_to_rgb(&raw, 1, 1, 1, &bgr233(), false).unwrap();
        assert_eq!(out, vec![0xE0E0C0]);
    }

    #[test]
    fn test_swap_red_blue_symmetry() {
        let raw = [0x12, 0x34, 0x56, 0x00, 0x9A, 0xBC, 0xDE, 0x00];
        let plain = rect_to_rgb(&raw, 2, 1, 8, &rgb888(), false).unwrap();
        let swapped = rect_to_rgb(&raw, 2, 1, 8, &rgb888(), true).unwrap();
        for (a, b) in plain.iter().zip(swapped.iter()) {
            let unswapped = ((b & 0xFF) << 16) | (b & 0x00FF00) | ((b >> 16) & 0xFF);
            assert_eq!(*a, unswapped);
        }
    }

    #[test]
    fn test_stride_skips_row_padding() {
        // 1x2 rectangle inside a buffer with an 8-byte row stride.
        let mut raw = vec![0u8; 16];
        raw[0..4].copy_from_slice(&0x00FF0000u32.to_le_bytes());
        raw[8..12].copy_from_slice(&0x0000FF00u32.to_le_bytes());
        let out = rect_to_rgb(&raw, 1, 2, 8, &rgb888(), false).unwrap();
        assert_eq!(out, vec![0xFF0000, 0x00FF00]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let raw = [0u8; 7];
        assert!(rect_to_rgb(&raw, 2, 1, 8, &rgb888(), false).is_err());
    }

    #[test]
    fn test_big_endian_16bpp() {
        let raw = 0xF800u16.to_be_bytes();
        let mut format = rgb565();
        format.big_endian = true;
        let out = rect_to_rgb(&raw, 1, 1, 2, &format, false).unwrap();
        assert_eq!(out, vec![0xF80000]);
    }

    #[test]
    fn test_cursor_mask_msb_first() {
        // 3x1 white cursor, mask 0b1010_0000: opaque, transparent, opaque.
        let mut raw = Vec::new();
        for _ in 0..3 {
            raw.extend_from_slice(&0x00FF_FFFFu32.to_le_bytes());
        }
        let out = cursor_to_argb(&raw, &[0b1010_0000], 3, 1, &rgb888(), false).unwrap();
        assert_eq!(out, vec![0xFFFF_FFFF, 0x00FF_FFFF, 0xFFFF_FFFF]);
    }

    #[test]
    fn test_cursor_mask_row_padding() {
        // 9 pixels wide needs 2 mask bytes per row; bit 7 of the second byte
        // is pixel 8.
        let raw = vec![0u8; 9 * 2 * 4];
        let mask = [0x00, 0x80, 0x00, 0x00];
        let out = cursor_to_argb(&raw, &mask, 9, 2, &rgb888(), false).unwrap();
        assert_eq!(out[8], 0xFF00_0000);
        assert_eq!(out.iter().filter(|&&p| p >> 24 == 0xFF).count(), 1);
    }

    #[test]
    fn test_cursor_short_mask_rejected() {
        let raw = vec![0u8; 8 * 8 * 4];
        let mask = vec![0u8; 7];
        assert!(cursor_to_argb(&raw, &mask, 8, 8, &rgb888(), false).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_channel() {
        let mut format = rgb888();
        format.green_max = 0;
        assert!(format.validate().is_err());
        assert!(rgb888().validate().is_ok());
        assert!(rgb565().validate().is_ok());
        assert!(bgr233().validate().is_ok());
    }
}
