//! Tile-level diffing against the previously sent frame.
//!
//! The frame is cut into a grid of `tile_size` squares (edge tiles are
//! smaller). Changed tiles are merged greedily into rectangles: first into
//! horizontal runs within a tile row, then runs with identical column spans
//! in consecutive rows are stacked. The result covers exactly the changed
//! tiles with no overlap. When too much changed, or when the periodic
//! refresh is due, a single full-frame rectangle is sent instead.

use crate::codec::RectEncoder;
use crate::config::DeviceConfig;
use crate::error::FrameError;
use crate::protocol::EncodedRect;

// ── Pixel buffers ───────────────────────────────────────────────────

/// Tightly packed RGBA pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl PixelFrame {
    /// `data` is resized to `width * height * 4` bytes if it does not match.
    pub fn new(width: u32, height: u32, mut data: Vec<u8>) -> Self {
        data.resize(width as usize * height as usize * 4, 0);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x < self.width && y < self.height {
            let i = self.offset(x, y);
            self.data[i..i + 4].copy_from_slice(&rgba);
        }
    }

    pub fn fill_rect(&mut self, rect: Rect, rgba: [u8; 4]) {
        for y in rect.y..(rect.y + rect.height).min(self.height) {
            for x in rect.x..(rect.x + rect.width).min(self.width) {
                self.set_pixel(x, y, rgba);
            }
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    fn row(&self, rect: Rect, y: u32) -> &[u8] {
        let start = self.offset(rect.x, y);
        &self.data[start..start + rect.width as usize * 4]
    }

    pub fn crop_rgba(&self, rect: Rect) -> Vec<u8> {
        let mut out = Vec::with_capacity(rect.area() as usize * 4);
        for y in rect.y..rect.y + rect.height {
            out.extend_from_slice(self.row(rect, y));
        }
        out
    }

    pub fn crop_rgb(&self, rect: Rect) -> Vec<u8> {
        let mut out = Vec::with_capacity(rect.area() as usize * 3);
        for y in rect.y..rect.y + rect.height {
            for px in self.row(rect, y).chunks_exact(4) {
                out.extend_from_slice(&px[..3]);
            }
        }
        out
    }

    fn region_differs(&self, other: &PixelFrame, rect: Rect) -> bool {
        (rect.y..rect.y + rect.height).any(|y| self.row(rect, y) != other.row(rect, y))
    }
}

// ── Encoder ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSettings {
    pub tile_size: u32,
    pub full_frame_tile_count: usize,
    pub full_frame_area_threshold: f64,
    pub full_frame_every: u32,
    pub quality: u8,
}

impl From<&DeviceConfig> for TileSettings {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            tile_size: cfg.tile_size.max(1),
            full_frame_tile_count: cfg.full_frame_tile_count,
            full_frame_area_threshold: cfg.full_frame_area_threshold,
            full_frame_every: cfg.full_frame_every,
            quality: cfg.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameOutput {
    pub rects: Vec<EncodedRect>,
    pub full_frame: bool,
}

impl FrameOutput {
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.rects.iter().map(|r| r.data.len()).sum()
    }
}

pub struct TileEncoder {
    settings: TileSettings,
    prev: Option<PixelFrame>,
    /// Frames emitted since the last periodic full frame.
    since_refresh: u32,
}

impl TileEncoder {
    pub fn new(settings: TileSettings) -> Self {
        Self {
            settings,
            prev: None,
            since_refresh: 0,
        }
    }

    #[cfg(test)]
    pub fn has_reference(&self) -> bool {
        self.prev.is_some()
    }

    /// Diff `frame` against the retained one and encode what changed.
    ///
    /// `force_full` sends the whole frame even when a reference exists. The
    /// retained frame and counters change only when encoding succeeds; an
    /// unchanged frame produces empty output and is not counted.
    pub fn process(
        &mut self,
        frame: PixelFrame,
        force_full: bool,
        encoder: &dyn RectEncoder,
    ) -> Result<FrameOutput, FrameError> {
        let ts = self.settings.tile_size;
        let comparable = self
            .prev
            .as_ref()
            .filter(|p| p.width == frame.width && p.height == frame.height);

        let mut full = force_full || comparable.is_none();
        let mut rects = Vec::new();
        if let Some(prev) = comparable.filter(|_| !full) {
            let changed = changed_tiles(prev, &frame, ts);
            let count = changed.iter().flatten().filter(|c| **c).count();
            if count == 0 {
                return Ok(FrameOutput::default());
            }
            rects = merge_tiles(&changed, ts, frame.width, frame.height);
            let changed_area: u64 = rects.iter().map(Rect::area).sum();
            let total_area = frame.width as u64 * frame.height as u64;
            if count > self.settings.full_frame_tile_count
                || changed_area as f64 / total_area.max(1) as f64
                    > self.settings.full_frame_area_threshold
            {
                full = true;
            }
        }

        let mut since_refresh = self.since_refresh + 1;
        let every = self.settings.full_frame_every;
        if every > 0 && since_refresh >= every {
            full = true;
            since_refresh = 0;
        }

        if full {
            rects = vec![Rect {
                x: 0,
                y: 0,
                width: frame.width,
                height: frame.height,
            }];
        }

        let encoded = rects
            .iter()
            .map(|&r| -> Result<EncodedRect, FrameError> {
                Ok(EncodedRect {
                    x: wire_u16(r.x),
                    y: wire_u16(r.y),
                    width: wire_u16(r.width),
                    height: wire_u16(r.height),
                    data: encoder.encode(&frame, r, self.settings.quality)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.since_refresh = since_refresh;
        self.prev = Some(frame);
        Ok(FrameOutput {
            rects: encoded,
            full_frame: full,
        })
    }
}

fn wire_u16(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

fn grid(width: u32, height: u32, ts: u32) -> (u32, u32) {
    (width.div_ceil(ts), height.div_ceil(ts))
}

fn tile_rect(col: u32, row: u32, ts: u32, width: u32, height: u32) -> Rect {
    let x = col * ts;
    let y = row * ts;
    Rect {
        x,
        y,
        width: ts.min(width - x),
        height: ts.min(height - y),
    }
}

/// Per-row flags of tiles whose pixels differ.
fn changed_tiles(prev: &PixelFrame, cur: &PixelFrame, ts: u32) -> Vec<Vec<bool>> {
    let (cols, rows) = grid(cur.width, cur.height, ts);
    (0..rows)
        .map(|row| {
            (0..cols)
                .map(|col| {
                    let r = tile_rect(col, row, ts, cur.width, cur.height);
                    cur.region_differs(prev, r)
                })
                .collect()
        })
        .collect()
}

fn merge_tiles(changed: &[Vec<bool>], ts: u32, width: u32, height: u32) -> Vec<Rect> {
    // (first col, last col exclusive, first row, last row exclusive)
    let mut done: Vec<(u32, u32, u32, u32)> = Vec::new();
    let mut open: Vec<(u32, u32, u32, u32)> = Vec::new();

    for (row, flags) in changed.iter().enumerate() {
        let row = row as u32;
        let mut runs = Vec::new();
        let mut col = 0;
        while (col as usize) < flags.len() {
            if flags[col as usize] {
                let start = col;
                while (col as usize) < flags.len() && flags[col as usize] {
                    col += 1;
                }
                runs.push((start, col));
            } else {
                col += 1;
            }
        }

        let mut next_open = Vec::with_capacity(runs.len());
        for (c0, c1) in runs {
            match open.iter().position(|&(o0, o1, _, _)| o0 == c0 && o1 == c1) {
                Some(i) => {
                    let (o0, o1, r0, _) = open.swap_remove(i);
                    next_open.push((o0, o1, r0, row + 1));
                }
                None => next_open.push((c0, c1, row, row + 1)),
            }
        }
        done.append(&mut open);
        open = next_open;
    }
    done.append(&mut open);
    done.sort_by_key(|&(c0, _, r0, _)| (r0, c0));

    done.into_iter()
        .map(|(c0, c1, r0, r1)| {
            let x = c0 * ts;
            let y = r0 * ts;
            Rect {
                x,
                y,
                width: (c1 * ts).min(width) - x,
                height: (r1 * ts).min(height) - y,
            }
        })
        .collect()
}
