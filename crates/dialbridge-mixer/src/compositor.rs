//! Off-screen canvas and per-track draw.

use image::{Rgba, RgbaImage, imageops};

use dialbridge_common::config::LayoutMode;
use dialbridge_common::{MediaTrack, VideoFrame};

use crate::layout::{self, Cell};

const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Most panoramic crop kept for sources at 2:1 or wider.
const WIDE_SOURCE_MAX_ASPECT: f64 = 16.0 / 9.0;

/// Source rectangle to sample from a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Center crop of a `src_w`x`src_h` frame matching the aspect of `cell`.
pub fn center_crop(src_w: u32, src_h: u32, cell: Cell) -> Crop {
    let src_aspect = src_w as f64 / src_h.max(1) as f64;
    let mut target = cell.aspect();
    if src_aspect >= 2.0 {
        target = target.min(WIDE_SOURCE_MAX_ASPECT);
    }

    let (width, height) = if src_aspect > target {
        ((src_h as f64 * target).round() as u32, src_h)
    } else {
        (src_w, (src_w as f64 / target).round() as u32)
    };
    let width = width.clamp(1, src_w.max(1));
    let height = height.clamp(1, src_h.max(1));

    Crop {
        x: ((src_w - width) as f64 / 2.0).round() as u32,
        y: ((src_h - height) as f64 / 2.0).round() as u32,
        width,
        height,
    }
}

/// Fixed-size canvas redrawn every render tick.
pub struct Compositor {
    width: u32,
    height: u32,
    mode: LayoutMode,
    canvas: RgbaImage,
    cells: Vec<Cell>,
    generation: Option<u64>,
}

impl Compositor {
    pub fn new(width: u32, height: u32, mode: LayoutMode) -> Self {
        Self {
            width,
            height,
            mode,
            canvas: RgbaImage::from_pixel(width, height, BLACK),
            cells: Vec::new(),
            generation: None,
        }
    }

    /// Cells used by the last render.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Paint every admitted track into its cell and return a copy of the canvas.
    ///
    /// `generation` changes whenever the admitted set changes; the grid is
    /// recomputed and the canvas cleared to black in that case. Tracks that
    /// have not produced a frame yet leave their cell untouched.
    pub fn render(&mut self, generation: u64, tracks: &[MediaTrack]) -> VideoFrame {
        if self.generation != Some(generation) {
            self.cells = layout::cells(self.mode, tracks.len(), self.width, self.height);
            self.clear();
            self.generation = Some(generation);
        }

        for (track, cell) in tracks.iter().zip(self.cells.iter().copied()) {
            let Some(frame) = track.latest_video_frame() else {
                continue;
            };
            draw(&mut self.canvas, &frame, cell);
        }

        self.canvas.clone()
    }

    pub fn clear(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = BLACK;
        }
    }
}

fn draw(canvas: &mut RgbaImage, frame: &VideoFrame, cell: Cell) {
    let (src_w, src_h) = frame.dimensions();
    if src_w == 0 || src_h == 0 || cell.width == 0 || cell.height == 0 {
        return;
    }
    let crop = center_crop(src_w, src_h, cell);
    let region = imageops::crop_imm(frame, crop.x, crop.y, crop.width, crop.height).to_image();
    let scaled = if region.dimensions() == (cell.width, cell.height) {
        region
    } else {
        imageops::resize(&region, cell.width, cell.height, imageops::FilterType::Triangle)
    };
    imageops::replace(canvas, &scaled, cell.x as i64, cell.y as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialbridge_common::MediaKind;
    use std::sync::Arc;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Arc<VideoFrame> {
        Arc::new(RgbaImage::from_pixel(
            width,
            height,
            Rgba([rgb[0], rgb[1], rgb[2], 255]),
        ))
    }

    fn video_track(frame: Option<Arc<VideoFrame>>) -> MediaTrack {
        let track = MediaTrack::new(MediaKind::Video);
        if let Some(frame) = frame {
            track.push_video_frame(frame);
        }
        track
    }

    #[test]
    fn crop_matches_cell_aspect() {
        // 16:9 source into a 4:3 cell trims the sides.
        let crop = center_crop(1280, 720, Cell::full(640, 480));
        assert_eq!(crop, Crop { x: 160, y: 0, width: 960, height: 720 });

        // Portrait source into a 4:3 cell trims top and bottom.
        let crop = center_crop(480, 640, Cell::full(640, 480));
        assert_eq!(crop, Crop { x: 0, y: 140, width: 480, height: 360 });
    }

    #[test]
    fn wide_source_is_capped_at_sixteen_nine() {
        let row = Cell { x: 0, y: 0, width: 640, height: 96 };
        let crop = center_crop(1920, 800, row);
        assert_eq!(crop.height, 800);
        assert_eq!(crop.width, 1422);
        assert_eq!(crop.x, 249);
    }

    #[test]
    fn render_places_tracks_in_quadrants() {
        let mut compositor = Compositor::new(64, 48, LayoutMode::Uniform);
        let red = video_track(Some(solid(32, 24, [255, 0, 0])));
        let blue = video_track(Some(solid(32, 24, [0, 0, 255])));

        let frame = compositor.render(1, &[red, blue]);
        assert_eq!(frame.get_pixel(5, 5).0, [255, 0, 0, 255]);
        assert_eq!(frame.get_pixel(40, 5).0, [0, 0, 255, 255]);
        // Bottom half is empty in a 2x2 grid with two tracks.
        assert_eq!(frame.get_pixel(5, 40).0, [0, 0, 0, 255]);
    }

    #[test]
    fn removal_reverts_to_full_frame() {
        let mut compositor = Compositor::new(64, 48, LayoutMode::Uniform);
        let red = video_track(Some(solid(32, 24, [255, 0, 0])));
        let blue = video_track(Some(solid(32, 24, [0, 0, 255])));

        compositor.render(1, &[red.clone(), blue]);
        assert_eq!(compositor.cells().len(), 2);

        let frame = compositor.render(2, &[red]);
        assert_eq!(compositor.cells(), &[Cell::full(64, 48)]);
        assert_eq!(frame.get_pixel(40, 5).0, [255, 0, 0, 255]);
        assert_eq!(frame.get_pixel(60, 44).0, [255, 0, 0, 255]);
    }

    #[test]
    fn frameless_track_keeps_cell_black() {
        let mut compositor = Compositor::new(64, 48, LayoutMode::Uniform);
        let pending = video_track(None);
        let frame = compositor.render(1, &[pending]);
        assert!(frame.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    }
}
