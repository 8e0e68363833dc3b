//! Grid geometry for the video compositor.
//!
//! Pure functions: given the admitted track count and the output size, return
//! one destination cell per drawable track. Cell edges are computed as rounded
//! boundaries, so neighbouring cells share an edge and no one-pixel seams
//! appear when the output size is not divisible by the side count.

use dialbridge_common::config::LayoutMode;

/// Secondary thumbnails in the filmstrip strip.
pub const FILMSTRIP_THUMBNAILS: usize = 5;

/// Destination rectangle on the output canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Cell {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn aspect(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }
}

/// Side count of the uniform grid for `n` tracks.
pub fn side_count(n: usize) -> usize {
    match n {
        n if n > 36 => 7,
        n if n > 25 => 6,
        n if n > 16 => 5,
        n if n > 9 => 4,
        n if n > 4 => 3,
        n if n > 1 => 2,
        _ => 1,
    }
}

/// Cells for `n` admitted tracks under `mode`, in admission order.
///
/// Tracks beyond the last cell of the grid are not drawn.
pub fn cells(mode: LayoutMode, n: usize, width: u32, height: u32) -> Vec<Cell> {
    match mode {
        LayoutMode::Uniform => uniform(n, width, height),
        LayoutMode::Filmstrip => filmstrip(n, width, height),
    }
}

fn uniform(n: usize, width: u32, height: u32) -> Vec<Cell> {
    let side = side_count(n);
    (0..n.min(side * side))
        .map(|i| {
            let (col, row) = (i % side, i / side);
            let (x0, x1) = (edge(col, side, width), edge(col + 1, side, width));
            let (y0, y1) = (edge(row, side, height), edge(row + 1, side, height));
            Cell {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
            }
        })
        .collect()
}

/// Index 0 fills the frame, indices 1..=5 form a thumbnail strip along the
/// bottom fifth, anything beyond falls back to a full-width row at the top.
fn filmstrip(n: usize, width: u32, height: u32) -> Vec<Cell> {
    if n <= 1 {
        return (0..n).map(|_| Cell::full(width, height)).collect();
    }
    let side = FILMSTRIP_THUMBNAILS;
    let strip_top = edge(side - 1, side, height);
    let row_height = edge(1, side, height);
    (0..n)
        .map(|i| match i {
            0 => Cell::full(width, height),
            i if i <= side => {
                let (x0, x1) = (edge(i - 1, side, width), edge(i, side, width));
                Cell {
                    x: x0,
                    y: strip_top,
                    width: x1 - x0,
                    height: height - strip_top,
                }
            }
            _ => Cell {
                x: 0,
                y: 0,
                width,
                height: row_height,
            },
        })
        .collect()
}

/// `round(index * total / parts)` in integer arithmetic.
fn edge(index: usize, parts: usize, total: u32) -> u32 {
    let (index, parts, total) = (index as u64, parts as u64, total as u64);
    ((2 * index * total + parts) / (2 * parts)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_count_thresholds() {
        let expected = [
            (0, 1),
            (1, 1),
            (2, 2),
            (4, 2),
            (5, 3),
            (9, 3),
            (10, 4),
            (16, 4),
            (17, 5),
            (25, 5),
            (26, 6),
            (36, 6),
            (37, 7),
            (100, 7),
        ];
        for (n, side) in expected {
            assert_eq!(side_count(n), side, "n = {n}");
        }
    }

    #[test]
    fn single_track_fills_frame() {
        assert_eq!(
            cells(LayoutMode::Uniform, 1, 640, 480),
            vec![Cell::full(640, 480)]
        );
        assert!(cells(LayoutMode::Uniform, 0, 640, 480).is_empty());
    }

    #[test]
    fn two_tracks_use_quadrants() {
        let c = cells(LayoutMode::Uniform, 2, 640, 480);
        assert_eq!(
            c,
            vec![
                Cell { x: 0, y: 0, width: 320, height: 240 },
                Cell { x: 320, y: 0, width: 320, height: 240 },
            ]
        );
    }

    #[test]
    fn uneven_sizes_share_edges() {
        let c = cells(LayoutMode::Uniform, 9, 640, 480);
        assert_eq!(c.len(), 9);
        for row in c.chunks(3) {
            assert_eq!(row[0].x, 0);
            assert_eq!(row[0].x + row[0].width, row[1].x);
            assert_eq!(row[1].x + row[1].width, row[2].x);
            assert_eq!(row[2].x + row[2].width, 640);
        }
        assert_eq!(c[6].y + c[6].height, 480);
    }

    #[test]
    fn overflow_tracks_are_not_drawn() {
        assert_eq!(cells(LayoutMode::Uniform, 60, 700, 700).len(), 49);
    }

    #[test]
    fn filmstrip_primary_and_strip() {
        let c = cells(LayoutMode::Filmstrip, 7, 640, 480);
        assert_eq!(c[0], Cell::full(640, 480));
        assert_eq!(c[1], Cell { x: 0, y: 384, width: 128, height: 96 });
        assert_eq!(c[5], Cell { x: 512, y: 384, width: 128, height: 96 });
        assert_eq!(c[6], Cell { x: 0, y: 0, width: 640, height: 96 });
    }

    #[test]
    fn filmstrip_single_track_fills_frame() {
        assert_eq!(
            cells(LayoutMode::Filmstrip, 1, 640, 480),
            vec![Cell::full(640, 480)]
        );
    }
}
