//! Marker rendering and the debug overlay.

use image::{GrayImage, Luma, Rgb};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::detect::DetectedMarker;
use crate::dictionary::Dictionary;
use crate::homography::{estimate_homography, project};
use crate::{Error, Frame, Result};

/// Printable marker image: black border one cell wide, no quiet zone.
pub fn marker_image(dict: &Dictionary, id: u32, cell_px: u32) -> Result<GrayImage> {
    if cell_px == 0 {
        return Err(Error::Config("cell size must be at least one pixel".into()));
    }
    check_id(dict, id)?;
    let cells = dict.marker_size() + 2;
    let side = cells as u32 * cell_px;
    Ok(GrayImage::from_fn(side, side, |x, y| {
        let (cx, cy) = ((x / cell_px) as usize, (y / cell_px) as usize);
        Luma([if cell_is_white(dict, id, cx, cy, cells) { 255 } else { 0 }])
    }))
}

fn check_id(dict: &Dictionary, id: u32) -> Result<()> {
    match dict.code(id) {
        Some(_) => Ok(()),
        None => Err(Error::Config(format!("marker id {id} not in {}", dict.name()))),
    }
}

/// Border cells are black; `id` must already be checked.
fn cell_is_white(dict: &Dictionary, id: u32, cx: usize, cy: usize, cells: usize) -> bool {
    if cx == 0 || cy == 0 || cx + 1 >= cells || cy + 1 >= cells {
        return false;
    }
    dict.cell(id, cx - 1, cy - 1).unwrap_or(false)
}

/// Synthetic grayscale scene: white background with markers painted in.
pub struct Scene {
    image: GrayImage,
}

impl Scene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: GrayImage::from_pixel(width, height, Luma([255])),
        }
    }

    /// Paint a marker into the quad given clockwise from its top-left corner.
    pub fn with_marker(mut self, dict: &Dictionary, id: u32, corners: [[f64; 2]; 4]) -> Result<Self> {
        paint_marker(&mut self.image, dict, id, corners)?;
        Ok(self)
    }

    /// Axis-aligned marker of `side` pixels centred on `center`.
    pub fn with_square_marker(self, dict: &Dictionary, id: u32, center: [f64; 2], side: f64) -> Result<Self> {
        let h = side / 2.0;
        let (x, y) = (center[0], center[1]);
        self.with_marker(
            dict,
            id,
            [[x - h, y - h], [x + h, y - h], [x + h, y + h], [x - h, y + h]],
        )
    }

    pub fn render(self) -> GrayImage {
        self.image
    }
}

/// Pixel centres sit on integer coordinates.
pub fn paint_marker(
    img: &mut GrayImage,
    dict: &Dictionary,
    id: u32,
    corners: [[f64; 2]; 4],
) -> Result<()> {
    check_id(dict, id)?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Ok(());
    }
    let cells = dict.marker_size() + 2;
    let s = cells as f64;
    let canon = [[0.0, 0.0], [s, 0.0], [s, s], [0.0, s]];
    let h = estimate_homography(&corners, &canon)?;

    let (w, hgt) = (f64::from(width - 1), f64::from(height - 1));
    let min_x = corners.iter().map(|c| c[0]).fold(f64::MAX, f64::min).floor();
    let min_y = corners.iter().map(|c| c[1]).fold(f64::MAX, f64::min).floor();
    let max_x = corners.iter().map(|c| c[0]).fold(f64::MIN, f64::max).ceil();
    let max_y = corners.iter().map(|c| c[1]).fold(f64::MIN, f64::max).ceil();
    if !(max_x >= 0.0 && max_y >= 0.0 && min_x <= w && min_y <= hgt) {
        return Ok(());
    }
    let (min_x, min_y) = (min_x.max(0.0) as u32, min_y.max(0.0) as u32);
    let (max_x, max_y) = (max_x.min(w) as u32, max_y.min(hgt) as u32);

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let Some([u, v]) = project(&h, f64::from(x), f64::from(y)) else {
                continue;
            };
            if !(0.0..s).contains(&u) || !(0.0..s).contains(&v) {
                continue;
            }
            let white = cell_is_white(dict, id, u as usize, v as usize, cells);
            img.put_pixel(x, y, Luma([if white { 255 } else { 0 }]));
        }
    }
    Ok(())
}

const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);
const FIRST_CORNER: Rgb<u8> = Rgb([255, 0, 0]);

/// RGB copy of `frame` with marker outlines and a box on each first corner.
pub fn annotate(frame: &Frame, markers: &[DetectedMarker]) -> Result<Frame> {
    let mut canvas = frame.to_rgb()?;
    for m in markers {
        for i in 0..4 {
            let (a, b) = (m.corners[i], m.corners[(i + 1) % 4]);
            draw_line_segment_mut(
                &mut canvas,
                (a[0] as f32, a[1] as f32),
                (b[0] as f32, b[1] as f32),
                OUTLINE,
            );
        }
        let [cx, cy] = m.corners[0];
        let corner = Rect::at(cx.round() as i32 - 2, cy.round() as i32 - 2).of_size(5, 5);
        draw_filled_rect_mut(&mut canvas, corner, FIRST_CORNER);
    }
    let mut out = Frame::from_rgb(canvas);
    out.ts = frame.ts;
    Ok(out)
}
