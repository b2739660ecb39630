//! Drawing of detections, track labels and the statistics overlay.
//!
//! `render` works on a copy of the frame; the caller's image is left untouched.
//! Text is rendered from the embedded DejaVu Sans face. Positions follow the
//! baseline convention: the y coordinate of a line is where its glyphs sit.

use std::sync::LazyLock;

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::warn;

use crate::stats::StatisticsSnapshot;
use crate::types::{BoundingBox, Detection, Track};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 16.0;
const LABEL_GAP: i32 = 10;
const OVERLAY_SCALE: f32 = 28.0;
const OVERLAY_X: i32 = 30;
const OVERLAY_FIRST_BASELINE: i32 = 50;
const OVERLAY_LINE_SPACING: i32 = 30;

const FONT_DATA: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

static FONT: LazyLock<Option<FontArc>> = LazyLock::new(|| match FontArc::try_from_slice(FONT_DATA) {
    Ok(font) => Some(font),
    Err(e) => {
        warn!(error = %e, "embedded font could not be parsed, text overlays disabled");
        None
    }
});

pub fn render(
    frame: &RgbImage,
    detections: &[Detection],
    tracks: &[Track],
    snapshot: &StatisticsSnapshot,
) -> RgbImage {
    let mut out = frame.clone();

    for det in detections {
        draw_box(&mut out, &det.bbox, BOX_COLOR, BOX_THICKNESS);
    }

    let Some(font) = FONT.as_ref() else {
        return out;
    };

    for track in tracks.iter().filter(|t| t.confirmed) {
        let x = track.bbox.x1.round() as i32;
        let baseline = track.bbox.y1.round() as i32 - LABEL_GAP;
        draw_line(&mut out, font, &format!("ID {}", track.id), x, baseline, LABEL_SCALE, LABEL_COLOR);
    }

    for (i, line) in snapshot.overlay_lines().iter().enumerate() {
        let baseline = OVERLAY_FIRST_BASELINE + i as i32 * OVERLAY_LINE_SPACING;
        draw_line(&mut out, font, line, OVERLAY_X, baseline, OVERLAY_SCALE, OVERLAY_COLOR);
    }

    out
}

/// Top of the layout box whose baseline sits at `baseline`.
fn line_top(font: &FontArc, baseline: i32, scale: f32) -> i32 {
    baseline - font.as_scaled(PxScale::from(scale)).ascent().round() as i32
}

fn draw_line(img: &mut RgbImage, font: &FontArc, text: &str, x: i32, baseline: i32, scale: f32, color: Rgb<u8>) {
    let y = line_top(font, baseline, scale);
    draw_text_mut(img, color, x, y, PxScale::from(scale), font, text);
}

/// Outline `bbox`, clamped to the image so boxes touching the border keep
/// their visible edges.
fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: i32) {
    let (img_w, img_h) = (img.width() as f32, img.height() as f32);
    let x1 = bbox.x1.max(0.0).round() as i32;
    let y1 = bbox.y1.max(0.0).round() as i32;
    let x2 = bbox.x2.min(img_w).round() as i32;
    let y2 = bbox.y2.min(img_h).round() as i32;
    if x2 <= x1 || y2 <= y1 {
        return;
    }
    let (w, h) = ((x2 - x1) as u32, (y2 - y1) as u32);

    // Thick border as nested hollow rectangles, growing inwards.
    for offset in 0..thickness {
        let inner_w = w.saturating_sub(2 * offset as u32);
        let inner_h = h.saturating_sub(2 * offset as u32);
        if inner_w == 0 || inner_h == 0 {
            break;
        }
        let rect = Rect::at(x1 + offset, y1 + offset).of_size(inner_w, inner_h);
        draw_hollow_rect_mut(img, rect, color);
    }
}
