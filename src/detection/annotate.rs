use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::models::DetectionRecord;

pub const DEFAULT_LINE_WIDTH: u32 = 5;

const PALETTE: [[u8; 3]; 7] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [146, 204, 23],
];

fn class_color(defect_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[defect_id as usize % PALETTE.len()])
}

/// Draw every record's box onto a copy of `image`, one color per class.
pub fn annotate(image: &DynamicImage, records: &[DetectionRecord], line_width: u32) -> RgbImage {
    let mut canvas = image.to_rgb8();

    for record in records {
        let color = class_color(record.defect_id);
        let b = record.bbox;
        for inset in 0..line_width.max(1) as i32 {
            let x1 = b.x1 as i32 + inset;
            let y1 = b.y1 as i32 + inset;
            let x2 = b.x2 as i32 - inset;
            let y2 = b.y2 as i32 - inset;
            if x2 <= x1 || y2 <= y1 {
                break;
            }
            let rect = Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }

    canvas
}
