//! Frames and stream bodies used by the integration tests.

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

pub const MJPEG_BOUNDARY: &str = "frame";

/// Two tiny multipart parts, as a camera would stream them.
pub const MJPEG_CHUNKS: &[&[u8]] = &[
    b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n",
    b"\xff\xd8\xff\xd9\r\n",
    b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n",
    b"\xff\xd8\xff\xd9\r\n",
];

pub fn mjpeg_body() -> Vec<u8> {
    MJPEG_CHUNKS.concat()
}

/// A solid-colour PNG frame.
pub fn png_frame(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([30, 140, 60]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}
