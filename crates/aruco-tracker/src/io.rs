//! Image file I/O for frames (PNG and PNM).

use std::path::Path;

use image::{DynamicImage, ImageError};

use crate::{Error, Frame, PixelFormat, Result};

fn map_err(path: &Path, e: ImageError) -> Error {
    match e {
        ImageError::IoError(io) => Error::Io(format!("{}: {io}", path.display())),
        other => Error::Backend(format!("{}: {other}", path.display())),
    }
}

/// Read an image file. Grayscale files stay single-channel, everything else
/// becomes RGB.
pub fn read_image(path: impl AsRef<Path>) -> Result<Frame> {
    let path = path.as_ref();
    let frame = match image::open(path).map_err(|e| map_err(path, e))? {
        DynamicImage::ImageLuma8(gray) => Frame::from_gray(gray),
        other => Frame::from_rgb(other.to_rgb8()),
    };
    Ok(frame)
}

pub fn write_image(path: impl AsRef<Path>, frame: &Frame) -> Result<()> {
    let path = path.as_ref();
    if frame.is_empty() {
        return Err(Error::FrameRead("cannot write an empty frame".into()));
    }
    let saved = match frame.pixel_format {
        PixelFormat::Gray8 => frame.to_gray()?.save(path),
        PixelFormat::Rgb8 | PixelFormat::Bgr8 => frame.to_rgb()?.save(path),
    };
    saved.map_err(|e| map_err(path, e))
}
