use image::{DynamicImage, GrayImage, RgbImage};
use time::OffsetDateTime;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
    pub ts: Option<OffsetDateTime>,
}

impl Frame {
    pub fn gray(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            data,
            ts: None,
        }
    }

    pub fn from_gray(img: GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self::gray(width, height, img.into_raw())
    }

    pub fn from_rgb(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixel_format: PixelFormat::Rgb8,
            data: img.into_raw(),
            ts: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Buffer length matches `width * height * channels`.
    pub fn is_consistent(&self) -> bool {
        self.data.len()
            == (self.width as usize) * (self.height as usize) * self.pixel_format.channels()
    }

    fn mismatch(&self) -> Error {
        Error::FrameRead(format!(
            "buffer of {} bytes does not match {}x{} {:?}",
            self.data.len(),
            self.width,
            self.height,
            self.pixel_format
        ))
    }

    pub fn to_rgb(&self) -> Result<RgbImage> {
        let rgb = match self.pixel_format {
            PixelFormat::Gray8 => return Ok(DynamicImage::ImageLuma8(self.to_gray()?).to_rgb8()),
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Bgr8 => {
                let mut data = self.data.clone();
                data.chunks_exact_mut(3).for_each(|p| p.swap(0, 2));
                data
            }
        };
        RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| self.mismatch())
    }

    /// Single-channel luma image used by detection.
    pub fn to_gray(&self) -> Result<GrayImage> {
        match self.pixel_format {
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .ok_or_else(|| self.mismatch()),
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
                Ok(DynamicImage::ImageRgb8(self.to_rgb()?).to_luma8())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_rgb_to_gray() {
        let f = Frame {
            width: 2,
            height: 1,
            pixel_format: PixelFormat::Rgb8,
            data: vec![255, 255, 255, 0, 0, 0],
            ts: None,
        };
        assert!(f.is_consistent());
        let g = f.to_gray().unwrap();
        assert_eq!(g.as_raw(), &vec![255, 0]);
    }

    #[test]
    fn test_bgr_channel_order() {
        let bgr = Frame {
            width: 1,
            height: 1,
            pixel_format: PixelFormat::Bgr8,
            data: vec![255, 0, 0],
            ts: None,
        };
        let rgb = Frame {
            pixel_format: PixelFormat::Rgb8,
            data: vec![0, 0, 255],
            ..bgr.clone()
        };
        // both are pure blue
        assert_eq!(bgr.to_rgb().unwrap(), rgb.to_rgb().unwrap());
        assert_eq!(bgr.to_gray().unwrap(), rgb.to_gray().unwrap());
        assert!(bgr.to_gray().unwrap().get_pixel(0, 0)[0] < 64);
    }

    #[test]
    fn test_inconsistent_buffer() {
        let f = Frame::gray(4, 4, vec![0; 3]);
        assert!(matches!(f.to_gray(), Err(Error::FrameRead(_))));
        assert!(matches!(f.to_rgb(), Err(Error::FrameRead(_))));
    }

    #[test]
    fn test_gray_round_trip() {
        let img = GrayImage::from_pixel(3, 2, Luma([77]));
        let f = Frame::from_gray(img.clone());
        assert_eq!((f.width, f.height), (3, 2));
        assert_eq!(f.to_gray().unwrap(), img);
        assert_eq!(f.to_rgb().unwrap().get_pixel(2, 1).0, [77, 77, 77]);
    }
}
