use crate::{CameraSource, Error, Frame, PixelFormat, Result};
use opencv::prelude::*;
use opencv::{core, videoio};
use time::OffsetDateTime;
use tracing::debug;

pub struct OpenCvCamera {
    cap: videoio::VideoCapture,
    spec: String,
}

/// Capture property names accepted in configuration.
fn property_id(name: &str) -> Option<i32> {
    let id = match name.to_ascii_lowercase().as_str() {
        "frame_width" | "width" => videoio::CAP_PROP_FRAME_WIDTH,
        "frame_height" | "height" => videoio::CAP_PROP_FRAME_HEIGHT,
        "fps" => videoio::CAP_PROP_FPS,
        "exposure" => videoio::CAP_PROP_EXPOSURE,
        "auto_exposure" => videoio::CAP_PROP_AUTO_EXPOSURE,
        "gain" => videoio::CAP_PROP_GAIN,
        "brightness" => videoio::CAP_PROP_BRIGHTNESS,
        "contrast" => videoio::CAP_PROP_CONTRAST,
        "focus" => videoio::CAP_PROP_FOCUS,
        "autofocus" => videoio::CAP_PROP_AUTOFOCUS,
        "buffersize" | "buffer_size" => videoio::CAP_PROP_BUFFERSIZE,
        _ => return None,
    };
    Some(id)
}

impl CameraSource for OpenCvCamera {
    fn open(spec: &str) -> Result<Self> {
        // Parse spec as index if numeric, else try to open as path
        let cap = if let Ok(idx) = spec.parse::<i32>() {
            videoio::VideoCapture::new(idx, videoio::CAP_ANY)?
        } else {
            videoio::VideoCapture::from_file(spec, videoio::CAP_ANY)?
        };
        if !cap.is_opened()? {
            return Err(Error::NotFound(spec.to_string()));
        }
        debug!(spec, "opencv capture opened");
        Ok(Self {
            cap,
            spec: spec.to_string(),
        })
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.cap.is_opened()? {
            return Err(Error::FrameRead(format!("{} is not open", self.spec)));
        }
        let mut mat = core::Mat::default();
        let grabbed = self.cap.read(&mut mat)?;
        if !grabbed || mat.empty() {
            return Err(Error::FrameRead(format!("empty frame from {}", self.spec)));
        }

        let width = mat.cols() as u32;
        let height = mat.rows() as u32;
        let pixel_format = match mat.channels() {
            1 => PixelFormat::Gray8,
            3 => PixelFormat::Bgr8,
            n => return Err(Error::FrameRead(format!("unsupported channel count {n}"))),
        };
        let mat = if mat.is_continuous() {
            mat
        } else {
            mat.try_clone()?
        };
        let data = mat.data_bytes()?.to_vec();
        Ok(Frame {
            width,
            height,
            pixel_format,
            data,
            ts: Some(OffsetDateTime::now_utc()),
        })
    }

    fn set_property(&mut self, name: &str, value: f64) -> Result<()> {
        let id = property_id(name).ok_or(Error::Unsupported("unknown capture property"))?;
        if !self.cap.set(id, value)? {
            return Err(Error::Backend(format!(
                "{} rejected {name}={value}",
                self.spec
            )));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.cap.is_opened().unwrap_or(false)
    }

    fn release(&mut self) -> Result<()> {
        if self.cap.is_opened()? {
            self.cap.release()?;
            debug!(spec = %self.spec, "opencv capture released");
        }
        Ok(())
    }
}
