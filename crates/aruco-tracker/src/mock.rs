use std::collections::VecDeque;

use crate::dictionary::{Dictionary, DictionaryName};
use crate::render::Scene;
use crate::{CameraSource, Error, Frame, Result};
use time::OffsetDateTime;

/// Marker id drawn by the synthetic camera.
pub const MOCK_MARKER_ID: u32 = 7;

/// Synthetic camera. Opened from a device string it renders a DICT_4X4_50
/// marker drifting across a white background; built from frames it replays
/// them once.
pub struct MockCamera {
    counter: u64,
    width: u32,
    height: u32,
    queued: Option<VecDeque<Frame>>,
    open: bool,
}

impl MockCamera {
    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            counter: 0,
            width: 320,
            height: 240,
            queued: Some(frames.into_iter().collect()),
            open: true,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.counter
    }

    fn render(&self) -> Result<Frame> {
        let dict = Dictionary::builtin(DictionaryName::Dict4x4_50)?;
        let (w, h) = (f64::from(self.width), f64::from(self.height));
        let side = 0.4 * w.min(h);
        let phase = self.counter as f64 * 0.15;
        let center = [
            w / 2.0 + 0.15 * w * phase.cos(),
            h / 2.0 + 0.1 * h * phase.sin(),
        ];
        let img = Scene::new(self.width, self.height)
            .with_square_marker(&dict, MOCK_MARKER_ID, center, side)?
            .render();
        Ok(Frame::from_gray(img))
    }
}

impl CameraSource for MockCamera {
    /// The device string is ignored; every device opens the same synthetic camera.
    fn open(_spec: &str) -> Result<Self> {
        Ok(Self {
            counter: 0,
            width: 320,
            height: 240,
            queued: None,
            open: true,
        })
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(Error::FrameRead("mock camera released".into()));
        }
        let mut frame = match self.queued.as_mut() {
            Some(q) => q
                .pop_front()
                .ok_or_else(|| Error::FrameRead("mock camera has no more frames".into()))?,
            None => self.render()?,
        };
        self.counter += 1;
        if frame.ts.is_none() {
            frame.ts = Some(OffsetDateTime::now_utc());
        }
        Ok(frame)
    }

    fn set_property(&mut self, name: &str, value: f64) -> Result<()> {
        let px = || {
            if value.is_finite() && value >= 16.0 && value <= 8192.0 {
                Ok(value as u32)
            } else {
                Err(Error::Config(format!("{name} out of range: {value}")))
            }
        };
        match name {
            "frame_width" => self.width = px()?,
            "frame_height" => self.height = px()?,
            _ => return Err(Error::Unsupported("mock camera only sizes its frames")),
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn release(&mut self) -> Result<()> {
        self.open = false;
        self.queued = None;
        Ok(())
    }
}
