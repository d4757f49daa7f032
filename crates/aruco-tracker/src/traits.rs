use crate::{Error, Frame, Result};

pub trait CameraSource {
    /// Open a camera source by device index or path string.
    fn open(spec: &str) -> Result<Self>
    where
        Self: Sized;

    /// Read a single frame.
    fn read(&mut self) -> Result<Frame>;

    /// Apply a capture property (e.g. "frame_width") before streaming.
    fn set_property(&mut self, name: &str, value: f64) -> Result<()> {
        let _ = (name, value);
        Err(Error::Unsupported("capture properties not supported"))
    }

    /// Whether the underlying handle is still held.
    fn is_open(&self) -> bool;

    /// Release the underlying handle. Releasing twice is a no-op.
    fn release(&mut self) -> Result<()>;
}
