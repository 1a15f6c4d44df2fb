use image::RgbImage;

use crate::error::CaptureError;

/// One captured screen frame.
pub type Frame = RgbImage;

/// Seam between the capture loop and the platform screen grabber.
///
/// Implementations are injected at pipeline construction; the loop
/// tolerates both transient failures (`Err`, logged and retried next
/// tick) and "nothing ready yet" (`Ok(None)`, short sleep).
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<Option<Frame>, CaptureError>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Result<Option<Frame>, CaptureError> + Send,
{
    fn grab(&mut self) -> Result<Option<Frame>, CaptureError> {
        self()
    }
}
