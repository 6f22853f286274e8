use crate::camera::CameraError;
use crate::frame::Frame;

/// Anything that can hand out grayscale frames on demand.
///
/// `capture` may block until the device delivers a frame; callers run it
/// off the async executor. An error is treated as a hardware fault.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Short identifier for logs.
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}
