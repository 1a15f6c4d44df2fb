mod controller;
mod recorder;
pub mod screen;
pub mod source;
pub mod writer;

pub use controller::{CaptureController, CaptureState};
pub use recorder::SegmentSink;
pub use screen::PrimaryMonitorSource;
pub use source::{Frame, FrameSource};
