//! rollgate-hw: Hardware abstraction for the attendance station.
//!
//! Provides V4L2-based camera access, frame quality metrics and a
//! line-oriented RFID card reader.

pub mod camera;
pub mod frame;
pub mod reader;
pub mod source;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::Frame;
pub use reader::{CardReader, ReaderError};
pub use source::FrameSource;
