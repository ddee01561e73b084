//! Capture → encode → fan-out pipeline for MJPEG viewers.
//!
//! ```text
//! CameraSource ──(broadcaster thread)──▶ FeedState slot ──▶ ClientSession × N
//! ```
//!
//! [`FrameBroadcaster::spawn`] takes the camera and an encoder and returns a
//! [`Feed`]; every HTTP viewer calls [`Feed::subscribe`] and streams the
//! resulting [`ClientSession`].

pub mod broadcaster;
pub mod camera;
pub mod encoder;
pub mod multipart;
pub mod session;

pub use broadcaster::{
    BroadcastSettings, CloseReason, Feed, FeedClosed, FeedState, FeedStats, FrameBroadcaster,
};
pub use camera::{CameraError, CameraSettings, CameraSource, CaptureError, RawFrame};
pub use encoder::{EncodeError, FrameEncoder, JpegEncoder};
pub use session::{ClientSession, ClientWriteError, SessionEnd, SessionState, Subscriber};
