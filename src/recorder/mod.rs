//! Capture of the composite stream to a local FLV file
//!
//! Video is stored as Screen Video keyframes and audio as 16-bit PCM, so a
//! recording can be played without any codec beyond what FLV players ship.

pub mod config;
pub mod flv;
pub mod local;
pub mod screen_video;

pub use config::RecorderConfig;
pub use local::{LocalRecorder, RecorderEvent, RecorderState, RecordingArtifact};
