//! Media primitives shared by the compositor, peer links and recorder
//!
//! This module provides:
//! - Raw video/audio frame types
//! - Media tracks and streams with broadcast fan-out
//! - Capture sources and a synthetic capture backend

pub mod frame;
pub mod source;
pub mod track;

pub use frame::{AudioChunk, MediaFrame, Resolution, VideoFrame, AUDIO_SAMPLE_RATE};
pub use source::{
    capture_channel, CaptureBackend, CaptureFeed, CaptureHandle, CaptureSource, SourceKind,
    SyntheticCapture,
};
pub use track::{CodecProfile, MediaStream, MediaTrack, TrackKind};
