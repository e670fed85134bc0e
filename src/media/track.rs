//! Media tracks and streams
//!
//! A [`MediaTrack`] is a single-kind fan-out channel built on
//! `tokio::sync::broadcast`: the producer sends [`MediaFrame`]s and every
//! consumer (peer links, the recorder) holds its own receiver. A
//! [`MediaStream`] groups tracks under a stable identity. Cloning either type
//! clones a handle, never the underlying channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::frame::MediaFrame;

/// Default number of frames buffered per track before slow receivers lag
pub const DEFAULT_TRACK_CAPACITY: usize = 64;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Codec parameters negotiated for a track
///
/// Two tracks can replace each other on a live link without renegotiation
/// only when kind and profile both match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecProfile {
    pub codec: String,
    pub clock_rate: u32,
}

impl CodecProfile {
    pub fn new(codec: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            codec: codec.into(),
            clock_rate,
        }
    }

    /// Uncompressed RGBA video
    pub fn raw_video() -> Self {
        Self::new("raw-rgba", 90_000)
    }

    /// 16-bit PCM audio
    pub fn pcm_audio() -> Self {
        Self::new("pcm-s16", super::frame::AUDIO_SAMPLE_RATE)
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    profile: CodecProfile,
    tx: broadcast::Sender<MediaFrame>,
}

/// Handle to a single media track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track with the default buffer capacity
    pub fn new(kind: TrackKind, profile: CodecProfile) -> Self {
        Self::with_capacity(kind, profile, DEFAULT_TRACK_CAPACITY)
    }

    pub fn with_capacity(kind: TrackKind, profile: CodecProfile, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                profile,
                tx,
            }),
        }
    }

    /// Raw RGBA video track
    pub fn video() -> Self {
        Self::new(TrackKind::Video, CodecProfile::raw_video())
    }

    /// PCM audio track
    pub fn audio() -> Self {
        Self::new(TrackKind::Audio, CodecProfile::pcm_audio())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn profile(&self) -> &CodecProfile {
        &self.inner.profile
    }

    /// Whether `other` can replace this track without renegotiating
    pub fn is_compatible(&self, other: &MediaTrack) -> bool {
        self.kind() == other.kind() && self.profile() == other.profile()
    }

    /// Send a frame to all receivers
    ///
    /// Returns the number of receivers, or 0 if there are none. Never blocks.
    pub fn send(&self, frame: MediaFrame) -> usize {
        self.inner.tx.send(frame).unwrap_or(0)
    }

    /// Subscribe to frames sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("profile", &self.inner.profile)
            .finish()
    }
}

/// A group of tracks with a stable identity
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: Arc<str>,
    tracks: Arc<[MediaTrack]>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string().into(),
            tracks: tracks.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First track of the given kind
    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.track(TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.track(TrackKind::Audio)
    }

    /// Whether both handles refer to the same stream
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::{AudioChunk, MediaFrame};

    #[tokio::test]
    async fn test_track_fan_out() {
        let track = MediaTrack::audio();
        let mut rx1 = track.subscribe();
        let mut rx2 = track.subscribe();

        let sent = track.send(MediaFrame::Audio(AudioChunk::new(10, vec![1, 2, 3])));
        assert_eq!(sent, 2);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                MediaFrame::Audio(chunk) => assert_eq!(chunk.len(), 3),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[test]
    fn test_send_without_receivers() {
        let track = MediaTrack::video();
        assert_eq!(track.receiver_count(), 0);
        assert_eq!(
            track.send(MediaFrame::Audio(AudioChunk::new(0, Vec::new()))),
            0
        );
    }

    #[test]
    fn test_compatibility() {
        let a = MediaTrack::video();
        let b = MediaTrack::video();
        let c = MediaTrack::audio();
        let d = MediaTrack::new(TrackKind::Video, CodecProfile::new("vp8", 90_000));

        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
        assert!(!a.is_compatible(&d));
    }

    #[test]
    fn test_stream_identity() {
        let stream = MediaStream::new(vec![MediaTrack::video(), MediaTrack::audio()]);
        let clone = stream.clone();
        assert!(stream.same_stream(&clone));
        assert_eq!(stream.video_track().unwrap().kind(), TrackKind::Video);
        assert_eq!(stream.audio_track().unwrap().kind(), TrackKind::Audio);

        let other = MediaStream::new(Vec::new());
        assert!(!stream.same_stream(&other));
        assert!(other.video_track().is_none());
    }
}
