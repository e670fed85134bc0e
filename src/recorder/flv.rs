//! FLV container writing
//!
//! ```text
//! +============+==================+==============+==================+
//! | FLV Header | PrevTagSize0 (0) | Tag 1        | PrevTagSize1 ... |
//! | (9 bytes)  | (4 bytes)        | (11+N bytes) | (4 bytes)        |
//! +============+==================+==============+==================+
//! ```
//!
//! The first tag is an `onMetaData` script tag. Its numeric fields whose
//! value is only known at the end (duration, frame size) are written as
//! placeholders and patched in place when the recording is finalized.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::error::{Error, Result};
use crate::media::{AudioChunk, Resolution, VideoFrame, AUDIO_SAMPLE_RATE};

use super::screen_video;

/// FLV file signature: "FLV" in ASCII
const FLV_SIGNATURE: [u8; 3] = [0x46, 0x4C, 0x56];

/// FLV version (always 1)
const FLV_VERSION: u8 = 0x01;

/// Type flags: bit 0 = video, bit 2 = audio
const FLV_TYPE_FLAGS_AV: u8 = 0x05;

/// FLV header is always 9 bytes
const FLV_HEADER_SIZE: u32 = 9;

/// Tag header is always 11 bytes
const TAG_HEADER_SIZE: u32 = 11;

/// Largest tag body the 24-bit DataSize field can describe
pub const MAX_TAG_DATA: usize = 0x00FF_FFFF;

/// Audio tag header: linear PCM little-endian (3), 44 kHz (3), 16-bit, mono
pub const AUDIO_PCM_HEADER: u8 = 0x3E;

/// Video tag header: keyframe (1), Screen Video (3)
pub const VIDEO_SCREEN_KEYFRAME: u8 = 0x13;

const AMF0_NUMBER: u8 = 0x00;
const AMF0_BOOLEAN: u8 = 0x01;
const AMF0_STRING: u8 = 0x02;
const AMF0_ECMA_ARRAY: u8 = 0x08;
const AMF0_OBJECT_END: u8 = 0x09;

/// FLV tag type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlvTagType {
    Audio = 8,
    Video = 9,
    Script = 18,
}

/// File header plus PreviousTagSize0
pub fn file_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(&FLV_SIGNATURE);
    buf.put_u8(FLV_VERSION);
    buf.put_u8(FLV_TYPE_FLAGS_AV);
    buf.put_u32(FLV_HEADER_SIZE);
    buf.put_u32(0);
    buf.freeze()
}

/// One tag with its trailing PreviousTagSize
///
/// Tag structure:
/// - Type (1B) + DataSize (3B BE) + Timestamp (3B + 1B ext) + StreamID (3B) + Data
/// - Followed by PreviousTagSize (4B BE) = 11 + data.len()
pub fn tag(tag_type: FlvTagType, timestamp: u32, data: &[u8]) -> Result<Bytes> {
    if data.len() > MAX_TAG_DATA {
        return Err(Error::RecorderUnavailable(format!(
            "{} byte tag exceeds the FLV limit of {}",
            data.len(),
            MAX_TAG_DATA
        )));
    }
    let size = data.len() as u32;
    let mut buf = BytesMut::with_capacity(data.len() + 15);

    buf.put_u8(tag_type as u8);
    buf.put_uint(size as u64, 3);
    // Lower 24 bits, then the extension byte
    buf.put_uint((timestamp & 0x00FF_FFFF) as u64, 3);
    buf.put_u8((timestamp >> 24) as u8);
    buf.put_uint(0, 3);
    buf.put_slice(data);
    buf.put_u32(TAG_HEADER_SIZE + size);
    Ok(buf.freeze())
}

/// Whether frames of `resolution` can be written as single keyframe tags
pub fn video_fits(resolution: Resolution) -> bool {
    let dimensions = 1..=screen_video::MAX_DIMENSION;
    dimensions.contains(&resolution.width)
        && dimensions.contains(&resolution.height)
        && 1 + screen_video::keyframe_len(resolution) <= MAX_TAG_DATA
}

/// Metadata value written into `onMetaData`
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Number(f64),
    Boolean(bool),
    String(String),
}

/// AMF0 `onMetaData` body
///
/// Returns the encoded body and, for every numeric entry, its key and the
/// byte offset of its 8-byte value within the body.
pub fn metadata(entries: &[(&str, MetaValue)]) -> (Bytes, Vec<(String, usize)>) {
    let mut buf = BytesMut::new();
    let mut offsets = Vec::new();

    buf.put_u8(AMF0_STRING);
    put_utf8(&mut buf, "onMetaData");

    buf.put_u8(AMF0_ECMA_ARRAY);
    buf.put_u32(entries.len() as u32);
    for (key, value) in entries {
        put_utf8(&mut buf, key);
        match value {
            MetaValue::Number(n) => {
                buf.put_u8(AMF0_NUMBER);
                offsets.push((key.to_string(), buf.len()));
                buf.put_f64(*n);
            }
            MetaValue::Boolean(b) => {
                buf.put_u8(AMF0_BOOLEAN);
                buf.put_u8(*b as u8);
            }
            MetaValue::String(s) => {
                buf.put_u8(AMF0_STRING);
                put_utf8(&mut buf, s);
            }
        }
    }
    buf.put_u16(0); // Empty key
    buf.put_u8(AMF0_OBJECT_END);

    (buf.freeze(), offsets)
}

fn put_utf8(buf: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

/// Totals reported when a file is finalized
#[derive(Debug, Clone, Default)]
pub struct FlvSummary {
    pub video_frames: u64,
    pub audio_chunks: u64,
    /// Timestamp of the last tag written, relative to the first
    pub last_timestamp_ms: u64,
    pub bytes_written: u64,
}

/// Streaming FLV writer for screen video and PCM audio
pub struct FlvWriter {
    path: PathBuf,
    file: BufWriter<File>,
    /// Absolute file offsets of patchable metadata numbers
    patch_points: Vec<(String, u64)>,
    first_timestamp: Option<u64>,
    width: u32,
    height: u32,
    summary: FlvSummary,
}

impl FlvWriter {
    /// Create the file and write the header and metadata
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).await?;
        let mut writer = Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            patch_points: Vec::new(),
            first_timestamp: None,
            width: 0,
            height: 0,
            summary: FlvSummary::default(),
        };

        let header = file_header();
        writer.write(&header).await?;

        let (body, offsets) = metadata(&[
            ("duration", MetaValue::Number(0.0)),
            ("width", MetaValue::Number(0.0)),
            ("height", MetaValue::Number(0.0)),
            ("videocodecid", MetaValue::Number(3.0)),
            ("audiocodecid", MetaValue::Number(3.0)),
            ("audiosamplerate", MetaValue::Number(AUDIO_SAMPLE_RATE as f64)),
            ("audiosamplesize", MetaValue::Number(16.0)),
            ("stereo", MetaValue::Boolean(false)),
            ("encoder", MetaValue::String("livecast".into())),
        ]);
        // Body starts after the 11-byte tag header
        let body_start = header.len() as u64 + TAG_HEADER_SIZE as u64;
        writer.patch_points = offsets
            .into_iter()
            .map(|(key, offset)| (key, body_start + offset as u64))
            .collect();
        writer.write(&tag(FlvTagType::Script, 0, &body)?).await?;

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn video_frames(&self) -> u64 {
        self.summary.video_frames
    }

    /// Span between the first and the latest tag written
    pub fn last_timestamp_ms(&self) -> u64 {
        self.summary.last_timestamp_ms
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        self.summary.bytes_written += data.len() as u64;
        Ok(())
    }

    fn relative_timestamp(&mut self, timestamp_ms: u64) -> u32 {
        let first = *self.first_timestamp.get_or_insert(timestamp_ms);
        let relative = timestamp_ms.saturating_sub(first);
        self.summary.last_timestamp_ms = self.summary.last_timestamp_ms.max(relative);
        relative.min(u32::MAX as u64) as u32
    }

    /// Append a video frame as a Screen Video keyframe
    ///
    /// Frames too large for one tag are rejected before anything is written.
    pub async fn write_video(&mut self, frame: &VideoFrame) -> Result<()> {
        if !video_fits(frame.resolution()) {
            return Err(Error::RecorderUnavailable(format!(
                "{}x{} frames cannot be recorded as screen video tags",
                frame.width, frame.height
            )));
        }
        let payload = screen_video::encode_keyframe(frame)?;
        let timestamp = self.relative_timestamp(frame.timestamp_ms);

        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(VIDEO_SCREEN_KEYFRAME);
        data.extend_from_slice(&payload);
        let bytes = tag(FlvTagType::Video, timestamp, &data)?;
        self.write(&bytes).await?;

        self.width = frame.width;
        self.height = frame.height;
        self.summary.video_frames += 1;
        Ok(())
    }

    /// Append a chunk of 16-bit PCM
    pub async fn write_audio(&mut self, chunk: &AudioChunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let timestamp = self.relative_timestamp(chunk.timestamp_ms);

        let mut data = Vec::with_capacity(chunk.len() * 2 + 1);
        data.push(AUDIO_PCM_HEADER);
        for sample in chunk.samples.iter() {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let bytes = tag(FlvTagType::Audio, timestamp, &data)?;
        self.write(&bytes).await?;

        self.summary.audio_chunks += 1;
        Ok(())
    }

    /// Flush, patch the metadata and close the file
    pub async fn finish(mut self, duration_ms: u64) -> Result<FlvSummary> {
        self.file.flush().await?;

        let values = [
            ("duration", duration_ms as f64 / 1000.0),
            ("width", self.width as f64),
            ("height", self.height as f64),
        ];
        let mut file = self.file.into_inner();
        for (key, value) in values {
            if let Some((_, offset)) = self.patch_points.iter().find(|(k, _)| k == key) {
                file.seek(SeekFrom::Start(*offset)).await?;
                file.write_all(&value.to_be_bytes()).await?;
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(self.summary)
    }
}
