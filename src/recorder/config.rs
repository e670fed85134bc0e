//! Recorder configuration

use std::path::PathBuf;

use crate::media::Resolution;

/// Where and how recordings are written
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Directory that receives recording files
    pub output_dir: PathBuf,

    /// File name prefix; files are named `<prefix>-<uuid>.flv`
    pub file_prefix: String,

    /// Size of the frames that will be recorded, when known in advance
    pub frame_size: Option<Resolution>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir(),
            file_prefix: "livecast".into(),
            frame_size: None,
        }
    }
}

impl RecorderConfig {
    /// Set the output directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the file name prefix
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Declare the frame size so unrecordable sizes fail at start
    pub fn frame_size(mut self, resolution: Resolution) -> Self {
        self.frame_size = Some(resolution);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = RecorderConfig::default()
            .output_dir("/var/recordings")
            .file_prefix("river")
            .frame_size(Resolution::new(640, 360));

        assert_eq!(config.output_dir, PathBuf::from("/var/recordings"));
        assert_eq!(config.file_prefix, "river");
        assert_eq!(config.frame_size, Some(Resolution::new(640, 360)));
        assert_eq!(RecorderConfig::default().frame_size, None);
        assert_eq!(RecorderConfig::default().file_prefix, "livecast");
    }
}
