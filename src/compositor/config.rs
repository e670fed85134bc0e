//! Compositor configuration

use crate::media::{CaptureSource, Resolution};

use super::layout::{ActiveSources, Layout};

/// Everything the compositor reads on each tick
///
/// Sources, layout, overlay and watermark can change while live. Output
/// resolution and frame rate are fixed once the compositor is constructed.
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    /// Camera capture, if enabled
    pub camera: Option<CaptureSource>,

    /// Screen capture, if enabled
    pub screen: Option<CaptureSource>,

    /// Arrangement of the sources
    pub layout: Layout,

    /// Label drawn in the lower-left corner
    pub overlay_text: Option<String>,

    /// Draw the corner mark
    pub watermark_enabled: bool,

    /// Output frame size
    pub output_resolution: Resolution,

    /// Output frames per second
    pub output_frame_rate: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            camera: None,
            screen: None,
            layout: Layout::SoloCamera,
            overlay_text: None,
            watermark_enabled: true,
            output_resolution: Resolution::HD,
            output_frame_rate: 30,
        }
    }
}

impl CompositorConfig {
    /// Set the camera source
    pub fn camera(mut self, source: CaptureSource) -> Self {
        self.camera = Some(source);
        self
    }

    /// Set the screen source
    pub fn screen(mut self, source: CaptureSource) -> Self {
        self.screen = Some(source);
        self
    }

    /// Set the layout
    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the overlay label
    pub fn overlay_text(mut self, text: impl Into<String>) -> Self {
        self.overlay_text = Some(text.into());
        self
    }

    /// Enable or disable the watermark
    pub fn watermark(mut self, enabled: bool) -> Self {
        self.watermark_enabled = enabled;
        self
    }

    /// Set the output resolution
    pub fn output_resolution(mut self, resolution: Resolution) -> Self {
        self.output_resolution = resolution;
        self
    }

    /// Set the output frame rate (at least 1)
    pub fn output_frame_rate(mut self, fps: u32) -> Self {
        self.output_frame_rate = fps.max(1);
        self
    }

    /// Sources that are configured and still live
    pub fn active_sources(&self) -> ActiveSources {
        ActiveSources::resolve(self.camera.as_ref(), self.screen.as_ref())
    }
}
