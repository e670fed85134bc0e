//! Layout geometry
//!
//! A layout plus the output resolution yields an ordered list of
//! placements: which source goes into which rectangle, in draw order. The
//! compositor resolves each placement against the sources that are
//! currently active.

use serde::{Deserialize, Serialize};

use crate::media::{CaptureSource, Resolution, SourceKind};

/// Inset size as a fraction of the frame (1/4 of width and height)
pub const PIP_DIVISOR: u32 = 4;

/// How the camera and screen are arranged in the output frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    SoloCamera,
    SoloScreen,
    /// Screen fills the frame, camera in the inset
    PipCameraSmall,
    /// Camera fills the frame, screen in the inset
    PipScreenSmall,
    SideBySide,
    Stacked,
}

impl Default for Layout {
    fn default() -> Self {
        Layout::SoloCamera
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Layout::SoloCamera => "solo-camera",
            Layout::SoloScreen => "solo-screen",
            Layout::PipCameraSmall => "pip-camera-small",
            Layout::PipScreenSmall => "pip-screen-small",
            Layout::SideBySide => "side-by-side",
            Layout::Stacked => "stacked",
        };
        f.write_str(name)
    }
}

/// Which capture sources are live this tick
#[derive(Debug, Clone)]
pub enum ActiveSources {
    None,
    CameraOnly(CaptureSource),
    ScreenOnly(CaptureSource),
    Both {
        camera: CaptureSource,
        screen: CaptureSource,
    },
}

impl ActiveSources {
    /// Classify the configured sources; ended captures count as absent
    pub fn resolve(camera: Option<&CaptureSource>, screen: Option<&CaptureSource>) -> Self {
        let camera = camera.filter(|s| s.is_live()).cloned();
        let screen = screen.filter(|s| s.is_live()).cloned();
        match (camera, screen) {
            (None, None) => ActiveSources::None,
            (Some(camera), None) => ActiveSources::CameraOnly(camera),
            (None, Some(screen)) => ActiveSources::ScreenOnly(screen),
            (Some(camera), Some(screen)) => ActiveSources::Both { camera, screen },
        }
    }

    pub fn camera(&self) -> Option<&CaptureSource> {
        match self {
            ActiveSources::CameraOnly(camera) | ActiveSources::Both { camera, .. } => Some(camera),
            _ => None,
        }
    }

    pub fn screen(&self) -> Option<&CaptureSource> {
        match self {
            ActiveSources::ScreenOnly(screen) | ActiveSources::Both { screen, .. } => Some(screen),
            _ => None,
        }
    }

    pub fn get(&self, kind: SourceKind) -> Option<&CaptureSource> {
        match kind {
            SourceKind::Camera => self.camera(),
            SourceKind::Screen => self.screen(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ActiveSources::None)
    }
}

/// Pixel rectangle within the output frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(resolution: Resolution) -> Self {
        Self::new(0, 0, resolution.width, resolution.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// One source drawn into one rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub source: SourceKind,
    pub rect: Rect,
}

/// Distance kept from the frame edges for insets, labels and the watermark
pub fn safe_margin(resolution: Resolution) -> u32 {
    (resolution.height / 24).max(1)
}

/// Bottom-right inset rectangle used by the PiP layouts
pub fn pip_inset(resolution: Resolution) -> Rect {
    let width = (resolution.width / PIP_DIVISOR).max(1);
    let height = (resolution.height / PIP_DIVISOR).max(1);
    let margin = safe_margin(resolution);
    Rect::new(
        resolution.width.saturating_sub(width + margin),
        resolution.height.saturating_sub(height + margin),
        width,
        height,
    )
}

/// Placements for `layout` in draw order
pub fn plan(layout: Layout, resolution: Resolution) -> Vec<Placement> {
    let full = Rect::full(resolution);
    let (w, h) = (resolution.width, resolution.height);

    match layout {
        Layout::SoloCamera => vec![Placement {
            source: SourceKind::Camera,
            rect: full,
        }],
        Layout::SoloScreen => vec![Placement {
            source: SourceKind::Screen,
            rect: full,
        }],
        Layout::PipCameraSmall => vec![
            Placement {
                source: SourceKind::Screen,
                rect: full,
            },
            Placement {
                source: SourceKind::Camera,
                rect: pip_inset(resolution),
            },
        ],
        Layout::PipScreenSmall => vec![
            Placement {
                source: SourceKind::Camera,
                rect: full,
            },
            Placement {
                source: SourceKind::Screen,
                rect: pip_inset(resolution),
            },
        ],
        Layout::SideBySide => vec![
            Placement {
                source: SourceKind::Camera,
                rect: Rect::new(0, 0, w / 2, h),
            },
            Placement {
                source: SourceKind::Screen,
                rect: Rect::new(w / 2, 0, w - w / 2, h),
            },
        ],
        Layout::Stacked => vec![
            Placement {
                source: SourceKind::Camera,
                rect: Rect::new(0, 0, w, h / 2),
            },
            Placement {
                source: SourceKind::Screen,
                rect: Rect::new(0, h / 2, w, h - h / 2),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::capture_channel;

    #[test]
    fn test_active_sources_variants() {
        let (_cam_feed, camera) = capture_channel(SourceKind::Camera);
        let (screen_feed, screen) = capture_channel(SourceKind::Screen);

        assert!(ActiveSources::resolve(None, None).is_none());
        assert!(matches!(
            ActiveSources::resolve(Some(&camera), None),
            ActiveSources::CameraOnly(_)
        ));
        assert!(matches!(
            ActiveSources::resolve(None, Some(&screen)),
            ActiveSources::ScreenOnly(_)
        ));
        let both = ActiveSources::resolve(Some(&camera), Some(&screen));
        assert!(matches!(both, ActiveSources::Both { .. }));
        assert_eq!(both.get(SourceKind::Screen).unwrap().id(), screen.id());

        // An ended capture no longer counts
        screen_feed.end();
        assert!(matches!(
            ActiveSources::resolve(Some(&camera), Some(&screen)),
            ActiveSources::CameraOnly(_)
        ));
    }

    #[test]
    fn test_split_layouts_cover_frame() {
        let res = Resolution::new(101, 51);

        let side = plan(Layout::SideBySide, res);
        assert_eq!(side[0].rect.width + side[1].rect.width, 101);
        assert_eq!(side[1].rect.x, side[0].rect.width);

        let stacked = plan(Layout::Stacked, res);
        assert_eq!(stacked[0].rect.height + stacked[1].rect.height, 51);
        assert_eq!(stacked[1].source, SourceKind::Screen);
    }

    #[test]
    fn test_pip_inset_bottom_right_quarter() {
        let res = Resolution::new(1280, 720);
        let inset = pip_inset(res);
        assert_eq!(inset.width, 320);
        assert_eq!(inset.height, 180);
        assert_eq!(inset.x + inset.width + safe_margin(res), 1280);
        assert_eq!(inset.y + inset.height + safe_margin(res), 720);

        let pip = plan(Layout::PipCameraSmall, res);
        assert_eq!(pip[0].source, SourceKind::Screen);
        assert_eq!(pip[1].source, SourceKind::Camera);
        assert_eq!(pip[1].rect, inset);
    }

    #[test]
    fn test_layout_names() {
        assert_eq!(Layout::PipScreenSmall.to_string(), "pip-screen-small");
        let json = serde_json::to_string(&Layout::SideBySide).unwrap();
        assert_eq!(json, "\"side-by-side\"");
    }
}
