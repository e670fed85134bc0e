//! Camera and screen compositing
//!
//! ```text
//!   camera ─┐                       ┌──► video track ──► peer links
//!           ├─► tick: layout plan ──┤                    recorder
//!   screen ─┘   + label + mark      └──► audio track (mixed)
//! ```

pub mod canvas;
pub mod config;
pub mod engine;
pub mod layout;

pub use canvas::{Canvas, PLACEHOLDER_RGBA, WATERMARK_RGBA};
pub use config::CompositorConfig;
pub use engine::StreamCompositor;
pub use layout::{ActiveSources, Layout, Placement, Rect};
