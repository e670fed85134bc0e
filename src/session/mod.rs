//! Live sessions and the broadcaster's studio

pub mod registry;
pub mod studio;

pub use registry::{MemorySessionRegistry, SessionRegistry, StreamSession};
pub use studio::{BroadcastStudio, StudioConfig};
