//! Dualview compositor
//!
//! Receives the two emulated LCDs (plus background and overlay planes) from
//! the producer over shared memory and composes them onto one display
//! according to the active layout.

pub mod backend;
pub mod blend;
pub mod compositor;
pub mod config;
pub mod layout;
pub mod pixels;
pub mod platform;
pub mod transform;

pub use compositor::{Compositor, CompositorSettings, ConsumerState, Step};
pub use config::Config;
