//! Platform bring-up for the display backends.

pub mod fbdev;
pub mod glx;

pub use fbdev::Framebuffer;
pub use glx::GlxWindow;
