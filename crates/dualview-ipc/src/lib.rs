//! Dualview frame transport
//!
//! Shared types and the single-slot shared memory channel between the
//! producer (the process hosting the emulator's video hook) and the
//! compositor process that owns the display.

pub mod config;
pub mod protocol;
pub mod shm;
pub mod transport;

pub use config::{CacheMode, TransportConfig};
pub use protocol::{Command, CommandKind, FilterMode, Flush, Rect, SharedFrame, SurfaceId};
pub use shm::SharedRegion;
pub use transport::{DecodeError, Transport, TransportError};

/// Default shared memory object name, one per user so two sessions never collide.
pub fn default_shm_name() -> String {
    format!("/dualview-{}", nix::unistd::getuid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shm_name_is_per_user() {
        let name = default_shm_name();
        assert_eq!(name, format!("/dualview-{}", nix::unistd::getuid().as_raw()));
        assert!(!name[1..].contains('/'));
    }
}
