//! Backing memory for the transport: a POSIX shared memory mapping between
//! the two processes, or a heap block shared between threads of one process.

use crate::protocol::SharedFrame;
use crate::transport::TransportError;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, MsFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::alloc::{self, Layout};
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info, warn};

const REGION_LEN: NonZeroUsize = match NonZeroUsize::new(SharedFrame::size()) {
    Some(len) => len,
    None => panic!("shared frame has zero size"),
};

enum Backing {
    Mapped { name: String },
    Heap(Arc<HeapFrame>),
}

/// Zeroed heap allocation standing in for the mapping.
struct HeapFrame(NonNull<SharedFrame>);

// SAFETY: the block is only reached through `SharedRegion`, whose users follow
// the single-writer-per-field discipline of the transport.
unsafe impl Send for HeapFrame {}
unsafe impl Sync for HeapFrame {}

impl Drop for HeapFrame {
    fn drop(&mut self) {
        // SAFETY: allocated in `heap_pair` with this layout; the last `Arc`
        // owner frees it exactly once.
        unsafe { alloc::dealloc(self.0.as_ptr().cast(), Layout::new::<SharedFrame>()) }
    }
}

/// One view of the shared frame. Unmapped on drop.
pub struct SharedRegion {
    frame: NonNull<SharedFrame>,
    backing: Backing,
}

// SAFETY: see `HeapFrame`; a mapping may be used from any one thread at a time.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Create (or reuse) the named region and reset its `valid` flag.
    ///
    /// The producer calls this; it owns the name and unlinks it on shutdown.
    pub fn create(name: &str) -> Result<Self, TransportError> {
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);
        file.set_len(SharedFrame::size() as u64)?;

        let region = Self::map(name, &file)?;
        region.valid_flag().store(0, Ordering::Release);

        info!("Created shared region {} ({} bytes)", name, SharedFrame::size());
        Ok(region)
    }

    /// Map a region the producer already created.
    pub fn open(name: &str) -> Result<Self, TransportError> {
        let fd = mman::shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);

        let len = file.metadata()?.len();
        let expected = SharedFrame::size() as u64;
        if len < expected {
            return Err(TransportError::RegionTooSmall { len, expected });
        }

        let region = Self::map(name, &file)?;
        info!("Opened shared region {}", name);
        Ok(region)
    }

    fn map(name: &str, file: &File) -> Result<Self, TransportError> {
        // SAFETY: a fresh shared mapping of a file sized to `REGION_LEN`; no
        // Rust reference aliases it yet.
        let ptr = unsafe {
            mman::mmap(
                None,
                REGION_LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };

        Ok(Self {
            frame: ptr.cast(),
            backing: Backing::Mapped { name: name.to_owned() },
        })
    }

    /// Two views of one zeroed heap block, for running both ends in one process.
    pub fn heap_pair() -> (Self, Self) {
        let layout = Layout::new::<SharedFrame>();
        // All-zero bytes are a valid `SharedFrame`: empty flag, no command.
        // SAFETY: `SharedFrame` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) }.cast::<SharedFrame>();
        let Some(frame) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout)
        };

        let block = Arc::new(HeapFrame(frame));
        let first = Self {
            frame,
            backing: Backing::Heap(block.clone()),
        };
        let second = Self {
            frame,
            backing: Backing::Heap(block),
        };
        (first, second)
    }

    /// Raw pointer to the frame. Fields other than `valid` must be accessed
    /// through `ptr::addr_of!`, never through a reference to the whole frame.
    pub fn as_ptr(&self) -> *mut SharedFrame {
        self.frame.as_ptr()
    }

    /// The synchronization flag.
    pub fn valid_flag(&self) -> &AtomicU8 {
        // SAFETY: the frame outlives `self`; atomics may be shared freely.
        unsafe { &(*self.frame.as_ptr()).valid }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Mapped { name } => Some(name),
            Backing::Heap(_) => None,
        }
    }

    /// Write dirty lines back so the other side sees the payload.
    pub fn flush(&self) -> Result<(), TransportError> {
        self.sync(MsFlags::MS_SYNC)
    }

    /// Drop stale lines before reading what the other side wrote.
    pub fn invalidate(&self) -> Result<(), TransportError> {
        self.sync(MsFlags::MS_SYNC | MsFlags::MS_INVALIDATE)
    }

    fn sync(&self, flags: MsFlags) -> Result<(), TransportError> {
        if let Backing::Mapped { .. } = self.backing {
            // SAFETY: `frame` is the start of a live mapping of this length.
            unsafe { mman::msync(self.frame.cast(), SharedFrame::size(), flags)? };
        }
        Ok(())
    }

    /// Remove the name so no new process can map it. Existing mappings stay valid.
    pub fn unlink(&self) -> Result<(), TransportError> {
        if let Backing::Mapped { name } = &self.backing {
            mman::shm_unlink(name.as_str())?;
            info!("Unlinked shared region {}", name);
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Mapped { name } = &self.backing {
            // SAFETY: the mapping is ours and nothing borrows it past `drop`.
            match unsafe { mman::munmap(self.frame.cast(), SharedFrame::size()) } {
                Ok(()) => debug!("Unmapped shared region {}", name),
                Err(e) => warn!("Failed to unmap shared region {}: {}", name, e),
            }
        }
    }
}
