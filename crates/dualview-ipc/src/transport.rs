//! Single-slot rendezvous channel over a [`SharedRegion`].
//!
//! The producer only writes while `valid == 0` and finishes by storing 1 with
//! release ordering; the consumer only reads after an acquire load sees 1 and
//! finishes by storing 0. No other synchronization is used: correctness rests
//! on there being exactly one producer and one consumer.

use crate::config::{CacheMode, TransportConfig};
use crate::protocol::{
    Command, CommandKind, FilterMode, Flush, MAX_PAYLOAD, Rect, SurfaceId,
};
use crate::shm::SharedRegion;
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Errors raised by [`Transport::publish`] and region setup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport busy: previous command not yet consumed")]
    Busy,
    #[error("transport closed by quit")]
    Closed,
    #[error("payload of {len} bytes exceeds the {max} byte region")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("shared region is {len} bytes, expected {expected}")]
    RegionTooSmall { len: u64, expected: u64 },
    #[error("shared memory call failed: {0}")]
    Map(#[from] nix::Error),
    #[error("shared memory I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Header bytes that do not describe a valid command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown command discriminant {0}")]
    UnknownCommand(u8),
    #[error("unknown surface id {0}")]
    UnknownSurface(u8),
    #[error("unknown filter mode {0}")]
    UnknownFilter(u8),
    #[error("payload length {0} exceeds the region")]
    BadLength(u32),
}

/// One end of the frame channel.
pub struct Transport {
    region: SharedRegion,
    cache: CacheMode,
    closed: bool,
}

impl Transport {
    pub fn new(region: SharedRegion, cache: CacheMode) -> Self {
        Self {
            region,
            cache,
            closed: false,
        }
    }

    /// Producer side: create the named region.
    pub fn create(config: &TransportConfig) -> Result<Self, TransportError> {
        let region = SharedRegion::create(&config.shm_name)?;
        Ok(Self::new(region, config.cache))
    }

    /// Consumer side: map the region created by the producer.
    pub fn open(config: &TransportConfig) -> Result<Self, TransportError> {
        let region = SharedRegion::open(&config.shm_name)?;
        Ok(Self::new(region, config.cache))
    }

    /// `(producer, consumer)` ends over one heap block.
    pub fn loopback() -> (Self, Self) {
        let (a, b) = SharedRegion::heap_pair();
        (
            Self::new(a, CacheMode::Coherent),
            Self::new(b, CacheMode::Coherent),
        )
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// A command is pending.
    pub fn is_busy(&self) -> bool {
        self.region.valid_flag().load(Ordering::Acquire) != 0
    }

    /// Quit went through this end; nothing more may be published.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `command` and its payload, then mark the slot valid.
    ///
    /// Fails with [`TransportError::Busy`] without touching the region if the
    /// previous command has not been consumed.
    pub fn publish(&mut self, command: &Command<'_>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let len = command.payload_len();
        if len > MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD,
            });
        }

        let valid = self.region.valid_flag();
        if valid.load(Ordering::Acquire) != 0 {
            return Err(TransportError::Busy);
        }

        let (surface, filter, pitch, alpha, src, dst, pixels) = match command {
            Command::Flush(flush) => (
                flush.surface as u8,
                flush.filter as u8,
                flush.pitch,
                flush.alpha,
                flush.src,
                flush.dst,
                flush.pixels,
            ),
            Command::Flip | Command::Quit => {
                (0, 0, 0, 0, Rect::default(), Rect::default(), &[][..])
            }
        };

        let frame = self.region.as_ptr();
        // SAFETY: `valid == 0`, so the consumer is not reading any of these
        // fields and this end is their only writer.
        unsafe {
            addr_of_mut!((*frame).command).write(command.kind() as u8);
            addr_of_mut!((*frame).surface_id).write(surface);
            addr_of_mut!((*frame).filter_mode).write(filter);
            addr_of_mut!((*frame).pitch).write(pitch);
            addr_of_mut!((*frame).alpha).write(alpha);
            addr_of_mut!((*frame).src).write(src);
            addr_of_mut!((*frame).dst).write(dst);
            addr_of_mut!((*frame).len).write(len as u32);
            std::ptr::copy_nonoverlapping(
                pixels.as_ptr(),
                addr_of_mut!((*frame).payload).cast::<u8>(),
                len,
            );
        }

        if self.cache == CacheMode::Flush {
            self.region.flush()?;
        }
        valid.store(1, Ordering::Release);

        trace!("Published {:?} ({} payload bytes)", command.kind(), len);
        if command.kind() == CommandKind::Quit {
            debug!("Quit published, transport closed for writing");
            self.closed = true;
        }
        Ok(())
    }

    /// The pending command, left in place. `None` while the slot is empty.
    pub fn poll(&self) -> Option<Result<Command<'_>, DecodeError>> {
        if self.region.valid_flag().load(Ordering::Acquire) == 0 {
            return None;
        }
        if self.cache == CacheMode::Flush {
            if let Err(e) = self.region.invalidate() {
                warn!("Cache invalidate before read failed: {}", e);
            }
        }
        // SAFETY: the acquire load above saw `valid == 1`; the producer will
        // not write again until `consume` runs, which needs `&mut self`.
        Some(unsafe { self.decode() })
    }

    unsafe fn decode(&self) -> Result<Command<'_>, DecodeError> {
        let frame = self.region.as_ptr();
        unsafe {
            let kind = addr_of!((*frame).command).read();
            match CommandKind::try_from(kind).map_err(DecodeError::UnknownCommand)? {
                CommandKind::Flip => Ok(Command::Flip),
                CommandKind::Quit => Ok(Command::Quit),
                CommandKind::Flush => {
                    let surface = SurfaceId::try_from(addr_of!((*frame).surface_id).read())
                        .map_err(DecodeError::UnknownSurface)?;
                    let filter = FilterMode::try_from(addr_of!((*frame).filter_mode).read())
                        .map_err(DecodeError::UnknownFilter)?;
                    let len = addr_of!((*frame).len).read();
                    if len as usize > MAX_PAYLOAD {
                        return Err(DecodeError::BadLength(len));
                    }
                    let pixels = std::slice::from_raw_parts(
                        addr_of!((*frame).payload).cast::<u8>(),
                        len as usize,
                    );
                    Ok(Command::Flush(Flush {
                        surface,
                        pixels,
                        src: addr_of!((*frame).src).read(),
                        dst: addr_of!((*frame).dst).read(),
                        pitch: addr_of!((*frame).pitch).read(),
                        filter,
                        alpha: addr_of!((*frame).alpha).read(),
                    }))
                }
            }
        }
    }

    /// Release the slot back to the producer. Does nothing if it is empty.
    pub fn consume(&mut self) {
        let valid = self.region.valid_flag();
        if valid.load(Ordering::Acquire) == 0 {
            return;
        }
        if self.cache == CacheMode::Flush {
            if let Err(e) = self.region.invalidate() {
                warn!("Cache invalidate on consume failed: {}", e);
            }
        }

        // SAFETY: still `valid == 1`, the producer is not writing.
        let kind = unsafe { addr_of!((*self.region.as_ptr()).command).read() };
        valid.store(0, Ordering::Release);

        if kind == CommandKind::Quit as u8 {
            debug!("Quit consumed, transport closed");
            self.closed = true;
        }
    }

    /// Remove the region's name (producer, at shutdown).
    pub fn unlink(&self) -> Result<(), TransportError> {
        self.region.unlink()
    }
}
