//! Linux framebuffer device as a present target for the software backend.
//!
//! Double buffers by doubling `yres_virtual` and panning when the driver
//! allows it; otherwise writes straight into the visible page.

use crate::backend::{BackendError, PresentTarget};
use crate::pixels::xrgb_to_rgb565;
use anyhow::{Context, Result, bail};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, info, warn};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    kind: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

impl Default for FbFixScreeninfo {
    fn default() -> Self {
        // SAFETY: plain integers, all-zero is a valid value
        unsafe { std::mem::zeroed() }
    }
}

nix::ioctl_read_bad!(fbioget_vscreeninfo, 0x4600, FbVarScreeninfo);
nix::ioctl_write_ptr_bad!(fbioput_vscreeninfo, 0x4601, FbVarScreeninfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, 0x4602, FbFixScreeninfo);
nix::ioctl_write_ptr_bad!(fbiopan_display, 0x4606, FbVarScreeninfo);

/// A mapped `/dev/fbN`.
pub struct Framebuffer {
    file: File,
    map: NonNull<c_void>,
    map_len: usize,
    var: FbVarScreeninfo,
    line_length: usize,
    pages: u32,
    front: u32,
}

impl Framebuffer {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open framebuffer {}", path.display()))?;
        let fd = file.as_raw_fd();

        let mut var = FbVarScreeninfo::default();
        // SAFETY: `fd` is an open fbdev node and the structs match the kernel
        // layout.
        unsafe { fbioget_vscreeninfo(fd, &mut var) }.context("FBIOGET_VSCREENINFO failed")?;

        if var.yres_virtual < var.yres * 2 {
            let mut doubled = var;
            doubled.yres_virtual = var.yres * 2;
            doubled.yoffset = 0;
            if let Err(e) = unsafe { fbioput_vscreeninfo(fd, &doubled) } {
                debug!("Driver refused a second page: {}", e);
            }
            unsafe { fbioget_vscreeninfo(fd, &mut var) }.context("FBIOGET_VSCREENINFO failed")?;
        }

        let mut fix = FbFixScreeninfo::default();
        unsafe { fbioget_fscreeninfo(fd, &mut fix) }.context("FBIOGET_FSCREENINFO failed")?;

        if var.bits_per_pixel != 16 && var.bits_per_pixel != 32 {
            bail!("Unsupported framebuffer depth {} bpp", var.bits_per_pixel);
        }
        let line_length = fix.line_length as usize;
        let page_len = line_length * var.yres as usize;
        let map_len = fix.smem_len as usize;
        if page_len == 0 || map_len < page_len {
            bail!("Framebuffer memory ({} bytes) smaller than one page ({} bytes)", map_len, page_len);
        }
        let pages = if var.yres_virtual >= var.yres * 2 && map_len >= page_len * 2 { 2 } else { 1 };

        let len = NonZeroUsize::new(map_len).context("Framebuffer reports no memory")?;
        let map = unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .context("Failed to map framebuffer")?;

        info!(
            "Framebuffer {}: {}x{} {} bpp, {} page(s)",
            path.display(),
            var.xres,
            var.yres,
            var.bits_per_pixel,
            pages
        );

        Ok(Self {
            file,
            map,
            map_len,
            var,
            line_length,
            pages,
            front: var.yoffset / var.yres.max(1),
        })
    }

    /// Visible resolution.
    pub fn size(&self) -> (u32, u32) {
        (self.var.xres, self.var.yres)
    }

    fn page_mut(&mut self, page: u32) -> &mut [u8] {
        let page_len = self.line_length * self.var.yres as usize;
        let offset = page as usize * page_len;
        // SAFETY: `open` checked that `pages` whole pages fit in the mapping
        unsafe { std::slice::from_raw_parts_mut(self.map.as_ptr().cast::<u8>().add(offset), page_len) }
    }

    fn pan_to(&mut self, page: u32) -> Result<(), BackendError> {
        let mut var = self.var;
        var.yoffset = page * var.yres;
        unsafe { fbiopan_display(self.file.as_raw_fd(), &var) }
            .map_err(|e| BackendError::Present(format!("FBIOPAN_DISPLAY: {}", e)))?;
        self.var = var;
        Ok(())
    }
}

impl PresentTarget for Framebuffer {
    fn name(&self) -> &'static str {
        "fbdev"
    }

    /// Nearest-scale `frame` onto the back page, then flip to it.
    fn present(&mut self, frame: &[u32], width: u32, height: u32) -> Result<(), BackendError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let (xres, yres) = self.size();
        let bpp = self.var.bits_per_pixel;
        let line_length = self.line_length;
        let back = if self.pages == 2 { 1 - self.front } else { 0 };
        let page = self.page_mut(back);

        for y in 0..yres as usize {
            let src_row = (y * height as usize / yres as usize) * width as usize;
            let row = &mut page[y * line_length..(y + 1) * line_length];
            for x in 0..xres as usize {
                let pixel = frame[src_row + x * width as usize / xres as usize];
                if bpp == 32 {
                    row[x * 4..x * 4 + 4].copy_from_slice(&pixel.to_le_bytes());
                } else {
                    row[x * 2..x * 2 + 2].copy_from_slice(&xrgb_to_rgb565(pixel).to_le_bytes());
                }
            }
        }

        if self.pages == 2 {
            self.pan_to(back)?;
            self.front = back;
        }
        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if self.pages == 2 && self.front != 0 {
            if let Err(e) = self.pan_to(0) {
                warn!("Failed to restore framebuffer page: {}", e);
            }
        }
        if let Err(e) = unsafe { mman::munmap(self.map, self.map_len) } {
            warn!("Failed to unmap framebuffer: {}", e);
        }
    }
}
