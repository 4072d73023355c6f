//! A plain X11 window with a GLX context, for running the compositor on a
//! desktop session.

use crate::backend::{BackendError, GlSurface};
use anyhow::{Context, Result};
use std::ffi::CString;
use std::ptr;
use tracing::info;
use x11_dl::glx::{self, Glx};
use x11_dl::xlib::{self, Xlib};

pub struct GlxWindow {
    glx: Glx,
    xlib: Xlib,
    display: *mut xlib::Display,
    window: xlib::Window,
    colormap: xlib::Colormap,
    context: glx::GLXContext,
    width: u32,
    height: u32,
}

impl GlxWindow {
    /// Open `$DISPLAY`, map a `width`x`height` window and make a GL context
    /// current on it. GL function pointers are loaded on success.
    pub fn open(width: u32, height: u32, title: &str) -> Result<Self> {
        let xlib = Xlib::open().context("Failed to load libX11")?;
        let glx = Glx::open().context("Failed to load libGLX")?;

        let display = unsafe { (xlib.XOpenDisplay)(ptr::null()) };
        if display.is_null() {
            return Err(anyhow::anyhow!("Failed to open X11 display"));
        }

        let mut major = 0;
        let mut minor = 0;
        unsafe { (glx.glXQueryVersion)(display, &mut major, &mut minor) };
        info!("GLX version {}.{}", major, minor);

        let screen = unsafe { (xlib.XDefaultScreen)(display) };
        let attribs = [
            glx::GLX_DRAWABLE_TYPE as i32, glx::GLX_WINDOW_BIT as i32,
            glx::GLX_RENDER_TYPE as i32, glx::GLX_RGBA_BIT as i32,
            glx::GLX_DOUBLEBUFFER as i32, 1,
            glx::GLX_RED_SIZE as i32, 8,
            glx::GLX_GREEN_SIZE as i32, 8,
            glx::GLX_BLUE_SIZE as i32, 8,
            0,
        ];

        let mut num_configs = 0;
        let configs = unsafe { (glx.glXChooseFBConfig)(display, screen, attribs.as_ptr(), &mut num_configs) };
        if configs.is_null() || num_configs == 0 {
            unsafe { (xlib.XCloseDisplay)(display) };
            return Err(anyhow::anyhow!("No suitable GLX FBConfig found"));
        }
        let config = unsafe { *configs };
        unsafe { (xlib.XFree)(configs as *mut _) };

        let vinfo = unsafe { (glx.glXGetVisualFromFBConfig)(display, config) };
        if vinfo.is_null() {
            unsafe { (xlib.XCloseDisplay)(display) };
            return Err(anyhow::anyhow!("Failed to get visual from FBConfig"));
        }

        let (window, colormap) = unsafe {
            let root = (xlib.XRootWindow)(display, screen);
            let colormap = (xlib.XCreateColormap)(display, root, (*vinfo).visual, xlib::AllocNone);
            let mut attrs: xlib::XSetWindowAttributes = std::mem::zeroed();
            attrs.colormap = colormap;
            attrs.event_mask = xlib::ExposureMask | xlib::StructureNotifyMask;
            let window = (xlib.XCreateWindow)(
                display,
                root,
                0,
                0,
                width,
                height,
                0,
                (*vinfo).depth,
                xlib::InputOutput as u32,
                (*vinfo).visual,
                xlib::CWColormap | xlib::CWEventMask,
                &mut attrs,
            );
            (xlib.XFree)(vinfo as *mut _);
            (window, colormap)
        };

        if let Ok(name) = CString::new(title) {
            unsafe { (xlib.XStoreName)(display, window, name.as_ptr()) };
        }
        unsafe {
            (xlib.XMapWindow)(display, window);
            (xlib.XFlush)(display);
        }

        let context = unsafe { (glx.glXCreateNewContext)(display, config, glx::GLX_RGBA_TYPE as i32, ptr::null_mut(), 1) };
        if context.is_null() {
            unsafe {
                (xlib.XDestroyWindow)(display, window);
                (xlib.XFreeColormap)(display, colormap);
                (xlib.XCloseDisplay)(display);
            }
            return Err(anyhow::anyhow!("glXCreateNewContext failed"));
        }

        let surface = Self {
            glx,
            xlib,
            display,
            window,
            colormap,
            context,
            width,
            height,
        };

        if unsafe { (surface.glx.glXMakeCurrent)(display, window, context) } == 0 {
            return Err(anyhow::anyhow!("glXMakeCurrent failed"));
        }

        let glx_fns = &surface.glx;
        gl::load_with(|symbol| {
            let Ok(symbol) = CString::new(symbol) else {
                return ptr::null();
            };
            match unsafe { (glx_fns.glXGetProcAddress)(symbol.as_ptr() as *const _) } {
                Some(f) => f as *const _,
                None => ptr::null(),
            }
        });

        info!("GLX window {}x{} ready", width, height);
        Ok(surface)
    }
}

impl GlSurface for GlxWindow {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn swap_buffers(&mut self) -> Result<(), BackendError> {
        unsafe { (self.glx.glXSwapBuffers)(self.display, self.window) };
        Ok(())
    }
}

impl Drop for GlxWindow {
    fn drop(&mut self) {
        unsafe {
            (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
            (self.glx.glXDestroyContext)(self.display, self.context);
            (self.xlib.XDestroyWindow)(self.display, self.window);
            (self.xlib.XFreeColormap)(self.display, self.colormap);
            (self.xlib.XCloseDisplay)(self.display);
        }
    }
}
