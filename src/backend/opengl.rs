//! OpenGL backend: one texture per surface, a textured-quad program and a
//! program that does the small-window blend on the GPU.

use super::{BackendError, Capabilities, DisplayBackend};
use crate::pixels::{Image, channels};
use crate::transform::{Quad, UvRect};
use anyhow::{Context, Result};
use dualview_ipc::{FilterMode, SurfaceId};
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;
use tracing::{debug, info, warn};

/// A drawable with a current GL context whose function pointers are loaded.
pub trait GlSurface {
    /// Drawable size in physical pixels.
    fn size(&self) -> (u32, u32);

    fn swap_buffers(&mut self) -> Result<(), BackendError>;
}

const VERTEX_SHADER: &str = r#"
    #version 330 core
    layout (location = 0) in vec2 aPos;
    layout (location = 1) in vec2 aTexCoord;

    out vec2 TexCoord;

    void main() {
        gl_Position = vec4(aPos, 0.0, 1.0);
        TexCoord = aTexCoord;
    }
"#;

const QUAD_FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uTexture;
    uniform float uOpacity;

    void main() {
        FragColor = vec4(texture(uTexture, TexCoord).rgb, uOpacity);
    }
"#;

/// Same arithmetic as `blend::blend_channel`, on texels rescaled to 0..255.
const BLEND_FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uOverlay;
    uniform sampler2D uBase;
    uniform vec4 uBaseRect;
    uniform int uAlpha;

    void main() {
        vec2 baseCoord = uBaseRect.xy + TexCoord * uBaseRect.zw;
        vec3 o = floor(texture(uOverlay, TexCoord).rgb * 255.0 + 0.5);
        vec3 b = floor(texture(uBase, baseCoord).rgb * 255.0 + 0.5);
        float a = float(uAlpha);
        vec3 c = floor((b * a + o * (10.0 - a) + 5.0) / 10.0);
        FragColor = vec4(c / 255.0, 1.0);
    }
"#;

struct Texture {
    id: u32,
    width: u32,
    height: u32,
}

struct QuadProgram {
    id: u32,
    texture: i32,
    opacity: i32,
}

struct BlendProgram {
    id: u32,
    overlay: i32,
    base: i32,
    base_rect: i32,
    alpha: i32,
}

pub struct GlBackend<S: GlSurface> {
    surface: S,
    quad: QuadProgram,
    blend: Option<BlendProgram>,
    vao: u32,
    vbo: u32,
    textures: HashMap<SurfaceId, Texture>,
    released: bool,
}

impl<S: GlSurface> GlBackend<S> {
    /// Build programs and buffers on the surface's current context. Without
    /// the blend program the backend still works and the compositor blends
    /// on the CPU instead.
    pub fn new(surface: S) -> Result<Self> {
        let quad_id = create_program(VERTEX_SHADER, QUAD_FRAGMENT_SHADER).context("Failed to build quad program")?;
        let quad = QuadProgram {
            id: quad_id,
            texture: uniform(quad_id, b"uTexture\0"),
            opacity: uniform(quad_id, b"uOpacity\0"),
        };

        let blend = match create_program(VERTEX_SHADER, BLEND_FRAGMENT_SHADER) {
            Ok(id) => Some(BlendProgram {
                id,
                overlay: uniform(id, b"uOverlay\0"),
                base: uniform(id, b"uBase\0"),
                base_rect: uniform(id, b"uBaseRect\0"),
                alpha: uniform(id, b"uAlpha\0"),
            }),
            Err(e) => {
                warn!("Blend program unavailable, small window falls back to CPU blending: {:#}", e);
                None
            }
        };

        let mut vao = 0;
        let mut vbo = 0;
        unsafe {
            gl::GenVertexArrays(1, &mut vao);
            gl::GenBuffers(1, &mut vbo);

            gl::BindVertexArray(vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);

            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl::VertexAttribPointer(0, 2, gl::FLOAT, gl::FALSE, stride, ptr::null());
            gl::EnableVertexAttribArray(0);
            gl::VertexAttribPointer(1, 2, gl::FLOAT, gl::FALSE, stride, (2 * std::mem::size_of::<f32>()) as *const _);
            gl::EnableVertexAttribArray(1);

            gl::BindVertexArray(0);
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 4);
        }

        let (w, h) = surface.size();
        info!("OpenGL backend initialized ({}x{}, shader blend: {})", w, h, blend.is_some());

        Ok(Self {
            surface,
            quad,
            blend,
            vao,
            vbo,
            textures: HashMap::new(),
            released: false,
        })
    }

    fn texture(&self, surface: SurfaceId) -> Result<u32, BackendError> {
        self.textures
            .get(&surface)
            .map(|t| t.id)
            .ok_or(BackendError::MissingTexture(surface))
    }

    fn draw_vertices(&self, quad: &Quad) {
        let vertices = quad.vertices();
        unsafe {
            gl::BindVertexArray(self.vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, self.vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                std::mem::size_of_val(&vertices) as isize,
                vertices.as_ptr() as *const _,
                gl::DYNAMIC_DRAW,
            );
            gl::DrawArrays(gl::TRIANGLE_FAN, 0, 4);
            gl::BindVertexArray(0);

            let err = gl::GetError();
            if err != gl::NO_ERROR {
                warn!("OpenGL error after draw: 0x{:x}", err);
            }
        }
    }

    fn set_viewport(&self) {
        let (w, h) = self.surface.size();
        unsafe { gl::Viewport(0, 0, w as i32, h as i32) }
    }
}

fn rgb(color: u32) -> [f32; 3] {
    channels(color).map(|c| c as f32 / 255.0)
}

fn uniform(program: u32, name: &[u8]) -> i32 {
    unsafe { gl::GetUniformLocation(program, name.as_ptr() as *const _) }
}

fn create_program(vertex: &str, fragment: &str) -> Result<u32> {
    let vs = compile_shader(vertex, gl::VERTEX_SHADER)?;
    let fs = match compile_shader(fragment, gl::FRAGMENT_SHADER) {
        Ok(fs) => fs,
        Err(e) => {
            unsafe { gl::DeleteShader(vs) };
            return Err(e);
        }
    };
    let program = link_program(vs, fs);
    unsafe {
        gl::DeleteShader(vs);
        gl::DeleteShader(fs);
    }
    program
}

fn compile_shader(source: &str, shader_type: u32) -> Result<u32> {
    let c_str = CString::new(source)?;
    unsafe {
        let shader = gl::CreateShader(shader_type);
        if shader == 0 {
            return Err(anyhow::anyhow!("glCreateShader failed"));
        }
        gl::ShaderSource(shader, 1, &c_str.as_ptr(), ptr::null());
        gl::CompileShader(shader);

        let mut success = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(1) as usize];
            gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteShader(shader);
            return Err(anyhow::anyhow!("Shader compilation failed: {}", String::from_utf8_lossy(&buffer)));
        }

        Ok(shader)
    }
}

fn link_program(vs: u32, fs: u32) -> Result<u32> {
    unsafe {
        let program = gl::CreateProgram();
        if program == 0 {
            return Err(anyhow::anyhow!("glCreateProgram failed"));
        }
        gl::AttachShader(program, vs);
        gl::AttachShader(program, fs);
        gl::LinkProgram(program);

        let mut success = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(1) as usize];
            gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteProgram(program);
            return Err(anyhow::anyhow!("Program linking failed: {}", String::from_utf8_lossy(&buffer)));
        }

        Ok(program)
    }
}

impl<S: GlSurface> DisplayBackend for GlBackend<S> {
    fn name(&self) -> &'static str {
        "opengl"
    }

    fn capabilities(&self) -> Capabilities {
        if self.blend.is_some() {
            Capabilities::SHADER_BLEND
        } else {
            Capabilities::empty()
        }
    }

    fn upload_texture(&mut self, surface: SurfaceId, image: &Image, filter: FilterMode) -> Result<(), BackendError> {
        if image.is_empty() {
            return Err(BackendError::TextureAllocation(surface));
        }
        let (w, h) = (image.width as i32, image.height as i32);
        let pixels = image.as_bytes().as_ptr() as *const _;
        let gl_filter = match filter {
            FilterMode::Nearest => gl::NEAREST,
            FilterMode::Linear => gl::LINEAR,
        } as i32;

        let reusable = self
            .textures
            .get(&surface)
            .filter(|t| t.width == image.width && t.height == image.height)
            .map(|t| t.id);

        unsafe {
            match reusable {
                Some(id) => {
                    gl::BindTexture(gl::TEXTURE_2D, id);
                    gl::TexSubImage2D(gl::TEXTURE_2D, 0, 0, 0, w, h, gl::BGRA, gl::UNSIGNED_BYTE, pixels);
                }
                None => {
                    if let Some(old) = self.textures.remove(&surface) {
                        gl::DeleteTextures(1, &old.id);
                    }
                    let mut id = 0;
                    gl::GenTextures(1, &mut id);
                    if id == 0 {
                        return Err(BackendError::TextureAllocation(surface));
                    }
                    gl::BindTexture(gl::TEXTURE_2D, id);
                    gl::TexImage2D(
                        gl::TEXTURE_2D,
                        0,
                        gl::RGBA8 as i32,
                        w,
                        h,
                        0,
                        gl::BGRA,
                        gl::UNSIGNED_BYTE,
                        pixels,
                    );
                    if gl::GetError() == gl::OUT_OF_MEMORY {
                        gl::BindTexture(gl::TEXTURE_2D, 0);
                        gl::DeleteTextures(1, &id);
                        return Err(BackendError::TextureAllocation(surface));
                    }
                    gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
                    gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
                    debug!("Allocated {}x{} texture {} for {:?}", w, h, id, surface);
                    self.textures.insert(
                        surface,
                        Texture {
                            id,
                            width: image.width,
                            height: image.height,
                        },
                    );
                }
            }
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl_filter);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl_filter);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        Ok(())
    }

    fn draw_quad(&mut self, surface: SurfaceId, quad: &Quad, opacity: f32) -> Result<(), BackendError> {
        let texture = self.texture(surface)?;
        unsafe {
            gl::Enable(gl::BLEND);
            gl::BlendFunc(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA);
            gl::UseProgram(self.quad.id);
            gl::Uniform1f(self.quad.opacity, opacity.clamp(0.0, 1.0));
            gl::Uniform1i(self.quad.texture, 0);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, texture);
        }
        self.draw_vertices(quad);
        Ok(())
    }

    fn draw_blended(
        &mut self,
        overlay: SurfaceId,
        base: SurfaceId,
        quad: &Quad,
        base_uv: UvRect,
        alpha: u8,
    ) -> Result<(), BackendError> {
        let Some(program) = &self.blend else {
            return Err(BackendError::Unsupported(self.name()));
        };
        let overlay_tex = self.texture(overlay)?;
        let base_tex = self.texture(base)?;
        unsafe {
            gl::Disable(gl::BLEND);
            gl::UseProgram(program.id);
            gl::Uniform1i(program.overlay, 0);
            gl::Uniform1i(program.base, 1);
            gl::Uniform4f(program.base_rect, base_uv.x, base_uv.y, base_uv.w, base_uv.h);
            gl::Uniform1i(program.alpha, alpha.min(10) as i32);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, overlay_tex);
            gl::ActiveTexture(gl::TEXTURE1);
            gl::BindTexture(gl::TEXTURE_2D, base_tex);
        }
        self.draw_vertices(quad);
        unsafe {
            gl::ActiveTexture(gl::TEXTURE0);
        }
        Ok(())
    }

    fn fill_quad(&mut self, quad: &Quad, color: u32) -> Result<(), BackendError> {
        // NDC already has a bottom-left origin, same as glScissor
        let (w, h) = self.surface.size();
        let xs = quad.positions.map(|p| (p[0] + 1.0) * 0.5 * w as f32);
        let ys = quad.positions.map(|p| (p[1] + 1.0) * 0.5 * h as f32);
        let x0 = xs.iter().copied().fold(f32::INFINITY, f32::min).round() as i32;
        let x1 = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max).round() as i32;
        let y0 = ys.iter().copied().fold(f32::INFINITY, f32::min).round() as i32;
        let y1 = ys.iter().copied().fold(f32::NEG_INFINITY, f32::max).round() as i32;
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let [r, g, b] = rgb(color);
        unsafe {
            gl::Enable(gl::SCISSOR_TEST);
            gl::Scissor(x0, y0, x1 - x0, y1 - y0);
            gl::ClearColor(r, g, b, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);
            gl::Disable(gl::SCISSOR_TEST);
        }
        Ok(())
    }

    fn clear(&mut self, color: u32) {
        self.set_viewport();
        let [r, g, b] = rgb(color);
        unsafe {
            gl::ClearColor(r, g, b, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
    }

    fn present(&mut self) -> Result<(), BackendError> {
        self.surface.swap_buffers()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        unsafe {
            for texture in self.textures.values() {
                gl::DeleteTextures(1, &texture.id);
            }
            gl::DeleteBuffers(1, &self.vbo);
            gl::DeleteVertexArrays(1, &self.vao);
            gl::DeleteProgram(self.quad.id);
            if let Some(blend) = &self.blend {
                gl::DeleteProgram(blend.id);
            }
        }
        self.textures.clear();
        self.released = true;
        info!("OpenGL resources released");
    }
}

impl<S: GlSurface> Drop for GlBackend<S> {
    fn drop(&mut self) {
        self.release();
    }
}
