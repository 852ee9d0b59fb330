//! Thin wrappers over raw GL objects: shaders, programs with a by-name
//! uniform map, rectangle textures and framebuffer objects.

use std::collections::HashMap;
use std::sync::Arc;

use glow::HasContext;

use crate::error::{Error, Result};

pub mod uniforms {
    pub const IMAGE: &str = "Image";
    pub const BLURRED_IMAGE: &str = "BlurredImage";
    pub const INPUT_IMAGE_BLURRED: &str = "InputImageBlurred";
    pub const SELECTION_POS: &str = "SelectionPos";
    pub const IS_MONO: &str = "IsMono";
    pub const ADAPTIVE: &str = "Adaptive";
    pub const AMOUNT_MIN: &str = "AmountMin";
    pub const AMOUNT_MAX: &str = "AmountMax";
    pub const THRESHOLD: &str = "Threshold";
    pub const WIDTH: &str = "Width";
    pub const TRANSITION_CURVE: &str = "TransitionCurve";
    pub const KERNEL_RADIUS: &str = "KernelRadius";
    pub const GAUSSIAN_KERNEL: &str = "GaussianKernel";
    pub const INPUT_ARRAY_1: &str = "InputArray1";
    pub const INPUT_ARRAY_2: &str = "InputArray2";
    pub const NUM_POINTS: &str = "NumPoints";
    pub const CURVE_POINTS: &str = "CurvePoints";
    pub const SPLINES: &str = "Splines";
    pub const SMOOTH: &str = "Smooth";
    pub const IS_GAMMA: &str = "IsGamma";
    pub const GAMMA: &str = "Gamma";
}

fn compile_shader(gl: &glow::Context, kind: u32, source: &str, name: &str) -> Result<glow::Shader> {
    unsafe {
        let shader = gl
            .create_shader(kind)
            .map_err(|e| Error::Shader(format!("cannot create shader {name}: {e}")))?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(Error::Shader(format!("compilation of {name} failed: {log}")));
        }
        Ok(shader)
    }
}

/// A linked program together with the uniform locations it declared;
/// requesting an unexpected uniform is caught at link time.
pub struct Program {
    gl: Arc<glow::Context>,
    program: glow::Program,
    uniforms: HashMap<&'static str, glow::UniformLocation>,
}

impl Program {
    pub fn new(
        gl: Arc<glow::Context>,
        vert_source: &str,
        frag_source: &str,
        expected_uniforms: &[&'static str],
        name: &str,
    ) -> Result<Program> {
        let vert = compile_shader(&gl, glow::VERTEX_SHADER, vert_source, name)?;
        let frag = compile_shader(&gl, glow::FRAGMENT_SHADER, frag_source, name)?;

        unsafe {
            let program = gl
                .create_program()
                .map_err(|e| Error::Shader(format!("cannot create program {name}: {e}")))?;
            gl.attach_shader(program, vert);
            gl.attach_shader(program, frag);
            gl.link_program(program);
            gl.delete_shader(vert);
            gl.delete_shader(frag);

            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(Error::Shader(format!("linking of {name} failed: {log}")));
            }

            let mut uniforms = HashMap::new();
            for &uniform in expected_uniforms {
                match gl.get_uniform_location(program, uniform) {
                    Some(location) => {
                        uniforms.insert(uniform, location);
                    }
                    None => {
                        gl.delete_program(program);
                        return Err(Error::Shader(format!(
                            "program {name} lacks expected uniform '{uniform}'"
                        )));
                    }
                }
            }

            Ok(Program { gl, program, uniforms })
        }
    }

    pub fn use_program(&self) {
        unsafe { self.gl.use_program(Some(self.program)) }
    }

    fn location(&self, name: &str) -> &glow::UniformLocation {
        self.uniforms
            .get(name)
            .unwrap_or_else(|| panic!("uniform '{name}' was not declared for this program"))
    }

    pub fn set_i32(&self, name: &str, value: i32) {
        unsafe { self.gl.uniform_1_i32(Some(self.location(name)), value) }
    }

    pub fn set_bool(&self, name: &str, value: bool) {
        self.set_i32(name, value as i32);
    }

    pub fn set_f32(&self, name: &str, value: f32) {
        unsafe { self.gl.uniform_1_f32(Some(self.location(name)), value) }
    }

    pub fn set_f32_array(&self, name: &str, values: &[f32]) {
        unsafe { self.gl.uniform_1_f32_slice(Some(self.location(name)), values) }
    }

    pub fn set_vec2_array(&self, name: &str, values: &[f32]) {
        unsafe { self.gl.uniform_2_f32_slice(Some(self.location(name)), values) }
    }

    pub fn set_vec4(&self, name: &str, v: [f32; 4]) {
        unsafe { self.gl.uniform_4_f32(Some(self.location(name)), v[0], v[1], v[2], v[3]) }
    }

    pub fn set_vec4_array(&self, name: &str, values: &[f32]) {
        unsafe { self.gl.uniform_4_f32_slice(Some(self.location(name)), values) }
    }

    pub fn set_ivec2(&self, name: &str, x: i32, y: i32) {
        unsafe { self.gl.uniform_2_i32(Some(self.location(name)), x, y) }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        unsafe { self.gl.delete_program(self.program) }
    }
}

/// Single- or three-channel float rectangle texture.
pub struct Texture {
    gl: Arc<glow::Context>,
    texture: glow::Texture,
    width: u32,
    height: u32,
}

impl Texture {
    pub fn new(
        gl: Arc<glow::Context>,
        width: u32,
        height: u32,
        mono: bool,
        data: Option<&[f32]>,
    ) -> Result<Texture> {
        unsafe {
            let texture = gl
                .create_texture()
                .map_err(|e| Error::Shader(format!("cannot create texture: {e}")))?;
            gl.bind_texture(glow::TEXTURE_RECTANGLE, Some(texture));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_parameter_i32(
                glow::TEXTURE_RECTANGLE,
                glow::TEXTURE_MIN_FILTER,
                glow::NEAREST as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_RECTANGLE,
                glow::TEXTURE_MAG_FILTER,
                glow::NEAREST as i32,
            );
            gl.tex_image_2d(
                glow::TEXTURE_RECTANGLE,
                0,
                if mono { glow::R32F } else { glow::RGB32F } as i32,
                width as i32,
                height as i32,
                0,
                if mono { glow::RED } else { glow::RGB },
                glow::FLOAT,
                glow::PixelUnpackData::Slice(data.map(bytemuck::cast_slice)),
            );
            Ok(Texture { gl, texture, width, height })
        }
    }

    pub fn raw(&self) -> glow::Texture {
        self.texture
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Binds to the given texture unit.
    pub fn bind_to_unit(&self, unit: u32) {
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit);
            self.gl.bind_texture(glow::TEXTURE_RECTANGLE, Some(self.texture));
        }
    }

    /// Reads the texture back into a float vector (1 or 3 values per
    /// pixel).
    pub fn read_back(&self, mono: bool) -> Vec<f32> {
        let channels = if mono { 1 } else { 3 };
        let mut data = vec![0.0f32; self.width as usize * self.height as usize * channels];
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_RECTANGLE, Some(self.texture));
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            self.gl.get_tex_image(
                glow::TEXTURE_RECTANGLE,
                0,
                if mono { glow::RED } else { glow::RGB },
                glow::FLOAT,
                glow::PixelPackData::Slice(Some(bytemuck::cast_slice_mut(&mut data))),
            );
        }
        data
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.gl.delete_texture(self.texture) }
    }
}

/// Texture with an FBO rendering into it.
pub struct TexFbo {
    gl: Arc<glow::Context>,
    pub tex: Texture,
    fbo: glow::Framebuffer,
}

impl TexFbo {
    pub fn new(gl: Arc<glow::Context>, width: u32, height: u32, mono: bool) -> Result<TexFbo> {
        let tex = Texture::new(gl.clone(), width, height, mono, None)?;
        unsafe {
            let fbo = gl
                .create_framebuffer()
                .map_err(|e| Error::Shader(format!("cannot create FBO: {e}")))?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_RECTANGLE,
                Some(tex.raw()),
                0,
            );
            if gl.check_framebuffer_status(glow::FRAMEBUFFER) != glow::FRAMEBUFFER_COMPLETE {
                return Err(Error::Shader("framebuffer is incomplete".into()));
            }
            Ok(TexFbo { gl, tex, fbo })
        }
    }

    /// Binds the FBO and sets the viewport to the texture size.
    pub fn bind(&self) {
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.fbo));
            self.gl.viewport(0, 0, self.tex.width() as i32, self.tex.height() as i32);
        }
    }
}

impl Drop for TexFbo {
    fn drop(&mut self) {
        unsafe { self.gl.delete_framebuffer(self.fbo) }
    }
}

/// Full-viewport quad with texture coordinates in pixels.
pub struct Quad {
    gl: Arc<glow::Context>,
    vao: glow::VertexArray,
    vbo: glow::Buffer,
}

impl Quad {
    pub fn new(gl: Arc<glow::Context>) -> Result<Quad> {
        unsafe {
            let vao = gl
                .create_vertex_array()
                .map_err(|e| Error::Shader(format!("cannot create VAO: {e}")))?;
            let vbo = gl
                .create_buffer()
                .map_err(|e| Error::Shader(format!("cannot create VBO: {e}")))?;
            Ok(Quad { gl, vao, vbo })
        }
    }

    /// Uploads quad vertices whose texture coordinates span
    /// `(x0, y0)..(x0 + width, y0 + height)`.
    pub fn set_rect(&self, x0: f32, y0: f32, width: f32, height: f32) {
        // 4 values per vertex: clip-space position, texture coords
        let vertex_data: [f32; 16] = [
            -1.0, -1.0, x0, y0,
            1.0, -1.0, x0 + width, y0,
            1.0, 1.0, x0 + width, y0 + height,
            -1.0, 1.0, x0, y0 + height,
        ];
        unsafe {
            self.gl.bind_vertex_array(Some(self.vao));
            self.gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            self.gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&vertex_data),
                glow::DYNAMIC_DRAW,
            );
            self.gl.enable_vertex_attrib_array(0);
            self.gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 16, 0);
            self.gl.enable_vertex_attrib_array(1);
            self.gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, 16, 8);
        }
    }

    pub fn draw(&self) {
        unsafe {
            self.gl.bind_vertex_array(Some(self.vao));
            self.gl.draw_arrays(glow::TRIANGLE_FAN, 0, 4);
        }
    }
}

impl Drop for Quad {
    fn drop(&mut self) {
        unsafe {
            self.gl.delete_buffer(self.vbo);
            self.gl.delete_vertex_array(self.vao);
        }
    }
}
