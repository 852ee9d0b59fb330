//! GPU back end: the pipeline expressed as fragment-shader passes over
//! rectangle textures.
//!
//! L-R deconvolution runs as ping-pong rendering between two textures,
//! split into command batches sized in megapixel-iterations; control
//! returns to the caller between batches so a run stays cancelable. A
//! forced flush ends every batch, otherwise the driver would clump the
//! whole iteration set into one long uninterruptible submission.
//!
//! The caller owns the GL context and must keep it current on the thread
//! that pumps [`GpuProcessing::step`].

mod shaders;
mod util;

use std::sync::Arc;

use glow::HasContext;
use log::debug;

use self::util::{uniforms, Program, Quad, TexFbo, Texture};
use super::{ProcessingBackend, StepResult};
use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat, Rect};
use crate::math::gauss::half_gaussian_kernel;
use crate::processing::deconvolution::blur_threshold_vicinity;
use crate::processing::settings::{DERINGING_BRIGHTNESS_THRESHOLD, RAW_IMAGE_BLUR_SIGMA};
use crate::processing::unsharp::transition_curve;
use crate::processing::{
    CompletionStatus, ProcessingRequest, ProcessingSettings,
};
use crate::progress::{noop_progress, SharedProgress};

/// Default L-R batch size in megapixel-iterations.
pub const DEFAULT_LR_BATCH_MPIX_ITERS: u32 = 2;

// matches MAX_KERNEL_RADIUS in the convolution shaders
const MAX_KERNEL_RADIUS: usize = 30;
// matches MAX_CURVE_POINTS in the tone curve shader
const MAX_CURVE_POINTS: usize = 64;

struct Programs {
    copy: Program,
    gaussian_horz: Program,
    gaussian_vert: Program,
    divide: Program,
    multiply: Program,
    unsharp_mask: Program,
    tone_curve: Program,
}

#[derive(Default)]
struct OutputValidity {
    sharpening: bool,
    unsharp: bool,
    tone_curve: bool,
}

struct LrState {
    iterations_left: u32,
    /// Which of `buf1`/`buf2` currently holds the newest estimate.
    prev_is_buf1: bool,
}

struct LrTextures {
    original: TexFbo,
    buf1: TexFbo,
    buf2: TexFbo,
    estimate_convolved: TexFbo,
    convolved_div: TexFbo,
    convolved2: TexFbo,
}

pub struct GpuProcessing {
    gl: Arc<glow::Context>,
    programs: Programs,
    quad: Quad,
    batch_mpix_iters: u32,

    img: Option<Image>,
    mono: bool,
    selection: Rect,
    settings: ProcessingSettings,

    original_tex: Option<Texture>,
    /// Whole image blurred with the steering sigma (adaptive unsharp
    /// masking input).
    input_blurred: Option<TexFbo>,
    /// Selection with deringing preprocessing applied, as a texture.
    deringed_tex: Option<Texture>,
    lr_textures: Option<LrTextures>,
    lr_sharpened: Option<TexFbo>,
    gaussian_blur: Option<TexFbo>,
    aux: Option<TexFbo>,
    unsharp_out: Vec<TexFbo>,
    tone_out: Option<TexFbo>,

    validity: OutputValidity,
    lr_state: Option<LrState>,
    run_active: bool,
    pending_done: Option<CompletionStatus>,
    abort_requested: bool,
    scheduled: Option<ProcessingRequest>,
    progress: SharedProgress,
}

impl GpuProcessing {
    /// Builds the shader pipeline on the given context. Fails with
    /// [`Error::Shader`] when a program does not compile or link or an
    /// expected uniform is missing.
    pub fn new(gl: Arc<glow::Context>, batch_mpix_iters: u32) -> Result<GpuProcessing> {
        let programs = Programs {
            copy: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::COPY_FRAG,
                &[uniforms::IMAGE],
                "copy",
            )?,
            gaussian_horz: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::GAUSSIAN_HORZ_FRAG,
                &[
                    uniforms::IMAGE,
                    uniforms::KERNEL_RADIUS,
                    uniforms::GAUSSIAN_KERNEL,
                    uniforms::IS_MONO,
                ],
                "gaussianHorz",
            )?,
            gaussian_vert: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::GAUSSIAN_VERT_FRAG,
                &[uniforms::IMAGE, uniforms::KERNEL_RADIUS, uniforms::GAUSSIAN_KERNEL],
                "gaussianVert",
            )?,
            divide: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::DIVIDE_FRAG,
                &[uniforms::INPUT_ARRAY_1, uniforms::INPUT_ARRAY_2, uniforms::IS_MONO],
                "divide",
            )?,
            multiply: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::MULTIPLY_FRAG,
                &[uniforms::INPUT_ARRAY_1, uniforms::INPUT_ARRAY_2, uniforms::IS_MONO],
                "multiply",
            )?,
            unsharp_mask: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::UNSHARP_MASK_FRAG,
                &[
                    uniforms::IMAGE,
                    uniforms::BLURRED_IMAGE,
                    uniforms::INPUT_IMAGE_BLURRED,
                    uniforms::SELECTION_POS,
                    uniforms::IS_MONO,
                    uniforms::ADAPTIVE,
                    uniforms::AMOUNT_MIN,
                    uniforms::AMOUNT_MAX,
                    uniforms::THRESHOLD,
                    uniforms::WIDTH,
                    uniforms::TRANSITION_CURVE,
                ],
                "unsharpMask",
            )?,
            tone_curve: Program::new(
                gl.clone(),
                shaders::PASS_THROUGH_VERT,
                shaders::TONE_CURVE_FRAG,
                &[
                    uniforms::IMAGE,
                    uniforms::IS_MONO,
                    uniforms::NUM_POINTS,
                    uniforms::CURVE_POINTS,
                    uniforms::SPLINES,
                    uniforms::SMOOTH,
                    uniforms::IS_GAMMA,
                    uniforms::GAMMA,
                ],
                "toneCurve",
            )?,
        };

        let quad = Quad::new(gl.clone())?;

        Ok(GpuProcessing {
            gl,
            programs,
            quad,
            batch_mpix_iters: batch_mpix_iters.max(1),
            img: None,
            mono: true,
            selection: Rect::new(0, 0, 0, 0),
            settings: ProcessingSettings::new(),
            original_tex: None,
            input_blurred: None,
            deringed_tex: None,
            lr_textures: None,
            lr_sharpened: None,
            gaussian_blur: None,
            aux: None,
            unsharp_out: Vec::new(),
            tone_out: None,
            validity: OutputValidity::default(),
            lr_state: None,
            run_active: false,
            pending_done: None,
            abort_requested: false,
            scheduled: None,
            progress: noop_progress(),
        })
    }

    fn selection_size(&self) -> (u32, u32) {
        (self.selection.width, self.selection.height)
    }

    fn half_kernel_clamped(sigma: f32) -> Vec<f32> {
        let mut kernel = half_gaussian_kernel(sigma);
        kernel.truncate(MAX_KERNEL_RADIUS);
        kernel
    }

    fn ensure_tex_fbo_aux(&mut self, width: u32, height: u32) -> Result<()> {
        let needs_new = match &self.aux {
            Some(tf) => tf.tex.width() != width || tf.tex.height() != height,
            None => true,
        };
        if needs_new {
            self.aux = Some(TexFbo::new(self.gl.clone(), width, height, self.mono)?);
        }
        Ok(())
    }

    fn binary_op(&self, prog: &Program, a: &Texture, b: &Texture, dest: &TexFbo) {
        dest.bind();
        prog.use_program();
        a.bind_to_unit(0);
        b.bind_to_unit(1);
        prog.set_i32(uniforms::INPUT_ARRAY_1, 0);
        prog.set_i32(uniforms::INPUT_ARRAY_2, 1);
        prog.set_bool(uniforms::IS_MONO, self.mono);
        self.quad.draw();
    }

    fn copy_into(&self, src: &Texture, dest: &TexFbo) {
        dest.bind();
        let prog = &self.programs.copy;
        prog.use_program();
        src.bind_to_unit(0);
        prog.set_i32(uniforms::IMAGE, 0);
        self.quad.draw();
    }

    /// CPU-side deringing of the selection, uploaded as the L-R input.
    fn prepare_deringed_input(&mut self) -> Result<()> {
        let img = self.img.as_ref().ok_or_else(|| Error::invalid_arg("image not set"))?;
        let width = self.selection.width as usize;
        let height = self.selection.height as usize;
        let sigma = self.settings.lucy_richardson.sigma;
        let channels = if self.mono { 1 } else { 3 };

        let mut interleaved = vec![0.0f32; width * height * channels];
        let mut mask = vec![0u8; width * height];

        for ch in 0..channels {
            let mut plane = vec![0.0f32; width * height];
            for y in 0..height {
                let row = img.row_as::<f32>((self.selection.y + y as i32) as u32);
                for x in 0..width {
                    plane[y * width + x] =
                        row[(self.selection.x as usize + x) * channels + ch];
                }
            }
            let mut blurred = vec![0.0f32; width * height];
            blur_threshold_vicinity(
                &plane,
                &mut blurred,
                &mut mask,
                width,
                height,
                DERINGING_BRIGHTNESS_THRESHOLD,
                sigma,
            );
            for (i, v) in blurred.into_iter().enumerate() {
                interleaved[i * channels + ch] = v;
            }
        }

        self.deringed_tex = Some(Texture::new(
            self.gl.clone(),
            self.selection.width,
            self.selection.height,
            self.mono,
            Some(&interleaved),
        )?);
        Ok(())
    }

    fn start_lr(&mut self) -> Result<()> {
        self.validity = OutputValidity::default();
        self.progress.set(0.0, Some("Lucy\u{2013}Richardson deconvolution: 0%"));

        let (w, h) = self.selection_size();
        if self.lr_textures
            .as_ref()
            .map(|t| t.original.tex.width() != w || t.original.tex.height() != h)
            .unwrap_or(true)
        {
            self.lr_textures = Some(LrTextures {
                original: TexFbo::new(self.gl.clone(), w, h, self.mono)?,
                buf1: TexFbo::new(self.gl.clone(), w, h, self.mono)?,
                buf2: TexFbo::new(self.gl.clone(), w, h, self.mono)?,
                estimate_convolved: TexFbo::new(self.gl.clone(), w, h, self.mono)?,
                convolved_div: TexFbo::new(self.gl.clone(), w, h, self.mono)?,
                convolved2: TexFbo::new(self.gl.clone(), w, h, self.mono)?,
            });
        }
        self.ensure_lr_sharpened()?;

        let lr = self.settings.lucy_richardson;
        if lr.iterations == 0 {
            // no deconvolution: the selection passes straight through
            self.quad.set_rect(
                self.selection.x as f32,
                self.selection.y as f32,
                w as f32,
                h as f32,
            );
            let original = self.original_tex.as_ref().unwrap();
            self.copy_into(original, self.lr_sharpened.as_ref().unwrap());
            self.validity.sharpening = true;
            self.lr_state = None;
            return Ok(());
        }

        if lr.deringing {
            self.prepare_deringed_input()?;
        } else {
            self.deringed_tex = None;
        }

        // seed both `original` and the first ping-pong buffer with the input
        {
            let textures = self.lr_textures.as_ref().unwrap();
            match &self.deringed_tex {
                Some(tex) => {
                    self.quad.set_rect(0.0, 0.0, w as f32, h as f32);
                    self.copy_into(tex, &textures.original);
                    self.copy_into(tex, &textures.buf1);
                }
                None => {
                    self.quad.set_rect(
                        self.selection.x as f32,
                        self.selection.y as f32,
                        w as f32,
                        h as f32,
                    );
                    let original = self.original_tex.as_ref().unwrap();
                    self.copy_into(original, &textures.original);
                    self.copy_into(original, &textures.buf1);
                }
            }
        }

        self.lr_state = Some(LrState { iterations_left: lr.iterations, prev_is_buf1: true });
        Ok(())
    }

    /// Issues one batch of L-R iterations; returns true when deconvolution
    /// is complete.
    fn issue_lr_command_batch(&mut self) -> Result<bool> {
        let Some(state) = &self.lr_state else { return Ok(true) };
        let total = self.settings.lucy_richardson.iterations;
        let (w, h) = self.selection_size();

        let iters_per_batch =
            (self.batch_mpix_iters as u64 * 1_000_000 / (w as u64 * h as u64)).max(1) as u32;
        let iters_this_batch = iters_per_batch.min(state.iterations_left);

        let kernel = Self::half_kernel_clamped(self.settings.lucy_richardson.sigma);
        let mut prev_is_buf1 = state.prev_is_buf1;

        self.ensure_tex_fbo_aux(w, h)?;
        self.quad.set_rect(0.0, 0.0, w as f32, h as f32);

        let run_gaussian = |src: &Texture, dest: &TexFbo| {
            let aux = self.aux.as_ref().unwrap();
            aux.bind();
            let prog = &self.programs.gaussian_horz;
            prog.use_program();
            src.bind_to_unit(0);
            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_bool(uniforms::IS_MONO, self.mono);
            prog.set_i32(uniforms::KERNEL_RADIUS, kernel.len() as i32);
            prog.set_f32_array(uniforms::GAUSSIAN_KERNEL, &kernel);
            self.quad.draw();

            dest.bind();
            let prog = &self.programs.gaussian_vert;
            prog.use_program();
            aux.tex.bind_to_unit(0);
            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_i32(uniforms::KERNEL_RADIUS, kernel.len() as i32);
            prog.set_f32_array(uniforms::GAUSSIAN_KERNEL, &kernel);
            self.quad.draw();
        };

        let textures = self.lr_textures.as_ref().unwrap();
        for _ in 0..iters_this_batch {
            let (prev, next) = if prev_is_buf1 {
                (&textures.buf1, &textures.buf2)
            } else {
                (&textures.buf2, &textures.buf1)
            };

            // estimate (*) PSF
            run_gaussian(&prev.tex, &textures.estimate_convolved);
            // original / (estimate (*) PSF)
            self.binary_op(
                &self.programs.divide,
                &textures.original.tex,
                &textures.estimate_convolved.tex,
                &textures.convolved_div,
            );
            // (...) (*) PSF
            run_gaussian(&textures.convolved_div.tex, &textures.convolved2);
            // estimate * (...)
            self.binary_op(&self.programs.multiply, &prev.tex, &textures.convolved2.tex, next);

            prev_is_buf1 = !prev_is_buf1;
        }

        // force execution so the user can interrupt between batches
        unsafe { self.gl.finish() };

        let state = self.lr_state.as_mut().unwrap();
        state.prev_is_buf1 = prev_is_buf1;
        state.iterations_left -= iters_this_batch;
        let left = state.iterations_left;

        let percent = 100 * (total - left) / total;
        self.progress.set(
            percent as f32 / 100.0,
            Some(&format!("Lucy\u{2013}Richardson deconvolution: {percent}%")),
        );

        if left == 0 {
            // latest estimate lands in the sharpened texture
            let newest_is_buf1 = self.lr_state.as_ref().unwrap().prev_is_buf1;
            self.ensure_lr_sharpened()?;
            let textures = self.lr_textures.as_ref().unwrap();
            let newest =
                if newest_is_buf1 { &textures.buf1 } else { &textures.buf2 };
            self.quad.set_rect(0.0, 0.0, w as f32, h as f32);
            self.copy_into(&newest.tex, self.lr_sharpened.as_ref().unwrap());
            self.validity.sharpening = true;
            self.lr_state = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn ensure_lr_sharpened(&mut self) -> Result<()> {
        let (w, h) = self.selection_size();
        let needs_new = match &self.lr_sharpened {
            Some(tf) => tf.tex.width() != w || tf.tex.height() != h,
            None => true,
        };
        if needs_new {
            self.lr_sharpened = Some(TexFbo::new(self.gl.clone(), w, h, self.mono)?);
        }
        Ok(())
    }

    fn run_unsharp_masking(&mut self) -> Result<()> {
        self.validity.unsharp = false;
        self.validity.tone_curve = false;
        self.progress.set(0.0, Some("Unsharp masking..."));

        let (w, h) = self.selection_size();
        let needs = match &self.gaussian_blur {
            Some(tf) => tf.tex.width() != w || tf.tex.height() != h,
            None => true,
        };
        if needs {
            self.gaussian_blur = Some(TexFbo::new(self.gl.clone(), w, h, self.mono)?);
        }
        while self.unsharp_out.len() < self.settings.unsharp_masks.len() {
            self.unsharp_out.push(TexFbo::new(self.gl.clone(), w, h, self.mono)?);
        }
        self.unsharp_out.truncate(self.settings.unsharp_masks.len());
        for i in 0..self.unsharp_out.len() {
            if self.unsharp_out[i].tex.width() != w || self.unsharp_out[i].tex.height() != h {
                self.unsharp_out[i] = TexFbo::new(self.gl.clone(), w, h, self.mono)?;
            }
        }

        for i in 0..self.settings.unsharp_masks.len() {
            let mask = self.settings.unsharp_masks[i];
            let kernel = Self::half_kernel_clamped(mask.sigma);

            // blur the stage input
            {
                let input_raw = if i == 0 {
                    self.lr_sharpened.as_ref().unwrap().tex.raw()
                } else {
                    self.unsharp_out[i - 1].tex.raw()
                };
                // bind-by-raw because `self.unsharp_out` is also borrowed
                // as the render target below
                self.gaussian_convolution_raw(input_raw, &kernel)?;
            }

            let prog = &self.programs.unsharp_mask;
            self.unsharp_out[i].bind();
            prog.use_program();

            unsafe {
                self.gl.active_texture(glow::TEXTURE0);
                let input_raw = if i == 0 {
                    self.lr_sharpened.as_ref().unwrap().tex.raw()
                } else {
                    self.unsharp_out[i - 1].tex.raw()
                };
                self.gl.bind_texture(glow::TEXTURE_RECTANGLE, Some(input_raw));
            }
            self.gaussian_blur.as_ref().unwrap().tex.bind_to_unit(1);
            self.input_blurred.as_ref().unwrap().tex.bind_to_unit(2);

            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_i32(uniforms::BLURRED_IMAGE, 1);
            prog.set_i32(uniforms::INPUT_IMAGE_BLURRED, 2);
            prog.set_bool(uniforms::IS_MONO, self.mono);
            prog.set_bool(uniforms::ADAPTIVE, mask.adaptive);
            prog.set_f32(uniforms::AMOUNT_MIN, mask.amount_min);
            prog.set_f32(uniforms::AMOUNT_MAX, mask.amount_max);
            prog.set_f32(uniforms::THRESHOLD, mask.threshold);
            prog.set_f32(uniforms::WIDTH, mask.width);
            prog.set_ivec2(uniforms::SELECTION_POS, self.selection.x, self.selection.y);
            prog.set_vec4(uniforms::TRANSITION_CURVE, transition_curve(&mask));

            self.quad.set_rect(0.0, 0.0, w as f32, h as f32);
            self.quad.draw();
        }

        self.validity.unsharp = true;
        Ok(())
    }

    // Blurs `src` (addressed by raw id) into the shared blur target.
    fn gaussian_convolution_raw(&mut self, src: glow::Texture, kernel: &[f32]) -> Result<()> {
        let (w, h) = self.selection_size();
        self.ensure_tex_fbo_aux(w, h)?;
        self.quad.set_rect(0.0, 0.0, w as f32, h as f32);

        {
            let aux = self.aux.as_ref().unwrap();
            aux.bind();
            let prog = &self.programs.gaussian_horz;
            prog.use_program();
            unsafe {
                self.gl.active_texture(glow::TEXTURE0);
                self.gl.bind_texture(glow::TEXTURE_RECTANGLE, Some(src));
            }
            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_bool(uniforms::IS_MONO, self.mono);
            prog.set_i32(uniforms::KERNEL_RADIUS, kernel.len() as i32);
            prog.set_f32_array(uniforms::GAUSSIAN_KERNEL, kernel);
            self.quad.draw();
        }

        {
            let dest = self.gaussian_blur.as_ref().unwrap();
            dest.bind();
            let prog = &self.programs.gaussian_vert;
            prog.use_program();
            self.aux.as_ref().unwrap().tex.bind_to_unit(0);
            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_i32(uniforms::KERNEL_RADIUS, kernel.len() as i32);
            prog.set_f32_array(uniforms::GAUSSIAN_KERNEL, kernel);
            self.quad.draw();
        }
        Ok(())
    }

    fn run_tone_curve(&mut self) -> Result<()> {
        self.validity.tone_curve = false;
        self.progress.set(0.0, Some("Applying tone curve: 0%"));

        let (w, h) = self.selection_size();
        let needs = match &self.tone_out {
            Some(tf) => tf.tex.width() != w || tf.tex.height() != h,
            None => true,
        };
        if needs {
            self.tone_out = Some(TexFbo::new(self.gl.clone(), w, h, self.mono)?);
        }

        let curve = &self.settings.tone_curve;
        if curve.points().len() > MAX_CURVE_POINTS {
            return Err(Error::invalid_arg(format!(
                "the GPU tone curve supports at most {MAX_CURVE_POINTS} points"
            )));
        }

        let mut points = Vec::with_capacity(curve.points().len() * 2);
        for p in curve.points() {
            points.push(p.x);
            points.push(p.y);
        }
        let mut splines = Vec::with_capacity(curve.spline_segments().len() * 4);
        for s in curve.spline_segments() {
            splines.extend_from_slice(&[s.a, s.b, s.c, s.d]);
        }
        if splines.is_empty() {
            splines.extend_from_slice(&[0.0; 4]);
        }

        let prog = &self.programs.tone_curve;
        self.tone_out.as_ref().unwrap().bind();
        prog.use_program();
        let last_unsharp = self.unsharp_out.last().ok_or_else(|| {
            Error::Internal("tone curve stage ran before unsharp masking".into())
        })?;
        last_unsharp.tex.bind_to_unit(0);
        prog.set_i32(uniforms::IMAGE, 0);
        prog.set_bool(uniforms::IS_MONO, self.mono);
        prog.set_i32(uniforms::NUM_POINTS, curve.points().len() as i32);
        prog.set_vec2_array(uniforms::CURVE_POINTS, &points);
        prog.set_vec4_array(uniforms::SPLINES, &splines);
        prog.set_bool(uniforms::SMOOTH, curve.is_smooth());
        prog.set_bool(uniforms::IS_GAMMA, curve.is_gamma_mode());
        prog.set_f32(uniforms::GAMMA, curve.gamma());

        self.quad.set_rect(0.0, 0.0, w as f32, h as f32);
        self.quad.draw();

        self.validity.tone_curve = true;
        Ok(())
    }

    // Runs the stages after sharpening; they are cheap single passes.
    fn finish_pipeline(&mut self) -> Result<()> {
        self.run_unsharp_masking()?;
        self.run_tone_curve()?;
        self.run_active = false;
        self.pending_done = Some(CompletionStatus::Completed);
        self.progress.finish(Some("Idle"));
        Ok(())
    }

    fn upload_image(&mut self) -> Result<()> {
        let img = self.img.as_ref().unwrap();
        let channels = if self.mono { 1 } else { 3 };
        let mut data =
            Vec::with_capacity(img.width() as usize * img.height() as usize * channels);
        for y in 0..img.height() {
            data.extend_from_slice(
                &img.row_as::<f32>(y)[..img.width() as usize * channels],
            );
        }
        self.original_tex = Some(Texture::new(
            self.gl.clone(),
            img.width(),
            img.height(),
            self.mono,
            Some(&data),
        )?);

        // blurred full image for adaptive unsharp masking
        let needs = match &self.input_blurred {
            Some(tf) => tf.tex.width() != img.width() || tf.tex.height() != img.height(),
            None => true,
        };
        if needs {
            self.input_blurred =
                Some(TexFbo::new(self.gl.clone(), img.width(), img.height(), self.mono)?);
        }
        let kernel = Self::half_kernel_clamped(RAW_IMAGE_BLUR_SIGMA);
        let (iw, ih) = (img.width(), img.height());
        self.quad.set_rect(0.0, 0.0, iw as f32, ih as f32);
        let original = self.original_tex.as_ref().unwrap().raw();
        {
            // horizontal into aux sized to the full image, vertical into
            // input_blurred
            let needs_aux = match &self.aux {
                Some(tf) => tf.tex.width() != iw || tf.tex.height() != ih,
                None => true,
            };
            if needs_aux {
                self.aux = Some(TexFbo::new(self.gl.clone(), iw, ih, self.mono)?);
            }
            let aux = self.aux.as_ref().unwrap();
            aux.bind();
            let prog = &self.programs.gaussian_horz;
            prog.use_program();
            unsafe {
                self.gl.active_texture(glow::TEXTURE0);
                self.gl.bind_texture(glow::TEXTURE_RECTANGLE, Some(original));
            }
            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_bool(uniforms::IS_MONO, self.mono);
            prog.set_i32(uniforms::KERNEL_RADIUS, kernel.len() as i32);
            prog.set_f32_array(uniforms::GAUSSIAN_KERNEL, &kernel);
            self.quad.draw();

            let dest = self.input_blurred.as_ref().unwrap();
            dest.bind();
            let prog = &self.programs.gaussian_vert;
            prog.use_program();
            self.aux.as_ref().unwrap().tex.bind_to_unit(0);
            prog.set_i32(uniforms::IMAGE, 0);
            prog.set_i32(uniforms::KERNEL_RADIUS, kernel.len() as i32);
            prog.set_f32_array(uniforms::GAUSSIAN_KERNEL, &kernel);
            self.quad.draw();
        }
        Ok(())
    }
}

impl ProcessingBackend for GpuProcessing {
    fn set_image(&mut self, img: Image) -> Result<()> {
        match img.pixel_format() {
            PixelFormat::Mono32f => self.mono = true,
            PixelFormat::Rgb32f => self.mono = false,
            other => {
                return Err(Error::invalid_arg(format!(
                    "back end requires MONO32F or RGB32F input, got {other:?}"
                )))
            }
        }
        self.selection = img.rect();
        self.img = Some(img);
        self.validity = OutputValidity::default();
        self.lr_state = None;
        self.upload_image()
    }

    fn set_selection(&mut self, selection: Rect) -> Result<()> {
        let img = self.img.as_ref().ok_or_else(|| Error::invalid_arg("image not set"))?;
        let clamped = selection.clamped(&img.rect());
        if clamped.width == 0 || clamped.height == 0 {
            return Err(Error::invalid_arg("selection lies outside the image"));
        }
        self.selection = clamped;
        self.validity = OutputValidity::default();
        self.lr_state = None;
        Ok(())
    }

    fn set_settings(&mut self, settings: ProcessingSettings) {
        // any change while iterating invalidates the run
        self.lr_state = None;
        self.settings = settings;
        self.validity = OutputValidity::default();
    }

    fn start(&mut self, request: ProcessingRequest) -> Result<()> {
        if self.img.is_none() {
            return Err(Error::invalid_arg("set an image before starting processing"));
        }
        if self.run_active {
            self.abort_requested = true;
            self.scheduled = Some(request);
            return Ok(());
        }

        debug!("starting GPU pipeline run: {request:?}");
        self.abort_requested = false;
        self.run_active = true;

        // escalate to the first invalid upstream stage
        let request = match request {
            ProcessingRequest::ToneCurve if !self.validity.unsharp => {
                ProcessingRequest::UnsharpMasking { mask_idx: 0 }
            }
            other => other,
        };
        let request = match request {
            ProcessingRequest::UnsharpMasking { .. } if !self.validity.sharpening => {
                ProcessingRequest::Sharpening
            }
            other => other,
        };

        match request {
            ProcessingRequest::Sharpening => {
                self.start_lr()?;
                if self.lr_state.is_none() {
                    // zero iterations: complete the rest synchronously
                    self.finish_pipeline()?;
                }
            }
            ProcessingRequest::UnsharpMasking { .. } => {
                self.finish_pipeline()?;
            }
            ProcessingRequest::ToneCurve => {
                self.run_tone_curve()?;
                self.run_active = false;
                self.pending_done = Some(CompletionStatus::Completed);
                self.progress.finish(Some("Idle"));
            }
        }
        Ok(())
    }

    fn step(&mut self) -> StepResult {
        if let Some(status) = self.pending_done.take() {
            return StepResult::Done(status);
        }
        if !self.run_active {
            if let Some(request) = self.scheduled.take() {
                if self.start(request).is_err() {
                    return StepResult::Idle;
                }
                return StepResult::Busy;
            }
            return StepResult::Idle;
        }

        if self.abort_requested {
            self.run_active = false;
            self.lr_state = None;
            self.abort_requested = false;
            self.progress.finish(Some("Idle"));
            return StepResult::Done(CompletionStatus::Aborted);
        }

        match self.issue_lr_command_batch() {
            Ok(true) => {
                if let Err(err) = self.finish_pipeline() {
                    log::error!("GPU pipeline failed: {err}");
                    self.run_active = false;
                    return StepResult::Done(CompletionStatus::Aborted);
                }
                StepResult::Busy
            }
            Ok(false) => StepResult::Busy,
            Err(err) => {
                log::error!("GPU pipeline failed: {err}");
                self.run_active = false;
                StepResult::Done(CompletionStatus::Aborted)
            }
        }
    }

    fn abort(&mut self) {
        if self.run_active {
            self.abort_requested = true;
        }
    }

    fn is_processing(&self) -> bool {
        self.run_active
    }

    fn set_progress_sink(&mut self, sink: SharedProgress) {
        self.progress = sink;
    }

    fn processed_output(&mut self) -> Result<Image> {
        loop {
            match self.step() {
                StepResult::Busy | StepResult::Done(_) => {}
                StepResult::Idle => break,
            }
        }
        if !self.validity.tone_curve {
            self.start(ProcessingRequest::Sharpening)?;
            loop {
                match self.step() {
                    StepResult::Busy => {}
                    StepResult::Done(_) | StepResult::Idle => break,
                }
            }
        }

        let tone = self
            .tone_out
            .as_ref()
            .ok_or_else(|| Error::Internal("no tone curve output".into()))?;
        let data = tone.tex.read_back(self.mono);

        let format = if self.mono { PixelFormat::Mono32f } else { PixelFormat::Rgb32f };
        let channels = if self.mono { 1usize } else { 3 };
        let (w, h) = self.selection_size();
        let mut img = Image::new(w, h, format);
        for y in 0..h {
            let start = y as usize * w as usize * channels;
            img.row_as_mut::<f32>(y)
                .copy_from_slice(&data[start..start + w as usize * channels]);
        }
        Ok(img)
    }
}
