// GL facade - what the video output layer talks to
//
// Components, in dependency order:
// - resources:     device, immediate context, cached fixed-function state
// - swapchain:     the control surface and its presentation-model negotiation
// - pipeline:      programs with growable vertex / constant buffers
// - render_target: off-screen targets and sampled textures
// - interop:       optional texture sharing with a second GPU context
// - renderer:      the `Gl` implementation tying them together

pub mod interop;
mod pipeline;
mod render_target;
mod renderer;
mod resources;
mod swapchain;

use crate::backend::{
    DispMethod, HeadlessDriver, SwapEffect, TargetId, TextureFilter, TextureId, VulkanDriver,
    VulkanSettings,
};
use crate::config::Config;
use crate::error::Result;
use glam::{Mat4, Vec2, Vec4};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use slotmap::new_key_type;

pub use interop::{InteropPeer, SharedInteropPeer};
pub use pipeline::{PipelineCompileArgs, SamplerDecl, UniformDecl};
pub use renderer::{DrawStats, Renderer, RendererSettings};

new_key_type! {
    pub struct PipelineHandle;
    pub struct TextureHandle;
    pub struct RenderTargetHandle;
}

/// Window the control surface is bound to.
#[derive(Debug, Clone, Copy)]
pub struct ControlParameters {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
    pub width: u32,
    pub height: u32,
}

/// Snapshot of the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceHandle {
    pub width: u32,
    pub height: u32,
    pub effect: SwapEffect,
    pub allow_tearing: bool,
    pub back_buffer: TextureId,
    pub view: TargetId,
    /// Device generation the surface was created for.
    pub generation: u64,
}

/// Backend-agnostic rendering interface.
pub trait Gl {
    fn disp_method(&self) -> DispMethod;

    // ── control surface ──────────────────────────────────────────────────

    /// Fails with `InvalidOperation` if a control surface already exists.
    fn create_surface(&mut self, params: &ControlParameters) -> Result<SurfaceHandle>;

    /// Rebuilds every device resource after device loss, then the surface.
    /// Pipelines, textures and render targets from before are stale.
    fn reset_surface(&mut self, params: &ControlParameters) -> Result<SurfaceHandle>;

    fn surface(&self) -> Option<SurfaceHandle>;
    fn resize_surface(&mut self, width: u32, height: u32) -> Result<SurfaceHandle>;
    fn present(&mut self) -> Result<()>;

    // ── pipelines ────────────────────────────────────────────────────────

    fn create_pipeline(&mut self, args: &PipelineCompileArgs) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;
    fn bind_pipeline(&mut self, pipeline: Option<PipelineHandle>) -> Result<()>;

    /// Draws `count` vertices of the bound pipeline's layout from `vertices`.
    fn draw(&mut self, vertices: &[u8], count: u32) -> Result<()>;

    /// Stages raw bytes for a uniform; they reach the GPU on the next draw.
    fn set_uniform(&mut self, pipeline: PipelineHandle, name: &str, data: &[u8]) -> Result<()>;

    fn set_uniform_mat4(
        &mut self,
        pipeline: PipelineHandle,
        name: &str,
        value: &Mat4,
        transpose: bool,
    ) -> Result<()> {
        let value = if transpose { value.transpose() } else { *value };
        self.set_uniform(pipeline, name, bytemuck::bytes_of(&value))
    }

    fn set_uniform_vec4(&mut self, pipeline: PipelineHandle, name: &str, value: Vec4) -> Result<()> {
        self.set_uniform(pipeline, name, bytemuck::bytes_of(&value))
    }

    fn set_uniform_vec2(&mut self, pipeline: PipelineHandle, name: &str, value: Vec2) -> Result<()> {
        self.set_uniform(pipeline, name, bytemuck::bytes_of(&value))
    }

    fn set_uniform_f32(&mut self, pipeline: PipelineHandle, name: &str, value: f32) -> Result<()> {
        self.set_uniform(pipeline, name, bytemuck::bytes_of(&value))
    }

    /// Booleans occupy 32 bits in uniform blocks.
    fn set_uniform_bool(&mut self, pipeline: PipelineHandle, name: &str, value: bool) -> Result<()> {
        self.set_uniform(pipeline, name, bytemuck::bytes_of(&(value as u32)))
    }

    /// Binds `texture` to the sampler named `name`. The pipeline must be bound.
    fn set_uniform_sampler(
        &mut self,
        pipeline: PipelineHandle,
        name: &str,
        texture: TextureHandle,
    ) -> Result<()>;

    // ── textures and render targets ──────────────────────────────────────

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle>;

    /// Replaces the whole texture with B8G8R8A8 pixels.
    fn load_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> Result<()>;
    fn set_texture_filter(&mut self, texture: TextureHandle, filter: TextureFilter) -> Result<()>;
    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()>;

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<RenderTargetHandle>;
    fn render_target_texture(&self, target: RenderTargetHandle) -> Result<TextureHandle>;
    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> Result<()>;
    fn bind_render_target(&mut self, target: RenderTargetHandle) -> Result<()>;
    fn bind_default_target(&mut self) -> Result<()>;

    // ── fixed-function state ─────────────────────────────────────────────

    /// Clears whichever target is bound.
    fn clear_color(&mut self, color: [f32; 4]) -> Result<()>;
    fn enable_blending(&mut self) -> Result<()>;
    fn disable_blending(&mut self) -> Result<()>;

    /// Sets the viewport and the matching scissor rectangle.
    fn set_viewport(&mut self, x: i32, y: i32, width: u32, height: u32) -> Result<()>;

    fn create_projection_matrix(&self, width: f32, height: f32) -> Mat4;
    fn create_view_matrix(&self, width: f32, height: f32, auto_flip: bool) -> Mat4;

    // ── interop ──────────────────────────────────────────────────────────

    fn has_interop(&self) -> bool;

    /// Shares a new texture with the secondary context, which aliases its
    /// texture `foreign_id` onto the same memory.
    fn wrap_external_texture(
        &mut self,
        foreign_id: u32,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle>;

    // ── misc ─────────────────────────────────────────────────────────────

    fn flush(&mut self) -> Result<()>;
    fn stats(&self) -> DrawStats;
    fn reset_stats(&mut self);
}

/// Builds the renderer for the configured backend.
///
/// `interop` is the secondary context, if the application owns one; it is
/// ignored when interop is disabled in the config.
pub fn create_backend(config: &Config, interop: Option<SharedInteropPeer>) -> Result<Renderer> {
    let settings = RendererSettings {
        allow_tearing: config.graphics.allow_tearing,
        vsync: config.graphics.vsync,
    };
    let interop = if config.interop.enabled { interop } else { None };

    match config.graphics.backend {
        DispMethod::Vulkan => {
            let driver = VulkanDriver::new(VulkanSettings {
                app_name: config.window.title.clone(),
                validation: config.debug.validation_layers,
            });
            Renderer::new(Box::new(driver), interop, settings)
        }
        DispMethod::Headless => {
            let driver = HeadlessDriver::new(config.headless);
            Renderer::new(Box::new(driver), interop, settings)
        }
    }
}
