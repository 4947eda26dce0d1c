// Renderer - the `Gl` implementation
//
// Reset order (device loss):
// 1. Release the control swap chain and flush, so the old back buffer is
//    really gone before anything is rebuilt
// 2. Close the interop bridge
// 3. Destroy, then create, the device resources (new generation)
// 4. Reopen the interop bridge
// 5. Recreate the control surface, re-apply blend state, target, viewport
// A failure anywhere after step 2 leaves the device destroyed.

use crate::backend::{DispMethod, Driver, ShaderStage, TextureFilter, Viewport};
use crate::error::{GfxError, Result};
use crate::gl::interop::{InteropBridge, SharedInteropPeer};
use crate::gl::pipeline::{Pipeline, PipelineCompileArgs};
use crate::gl::render_target::{TextureOwner, Targets};
use crate::gl::resources::DeviceResources;
use crate::gl::swapchain::ControlSurface;
use crate::gl::{
    ControlParameters, Gl, PipelineHandle, RenderTargetHandle, SurfaceHandle, TextureHandle,
};
use crate::math;
use glam::Mat4;
use slotmap::SlotMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererSettings {
    /// Ask for a tear-capable surface when the platform offers one.
    pub allow_tearing: bool,
    pub vsync: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            allow_tearing: true,
            vsync: true,
        }
    }
}

/// Counters for the work `draw` sent to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub draws: u64,
    /// Write-discard refills of an existing vertex buffer.
    pub vertex_uploads: u64,
    /// Vertex buffers replaced by a larger one.
    pub vertex_reallocations: u64,
    pub constant_uploads: u64,
}

pub struct Renderer {
    surface: Option<ControlSurface>,
    pipelines: SlotMap<PipelineHandle, Pipeline>,
    targets: Targets,
    interop: Option<InteropBridge>,
    settings: RendererSettings,
    stats: DrawStats,
    blending: bool,
    // Last, so the device outlives everything above
    resources: DeviceResources,
}

impl Renderer {
    /// Fails with `Unsupported` when the driver cannot run on this host.
    pub fn new(
        driver: Box<dyn Driver>,
        interop: Option<SharedInteropPeer>,
        settings: RendererSettings,
    ) -> Result<Self> {
        let resources = DeviceResources::new(driver)?;
        let caps = resources.device_ref()?.caps();

        let mut interop = InteropBridge::probe(interop, caps);
        if let Some(bridge) = interop.as_mut() {
            if let Err(err) = bridge.open() {
                log::warn!("Interop bridge failed to open, continuing without it: {}", err);
                interop = None;
            }
        }

        let mut renderer = Self {
            surface: None,
            pipelines: SlotMap::with_key(),
            targets: Targets::new(),
            interop,
            settings,
            stats: DrawStats::default(),
            blending: false,
            resources,
        };
        renderer.apply_blend_state()?;
        Ok(renderer)
    }

    pub fn settings(&self) -> RendererSettings {
        self.settings
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.settings.vsync = vsync;
    }

    /// Generation of the live device resources; bumped by every reset.
    pub fn generation(&self) -> u64 {
        self.resources.generation()
    }

    pub fn current_pipeline(&self) -> Option<PipelineHandle> {
        self.resources.current_pipeline
    }

    pub fn current_render_target(&self) -> Option<RenderTargetHandle> {
        self.resources.current_render_target
    }

    /// Vertices the pipeline's vertex buffer holds without reallocating.
    pub fn pipeline_vertex_capacity(&self, pipeline: PipelineHandle) -> Result<u32> {
        self.pipelines
            .get(pipeline)
            .map(|p| p.vertex_capacity())
            .ok_or(GfxError::InvalidHandle("pipeline"))
    }

    /// Whether a staged uniform write for `block` is waiting for the next draw.
    pub fn is_uniform_dirty(
        &self,
        pipeline: PipelineHandle,
        block: u32,
        stage: ShaderStage,
    ) -> Result<bool> {
        self.pipelines
            .get(pipeline)
            .map(|p| p.is_dirty(block, stage))
            .ok_or(GfxError::InvalidHandle("pipeline"))
    }

    fn check_pipeline(&self, pipeline: PipelineHandle) -> Result<()> {
        let created = self
            .pipelines
            .get(pipeline)
            .ok_or(GfxError::InvalidHandle("pipeline"))?
            .generation();
        self.resources.check("pipeline", created)
    }

    fn apply_blend_state(&mut self) -> Result<()> {
        let states = self.resources.states()?;
        let state = if self.blending {
            states.blend_enabled
        } else {
            states.blend_disabled
        };
        self.resources.device()?.set_blend_state(state);
        Ok(())
    }

    fn apply_full_viewport(&mut self) -> Result<()> {
        if let Some(surface) = self.surface() {
            self.set_viewport(0, 0, surface.width, surface.height)?;
        }
        Ok(())
    }

    /// Steps 3 to 5 of a reset.
    fn rebuild(&mut self, params: &ControlParameters) -> Result<SurfaceHandle> {
        self.resources.create_resources()?;
        if let Some(bridge) = self.interop.as_mut() {
            bridge.open()?;
        }

        let generation = self.resources.generation();
        let device = self.resources.device()?;
        let surface =
            ControlSurface::create(device, params, self.settings.allow_tearing, generation)?;
        let handle = surface.handle();
        self.surface = Some(surface);

        self.apply_blend_state()?;
        self.bind_default_target()?;
        self.apply_full_viewport()?;
        Ok(handle)
    }

    /// Releases the control surface and waits for the device to let go of it.
    ///
    /// A lost device has nothing left to wait for, so `DeviceLost` is not an
    /// error here.
    fn release_surface(&mut self) -> Result<()> {
        let Some(surface) = self.surface.take() else {
            return Ok(());
        };
        let Ok(device) = self.resources.device() else {
            return Ok(());
        };
        surface.release(device);
        match device.flush() {
            Err(err) if err.is_device_lost() => {
                log::warn!("Device lost before the control surface was released");
                Ok(())
            }
            other => other,
        }
    }
}

impl Gl for Renderer {
    fn disp_method(&self) -> DispMethod {
        self.resources.driver().disp_method()
    }

    fn create_surface(&mut self, params: &ControlParameters) -> Result<SurfaceHandle> {
        if self.surface.is_some() {
            return Err(GfxError::InvalidOperation(
                "a control surface already exists".to_string(),
            ));
        }

        let generation = self.resources.generation();
        let device = self.resources.device()?;
        let surface =
            ControlSurface::create(device, params, self.settings.allow_tearing, generation)?;
        let handle = surface.handle();
        self.surface = Some(surface);

        if self.resources.current_render_target.is_none() {
            self.bind_default_target()?;
        }
        self.apply_full_viewport()?;
        Ok(handle)
    }

    fn reset_surface(&mut self, params: &ControlParameters) -> Result<SurfaceHandle> {
        log::info!(
            "Resetting device resources (generation {})",
            self.resources.generation()
        );

        let outcome = self.release_surface().and_then(|()| {
            if let Some(bridge) = self.interop.as_mut() {
                bridge.close();
            }
            self.resources.destroy_resources();
            self.rebuild(params)
        });

        match outcome {
            Ok(handle) => {
                log::info!(
                    "Device reset complete (generation {})",
                    self.resources.generation()
                );
                Ok(handle)
            }
            Err(err) => {
                log::error!("Device reset failed: {}", err);
                self.surface = None;
                if let Some(bridge) = self.interop.as_mut() {
                    bridge.close();
                }
                self.resources.destroy_resources();
                Err(err)
            }
        }
    }

    fn surface(&self) -> Option<SurfaceHandle> {
        self.surface.as_ref().map(|s| s.handle())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<SurfaceHandle> {
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| GfxError::InvalidOperation("no control surface".to_string()))?;
        let device = self.resources.device()?;
        device.flush()?;
        surface.resize(device, width, height)?;
        let handle = surface.handle();

        if self.resources.current_render_target.is_none() {
            self.bind_default_target()?;
        }
        self.apply_full_viewport()?;
        Ok(handle)
    }

    fn present(&mut self) -> Result<()> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| GfxError::InvalidOperation("no control surface".to_string()))?;
        let device = self.resources.device()?;
        surface.present(device, self.settings.vsync)
    }

    fn create_pipeline(&mut self, args: &PipelineCompileArgs) -> Result<PipelineHandle> {
        let generation = self.resources.generation();
        let device = self.resources.device()?;
        let pipeline = Pipeline::create(device, args, generation)?;
        Ok(self.pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        let removed = self
            .pipelines
            .remove(pipeline)
            .ok_or(GfxError::InvalidHandle("pipeline"))?;
        if self.resources.current_pipeline == Some(pipeline) {
            self.resources.current_pipeline = None;
        }

        // Stale pipelines went down with their device
        if removed.generation() == self.resources.generation() {
            if let Ok(device) = self.resources.device() {
                removed.release(device);
            }
        }
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: Option<PipelineHandle>) -> Result<()> {
        let Some(handle) = pipeline else {
            // Native bindings are left as they are
            self.resources.current_pipeline = None;
            return Ok(());
        };

        self.check_pipeline(handle)?;
        let states = self.resources.states()?;
        let device = self.resources.device()?;
        let bound = self
            .pipelines
            .get(handle)
            .ok_or(GfxError::InvalidHandle("pipeline"))?;
        bound.bind(device, states.rasterizer);
        self.resources.current_pipeline = Some(handle);
        Ok(())
    }

    fn draw(&mut self, vertices: &[u8], count: u32) -> Result<()> {
        if !self.resources.is_live() {
            return Err(GfxError::DeviceUnavailable);
        }
        let handle = self
            .resources
            .current_pipeline
            .ok_or(GfxError::NoPipelineBound)?;
        self.check_pipeline(handle)?;

        let device = self.resources.device()?;
        let pipeline = self
            .pipelines
            .get_mut(handle)
            .ok_or(GfxError::InvalidHandle("pipeline"))?;
        pipeline.draw(device, vertices, count, &mut self.stats)
    }

    fn set_uniform(&mut self, pipeline: PipelineHandle, name: &str, data: &[u8]) -> Result<()> {
        self.check_pipeline(pipeline)?;
        self.pipelines
            .get_mut(pipeline)
            .ok_or(GfxError::InvalidHandle("pipeline"))?
            .set_uniform(name, data)
    }

    fn set_uniform_sampler(
        &mut self,
        pipeline: PipelineHandle,
        name: &str,
        texture: TextureHandle,
    ) -> Result<()> {
        self.check_pipeline(pipeline)?;
        if self.resources.current_pipeline != Some(pipeline) {
            return Err(GfxError::InvalidOperation(format!(
                "sampler `{}` set on a pipeline that is not bound",
                name
            )));
        }
        let slot = self
            .pipelines
            .get(pipeline)
            .ok_or(GfxError::InvalidHandle("pipeline"))?
            .sampler_slot(name)?;
        let entry = *self.targets.texture(texture)?;
        self.resources.check("texture", entry.generation)?;

        self.resources.device()?.set_shader_resource(
            ShaderStage::Pixel,
            slot,
            entry.id,
            entry.filter,
        );
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle> {
        let generation = self.resources.generation();
        let device = self.resources.device()?;
        self.targets.create_texture(device, width, height, generation)
    }

    fn load_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> Result<()> {
        let entry = *self.targets.texture(texture)?;
        self.resources.check("texture", entry.generation)?;
        if entry.owner == TextureOwner::RenderTarget {
            return Err(GfxError::InvalidOperation(
                "render target textures are written by drawing".to_string(),
            ));
        }
        let expected = entry.width as usize * entry.height as usize * 4;
        if pixels.len() != expected {
            return Err(GfxError::InvalidArgument(format!(
                "{}x{} texture needs {} bytes, got {}",
                entry.width,
                entry.height,
                expected,
                pixels.len()
            )));
        }
        self.resources.device()?.write_texture(entry.id, pixels)
    }

    fn set_texture_filter(&mut self, texture: TextureHandle, filter: TextureFilter) -> Result<()> {
        let created = self.targets.texture(texture)?.generation;
        self.resources.check("texture", created)?;
        self.targets.texture_mut(texture)?.filter = filter;
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()> {
        let created = self.targets.texture(texture)?.generation;
        let device = if created == self.resources.generation() {
            self.resources.device().ok()
        } else {
            None
        };
        self.targets.destroy_texture(device, texture)
    }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<RenderTargetHandle> {
        let generation = self.resources.generation();
        let device = self.resources.device()?;
        self.targets
            .create_render_target(device, width, height, generation)
    }

    fn render_target_texture(&self, target: RenderTargetHandle) -> Result<TextureHandle> {
        Ok(self.targets.render_target(target)?.texture)
    }

    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> Result<()> {
        let created = self.targets.render_target(target)?.generation;
        if self.resources.current_render_target == Some(target) {
            self.bind_default_target()?;
        }
        let device = if created == self.resources.generation() {
            self.resources.device().ok()
        } else {
            None
        };
        self.targets.destroy_render_target(device, target)
    }

    fn bind_render_target(&mut self, target: RenderTargetHandle) -> Result<()> {
        let entry = *self.targets.render_target(target)?;
        self.resources.check("render target", entry.generation)?;
        self.resources.device()?.set_render_target(entry.view);
        self.resources.current_render_target = Some(target);
        Ok(())
    }

    fn bind_default_target(&mut self) -> Result<()> {
        self.resources.current_render_target = None;
        let view = self.surface.as_ref().map(|s| s.view());
        let device = self.resources.device()?;
        if let Some(view) = view {
            device.set_render_target(view);
        }
        Ok(())
    }

    fn clear_color(&mut self, color: [f32; 4]) -> Result<()> {
        let view = match self.resources.current_render_target {
            Some(target) => {
                let entry = *self.targets.render_target(target)?;
                self.resources.check("render target", entry.generation)?;
                entry.view
            }
            None => self
                .surface
                .as_ref()
                .map(|s| s.view())
                .ok_or_else(|| GfxError::InvalidOperation("no render target bound".to_string()))?,
        };
        self.resources.device()?.clear_render_target(view, color)
    }

    fn enable_blending(&mut self) -> Result<()> {
        self.blending = true;
        self.apply_blend_state()
    }

    fn disable_blending(&mut self) -> Result<()> {
        self.blending = false;
        self.apply_blend_state()
    }

    fn set_viewport(&mut self, x: i32, y: i32, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidArgument(format!(
                "{}x{} viewport",
                width, height
            )));
        }
        self.resources.device()?.set_viewport(Viewport {
            x,
            y,
            width,
            height,
        });
        Ok(())
    }

    fn create_projection_matrix(&self, width: f32, height: f32) -> Mat4 {
        math::projection_matrix(width, height)
    }

    fn create_view_matrix(&self, width: f32, height: f32, auto_flip: bool) -> Mat4 {
        math::view_matrix(width, height, self.resources.driver().clip_space(), auto_flip)
    }

    fn has_interop(&self) -> bool {
        self.interop.as_ref().map_or(false, |bridge| bridge.is_open())
    }

    fn wrap_external_texture(
        &mut self,
        foreign_id: u32,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle> {
        let bridge = self.interop.as_mut().ok_or(GfxError::InteropUnavailable)?;
        let generation = self.resources.generation();
        let device = self.resources.device()?;
        let id = bridge.wrap(device, foreign_id, width, height)?;
        Ok(self
            .targets
            .insert_interop(id, foreign_id, width, height, generation))
    }

    fn flush(&mut self) -> Result<()> {
        self.resources.device()?.flush()
    }

    fn stats(&self) -> DrawStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = DrawStats::default();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Some(bridge) = self.interop.as_mut() {
            bridge.close();
        }
        if let Err(err) = self.release_surface() {
            log::warn!("Releasing the control surface on drop failed: {}", err);
        }
    }
}
