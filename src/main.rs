// =============================================================================
// EMU-GFX DEMO - Emulator video output through the Gl facade
// =============================================================================
//
// Shows the rendering layer the way an emulator front end drives it: a
// generated 256x224 "emulator frame" is uploaded every frame and drawn as a
// letterboxed quad onto the window's control surface.
//
// FRAME FLOW:
// 1. Bind the control surface, clear it
// 2. Upload the new emulator frame into its texture
// 3. Bind the blit pipeline, stage uniforms, bind the frame texture
// 4. Draw the quad (uniforms reach the GPU here), present
//
// RECOVERY:
// - SurfaceOutOfDate -> resize the surface on the next frame
// - DeviceLost       -> reset_surface, then rebuild pipeline and texture
//
// Shaders are loaded from shaders/*.spv (built by build.rs) and watched; a
// changed .spv rebuilds the pipeline in place.
//
// =============================================================================

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use emu_gfx::backend::{AttribFormat, ShaderStage, TextureFilter, VertexLayout};
use emu_gfx::config::Config;
use emu_gfx::gl::{
    create_backend, ControlParameters, Gl, PipelineCompileArgs, PipelineHandle, Renderer,
    TextureHandle,
};
use emu_gfx::logging::{init_logging, LoggingConfig};
use emu_gfx::GfxError;
use glam::Vec4;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

/// Native resolution of the simulated emulator output.
const FRAME_WIDTH: u32 = 256;
const FRAME_HEIGHT: u32 = 224;

const SHADER_DIR: &str = "shaders";
const VERTEX_SHADER: &str = "shaders/blit.vert.spv";
const FRAGMENT_SHADER: &str = "shaders/blit.frag.spv";

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&LoggingConfig::from(&config.debug));

    log::info!("Starting emu-gfx demo");
    log::info!(
        "Window: {}x{} ({}), backend: {:?}",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" },
        config.graphics.backend
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// SCENE
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

/// Device-owned objects the demo draws with. Rebuilt after every reset.
struct Scene {
    pipeline: PipelineHandle,
    frame: TextureHandle,
}

impl Scene {
    fn create(renderer: &mut Renderer) -> Result<Self> {
        let pipeline = load_pipeline(renderer)?;
        let frame = renderer
            .create_texture(FRAME_WIDTH, FRAME_HEIGHT)
            .context("Failed to create the emulator frame texture")?;
        // Pixel art stays sharp
        renderer.set_texture_filter(frame, TextureFilter::Nearest)?;
        Ok(Self { pipeline, frame })
    }

    /// Also valid for objects from a previous device generation.
    fn destroy(self, renderer: &mut Renderer) {
        if let Err(e) = renderer.destroy_pipeline(self.pipeline) {
            log::warn!("Failed to destroy pipeline: {}", e);
        }
        if let Err(e) = renderer.destroy_texture(self.frame) {
            log::warn!("Failed to destroy frame texture: {}", e);
        }
    }
}

fn load_pipeline(renderer: &mut Renderer) -> Result<PipelineHandle> {
    let vertex = std::fs::read(VERTEX_SHADER)
        .with_context(|| format!("Failed to read {}", VERTEX_SHADER))?;
    let fragment = std::fs::read(FRAGMENT_SHADER)
        .with_context(|| format!("Failed to read {}", FRAGMENT_SHADER))?;

    let layout = VertexLayout::new()
        .with("position", AttribFormat::Float2)
        .with("uv", AttribFormat::Float2);
    let args = PipelineCompileArgs::new(vertex, fragment, layout)
        .with_uniform("mvp", ShaderStage::Vertex, 0, 0, 64)
        .with_uniform("tint", ShaderStage::Pixel, 0, 0, 16)
        .with_sampler("frame", 0);

    renderer
        .create_pipeline(&args)
        .context("Failed to create the blit pipeline")
}

/// A moving checkerboard standing in for emulator output (B8G8R8A8).
fn emulator_frame(frame: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((FRAME_WIDTH * FRAME_HEIGHT * 4) as usize);
    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let checker = ((x / 16) + (y / 16) + frame / 8) % 2 == 0;
            let shade = if checker { 0xE0 } else { 0x30 };
            pixels.extend_from_slice(&[shade, y as u8, (x as u8).wrapping_add(frame as u8), 0xFF]);
        }
    }
    pixels
}

/// The frame scaled to fit the surface, aspect ratio kept, in pixels.
fn letterboxed_quad(width: u32, height: u32) -> [Vertex; 6] {
    let scale = (width as f32 / FRAME_WIDTH as f32).min(height as f32 / FRAME_HEIGHT as f32);
    let w = FRAME_WIDTH as f32 * scale;
    let h = FRAME_HEIGHT as f32 * scale;
    let x0 = (width as f32 - w) / 2.0;
    let y0 = (height as f32 - h) / 2.0;
    let (x1, y1) = (x0 + w, y0 + h);

    let v = |x: f32, y: f32, u: f32, v: f32| Vertex {
        position: [x, y],
        uv: [u, v],
    };
    [
        v(x0, y0, 0.0, 0.0),
        v(x1, y0, 1.0, 0.0),
        v(x0, y1, 0.0, 1.0),
        v(x0, y1, 0.0, 1.0),
        v(x1, y0, 1.0, 0.0),
        v(x1, y1, 1.0, 1.0),
    ]
}

fn draw_frame(
    renderer: &mut Renderer,
    scene: &Scene,
    clear_color: [f32; 4],
    frame_index: u32,
) -> emu_gfx::Result<()> {
    let Some(surface) = renderer.surface() else {
        return Ok(());
    };

    renderer.bind_default_target()?;
    renderer.clear_color(clear_color)?;
    renderer.load_texture(scene.frame, &emulator_frame(frame_index))?;

    renderer.bind_pipeline(Some(scene.pipeline))?;
    renderer.set_uniform_sampler(scene.pipeline, "frame", scene.frame)?;

    let (w, h) = (surface.width as f32, surface.height as f32);
    let mvp = renderer.create_projection_matrix(w, h) * renderer.create_view_matrix(w, h, false);
    renderer.set_uniform_mat4(scene.pipeline, "mvp", &mvp, false)?;
    renderer.set_uniform_vec4(scene.pipeline, "tint", Vec4::ONE)?;

    let quad = letterboxed_quad(surface.width, surface.height);
    renderer.draw(bytemuck::cast_slice(&quad), quad.len() as u32)?;
    renderer.present()
}

fn control_parameters(window: &Window) -> Result<ControlParameters> {
    let size = window.inner_size();
    Ok(ControlParameters {
        window: window
            .window_handle()
            .context("Window has no native handle")?
            .as_raw(),
        display: window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw(),
        width: size.width.max(1),
        height: size.height.max(1),
    })
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The scene and renderer go
/// before the window their surface is bound to.
struct App {
    config: Config,
    scene: Option<Scene>,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // Shader hot reload
    _watcher: Option<RecommendedWatcher>,
    shader_events: Option<Receiver<notify::Result<notify::Event>>>,

    /// Set when the window is resized or the surface went out of date
    needs_resize: bool,
    /// Window has zero size - skip rendering
    is_minimized: bool,

    frame_index: u32,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            scene: None,
            renderer: None,
            window: None,
            is_fullscreen,
            _watcher: None,
            shader_events: None,
            needs_resize: false,
            is_minimized: false,
            frame_index: 0,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_graphics(&mut self, window: &Window) -> Result<()> {
        let mut renderer =
            create_backend(&self.config, None).context("Failed to create the rendering backend")?;

        let surface = renderer
            .create_surface(&control_parameters(window)?)
            .context("Failed to create the control surface")?;
        log::info!(
            "Surface {}x{} ({:?}, tearing: {}), interop: {}",
            surface.width,
            surface.height,
            surface.effect,
            surface.allow_tearing,
            renderer.has_interop()
        );

        self.scene = Some(Scene::create(&mut renderer)?);
        self.renderer = Some(renderer);
        self.watch_shaders();
        Ok(())
    }

    fn watch_shaders(&mut self) {
        let (tx, rx) = channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                log::warn!("Shader hot reload disabled: {}", e);
                return;
            }
        };
        if let Err(e) = watcher.watch(Path::new(SHADER_DIR), RecursiveMode::NonRecursive) {
            log::warn!("Shader hot reload disabled, cannot watch {}: {}", SHADER_DIR, e);
            return;
        }

        log::info!("Watching {} for shader changes", SHADER_DIR);
        self._watcher = Some(watcher);
        self.shader_events = Some(rx);
    }

    fn reload_shaders_if_changed(&mut self) {
        let Some(events) = self.shader_events.as_ref() else {
            return;
        };

        let mut changed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Ok(event) => {
                    let touches_spirv = event
                        .paths
                        .iter()
                        .any(|p| p.extension().map_or(false, |ext| ext == "spv"));
                    changed |= touches_spirv
                        && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
                }
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        if !changed {
            return;
        }

        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_mut()) else {
            return;
        };
        match load_pipeline(renderer) {
            Ok(pipeline) => {
                let old = std::mem::replace(&mut scene.pipeline, pipeline);
                if let Err(e) = renderer.destroy_pipeline(old) {
                    log::warn!("Failed to destroy the previous pipeline: {}", e);
                }
                log::info!("Shaders reloaded");
            }
            Err(e) => log::warn!("Shader reload failed, keeping the previous pipeline: {:#}", e),
        }
    }

    // =========================================================================
    // RECOVERY
    // =========================================================================

    fn resize(&mut self) -> Result<()> {
        self.needs_resize = false;
        let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut()) else {
            return Ok(());
        };

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        match renderer.resize_surface(size.width, size.height) {
            Ok(_) => Ok(()),
            Err(e) => self.handle_gfx_error(e),
        }
    }

    fn recover_device_loss(&mut self) -> Result<()> {
        log::warn!("GPU device lost, rebuilding device resources");
        let window = self.window.as_ref().context("No window to rebuild for")?;
        let params = control_parameters(window)?;
        let renderer = self.renderer.as_mut().context("No renderer to reset")?;

        renderer
            .reset_surface(&params)
            .context("Device reset failed")?;
        if let Some(stale) = self.scene.take() {
            stale.destroy(renderer);
        }
        self.scene = Some(Scene::create(renderer)?);
        Ok(())
    }

    fn handle_gfx_error(&mut self, error: GfxError) -> Result<()> {
        match error {
            GfxError::SurfaceOutOfDate => {
                self.needs_resize = true;
                Ok(())
            }
            GfxError::DeviceLost => self.recover_device_loss(),
            other => Err(other.into()),
        }
    }

    // =========================================================================
    // MAIN RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<bool> {
        if self.needs_resize {
            self.resize()?;
        }
        if self.is_minimized {
            return Ok(false);
        }
        self.reload_shaders_if_changed();

        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_ref()) else {
            return Ok(false);
        };
        if let Err(e) = draw_frame(
            renderer,
            scene,
            self.config.graphics.clear_color,
            self.frame_index,
        ) {
            self.handle_gfx_error(e)?;
            return Ok(false);
        }

        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(true)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    fn toggle_vsync(&mut self) {
        if let Some(renderer) = self.renderer.as_mut() {
            let vsync = !renderer.settings().vsync;
            renderer.set_vsync(vsync);
            log::info!("VSync {}", if vsync { "on" } else { "off" });
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut()) {
                let stats = renderer.stats();
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{} uploads, {} reallocs]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    stats.vertex_uploads + stats.constant_uploads,
                    stats.vertex_reallocations
                ));
                renderer.reset_stats();
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_graphics(&window) {
            log::error!("Failed to initialize graphics: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(e) = renderer.flush() {
                        log::warn!("Final flush failed: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::KeyV => self.toggle_vsync(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Continuous redraws, like an emulator running flat out.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
