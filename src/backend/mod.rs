// Backend module - native graphics API seam
//
// Design: immediate-context device behind two traits
// - Driver: platform level, survives device resets
// - Device: one live device + its immediate context, rebuilt in full on reset
//
// Objects created by a Device are referred to by plain ids. A Device owns
// everything it created and releases it all when dropped.

pub mod headless;
pub mod vulkan;

use crate::error::{GfxError, Result};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use serde::Deserialize;
use slotmap::new_key_type;

pub use headless::{HeadlessDriver, HeadlessPlatform, Journal, NativeCall};
pub use vulkan::{VulkanDriver, VulkanSettings};

/// Constant buffer slots per shader stage.
pub const MAX_CONSTANT_BUFFER_SLOTS: usize = 14;

/// Sampler / shader resource slots per shader stage.
pub const MAX_SAMPLER_SLOTS: usize = 16;

new_key_type! {
    /// GPU buffer (vertex or constant).
    pub struct BufferId;
    /// 2D texture, including swap chain back buffers.
    pub struct TextureId;
    /// Render target view of a texture.
    pub struct TargetId;
    pub struct SwapChainId;
    /// Shader stages plus their vertex input layout.
    pub struct ProgramId;
    /// Fixed-function state object (blend or rasterizer).
    pub struct StateId;
}

/// Which native API a driver speaks. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispMethod {
    Vulkan,
    Headless,
}

/// Direction of +Y in the driver's clip space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipSpace {
    YUp,
    YDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 2] = [ShaderStage::Vertex, ShaderStage::Pixel];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Flip-model, tear-aware presentation (the extended surface factory).
    pub flip_presentation: bool,
    /// Memory can be exported to another API.
    pub external_memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: usize,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureFilter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// Sampled, CPU writable.
    Dynamic,
    /// Sampled and renderable.
    RenderTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Bytes in one full upload (B8G8R8A8).
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Disabled,
    /// Straight alpha: color src*a + dst*(1-a), alpha src.
    Alpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerDesc {
    pub cull_back_faces: bool,
    pub scissor: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            cull_back_faces: false,
            scissor: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapEffect {
    /// Blit-style presentation.
    Discard,
    /// Flip-style presentation; the only model that can tear.
    FlipDiscard,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapChainDesc {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub effect: SwapEffect,
    pub allow_tearing: bool,
    /// Created through the base factory rather than the extended one.
    pub legacy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainInfo {
    pub width: u32,
    pub height: u32,
    pub effect: SwapEffect,
    pub allow_tearing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttribFormat {
    Float1,
    Float2,
    Float3,
    Float4,
    /// Four normalized bytes (packed color).
    UNorm4,
}

impl AttribFormat {
    pub fn size(&self) -> u32 {
        match self {
            AttribFormat::Float1 => 4,
            AttribFormat::Float2 => 8,
            AttribFormat::Float3 => 12,
            AttribFormat::Float4 => 16,
            AttribFormat::UNorm4 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexAttribute {
    pub name: String,
    pub location: u32,
    pub format: AttribFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLayout {
    pub attributes: Vec<VertexAttribute>,
    /// Bytes per vertex. Zero means "packed": the end of the last attribute.
    pub stride: u32,
}

impl VertexLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an attribute right after the previous one.
    pub fn with(mut self, name: &str, format: AttribFormat) -> Self {
        let offset = self.packed_stride();
        let location = self.attributes.len() as u32;
        self.attributes.push(VertexAttribute {
            name: name.to_string(),
            location,
            format,
            offset,
        });
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    fn packed_stride(&self) -> u32 {
        self.attributes
            .iter()
            .map(|a| a.offset + a.format.size())
            .max()
            .unwrap_or(0)
    }

    pub fn stride(&self) -> u32 {
        if self.stride == 0 {
            self.packed_stride()
        } else {
            self.stride
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

/// Everything a device needs to build a program and its input layout.
#[derive(Debug, Clone)]
pub struct ProgramDesc<'a> {
    pub vertex_spirv: &'a [u32],
    pub vertex_entry: &'a str,
    pub fragment_spirv: &'a [u32],
    pub fragment_entry: &'a str,
    pub layout: &'a VertexLayout,
    pub topology: Topology,
    /// Constant buffer slots used by each stage.
    pub constant_buffers: &'a [(ShaderStage, u32)],
    /// Pixel stage sampler slots.
    pub samplers: &'a [u32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalHandleKind {
    OpaqueFd,
}

/// Exported device memory backing an interop texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalMemory {
    pub kind: ExternalHandleKind,
    pub handle: i64,
    pub size: u64,
}

/// Decodes SPIR-V bytes into words, checking the magic number.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut std::io::Cursor::new(bytes))
        .map_err(|e| GfxError::InvalidArgument(format!("bad SPIR-V: {}", e)))
}

/// Platform level entry point of a native API.
pub trait Driver {
    fn disp_method(&self) -> DispMethod;

    /// Fails with [`GfxError::Unsupported`] when the host cannot run this API.
    fn check_platform(&self) -> Result<()>;

    fn clip_space(&self) -> ClipSpace;

    /// Allocates a device, its immediate context, the surface factory and
    /// nothing else.
    fn create_device(&mut self) -> Result<Box<dyn Device>>;
}

/// A live device and its immediate context.
///
/// Not thread safe; every call comes from the thread that owns the backend.
pub trait Device {
    fn adapter_name(&self) -> &str;

    fn caps(&self) -> DeviceCaps;

    // ── fixed-function state ─────────────────────────────────────────────

    fn create_blend_state(&mut self, mode: BlendMode) -> Result<StateId>;
    fn create_rasterizer_state(&mut self, desc: &RasterizerDesc) -> Result<StateId>;
    fn set_blend_state(&mut self, state: StateId);
    fn set_rasterizer_state(&mut self, state: StateId);

    // ── buffers ──────────────────────────────────────────────────────────

    fn create_buffer(&mut self, desc: &BufferDesc, initial: Option<&[u8]>) -> Result<BufferId>;

    /// Map with discard, copy `data` to the start of the buffer, unmap.
    ///
    /// Never waits for the GPU to finish reading the previous contents.
    fn write_discard(&mut self, buffer: BufferId, data: &[u8]) -> Result<()>;

    fn release_buffer(&mut self, buffer: BufferId);

    // ── programs ─────────────────────────────────────────────────────────

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramId>;
    fn release_program(&mut self, program: ProgramId);

    // ── textures and render target views ─────────────────────────────────

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId>;

    /// Creates a sampled texture whose memory can be imported elsewhere.
    fn create_exportable_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<(TextureId, ExternalMemory)>;

    fn write_texture(&mut self, texture: TextureId, pixels: &[u8]) -> Result<()>;
    fn create_target_view(&mut self, texture: TextureId) -> Result<TargetId>;
    fn release_target_view(&mut self, target: TargetId);
    fn release_texture(&mut self, texture: TextureId);

    // ── swap chains ──────────────────────────────────────────────────────

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> Result<SwapChainId>;
    fn swap_chain_info(&self, swap_chain: SwapChainId) -> Option<SwapChainInfo>;

    /// The texture that always refers to the current back buffer.
    fn swap_chain_buffer(&mut self, swap_chain: SwapChainId) -> Result<TextureId>;

    /// Stop the platform from switching the window's display mode on its own.
    fn ignore_mode_switches(&mut self, swap_chain: SwapChainId) -> Result<()>;

    fn resize_swap_chain(&mut self, swap_chain: SwapChainId, width: u32, height: u32) -> Result<()>;
    fn present(&mut self, swap_chain: SwapChainId, vsync: bool) -> Result<()>;
    fn release_swap_chain(&mut self, swap_chain: SwapChainId);

    // ── immediate context ────────────────────────────────────────────────

    /// Binds both shader stages and the program's vertex input layout.
    fn set_program(&mut self, program: ProgramId);
    fn set_constant_buffers(&mut self, stage: ShaderStage, buffers: &[Option<BufferId>]);

    /// Clears every sampler and shader resource slot of `stage`.
    fn unset_shader_resources(&mut self, stage: ShaderStage);
    fn set_shader_resource(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        texture: TextureId,
        filter: TextureFilter,
    );
    fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, stride: u32);
    fn set_render_target(&mut self, target: TargetId);
    fn clear_render_target(&mut self, target: TargetId, color: [f32; 4]) -> Result<()>;

    /// Sets the viewport and the scissor rectangle.
    fn set_viewport(&mut self, viewport: Viewport);
    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<()>;

    /// Submits all recorded work and waits for it to retire.
    fn flush(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_offsets_and_stride() {
        let layout = VertexLayout::new()
            .with("position", AttribFormat::Float2)
            .with("color", AttribFormat::UNorm4)
            .with("uv", AttribFormat::Float2);

        let offsets: Vec<u32> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 8, 12]);
        assert_eq!(layout.stride(), 20);
        assert_eq!(layout.with_stride(32).stride(), 32);
    }

    #[test]
    fn spirv_words_rejects_garbage() {
        assert!(spirv_words(&[1, 2, 3]).is_err());

        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        assert_eq!(spirv_words(&bytes).unwrap(), vec![0x0723_0203, 0]);
    }
}
