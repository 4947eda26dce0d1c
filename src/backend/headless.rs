// Headless driver - simulated platform without a GPU
//
// Behaves like an immediate-context device: validates ids and sizes, keeps
// buffer contents in memory, and records every native call in a shared
// Journal so callers can observe uploads, reallocations and ordering.
// Platform capabilities (flip presentation, external memory, support at
// all) are configurable to simulate older or broken hosts.

use super::*;
use parking_lot::Mutex;
use serde::Deserialize;
use slotmap::SlotMap;
use std::sync::Arc;

/// Capabilities of the simulated host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeadlessPlatform {
    /// When false the driver refuses to start, like an unsupported OS.
    pub supported: bool,
    /// Extended surface factory present (flip-model, tear-aware surfaces).
    pub flip_presentation: bool,
    /// The flip-model creation call itself fails at runtime.
    pub fail_flip_swap_chain: bool,
    pub external_memory: bool,
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self {
            supported: true,
            flip_presentation: true,
            fail_flip_swap_chain: false,
            external_memory: true,
        }
    }
}

/// One recorded native call.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    CreateDevice,
    DestroyDevice,
    CreateState,
    SetBlendState(BlendMode),
    SetRasterizerState,
    CreateBuffer {
        usage: BufferUsage,
        size: usize,
        initialized: bool,
    },
    WriteDiscard {
        usage: BufferUsage,
        len: usize,
    },
    ReleaseBuffer,
    CreateProgram,
    ReleaseProgram,
    CreateTexture {
        width: u32,
        height: u32,
        exportable: bool,
    },
    WriteTexture,
    ReleaseTexture,
    CreateTargetView,
    ReleaseTargetView,
    CreateSwapChain {
        effect: SwapEffect,
        allow_tearing: bool,
        legacy: bool,
    },
    RejectSwapChain {
        effect: SwapEffect,
        allow_tearing: bool,
    },
    IgnoreModeSwitches,
    ResizeSwapChain {
        width: u32,
        height: u32,
    },
    Present {
        vsync: bool,
    },
    ReleaseSwapChain,
    SetProgram,
    SetConstantBuffers {
        stage: ShaderStage,
        bound: usize,
    },
    UnsetShaderResources(ShaderStage),
    SetShaderResource {
        stage: ShaderStage,
        slot: u32,
    },
    SetVertexBuffer {
        bound: bool,
        stride: u32,
    },
    SetRenderTarget,
    ClearRenderTarget([f32; 4]),
    SetViewport(Viewport),
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    Flush,
}

#[derive(Debug, Default)]
struct JournalState {
    calls: Vec<NativeCall>,
    device_lost: bool,
    fail_device_creation: bool,
    fail_flush: bool,
}

/// Shared record of native calls, plus fault injection switches.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    state: Arc<Mutex<JournalState>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: NativeCall) {
        log::trace!("headless: {:?}", call);
        self.state.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Position of the first call matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&NativeCall) -> bool) -> Option<usize> {
        self.state.lock().calls.iter().position(|c| predicate(c))
    }

    /// Makes the live device report loss on its next submission.
    pub fn lose_device(&self) {
        self.state.lock().device_lost = true;
    }

    pub fn fail_device_creation(&self, fail: bool) {
        self.state.lock().fail_device_creation = fail;
    }

    /// Makes flush fail while the device itself stays live.
    pub fn fail_flush(&self, fail: bool) {
        self.state.lock().fail_flush = fail;
    }

    fn device_lost(&self) -> bool {
        self.state.lock().device_lost
    }
}

pub struct HeadlessDriver {
    platform: HeadlessPlatform,
    journal: Journal,
}

impl HeadlessDriver {
    pub fn new(platform: HeadlessPlatform) -> Self {
        Self {
            platform,
            journal: Journal::new(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl Driver for HeadlessDriver {
    fn disp_method(&self) -> DispMethod {
        DispMethod::Headless
    }

    fn check_platform(&self) -> Result<()> {
        if self.platform.supported {
            Ok(())
        } else {
            Err(GfxError::Unsupported(
                "simulated platform does not support this backend".to_string(),
            ))
        }
    }

    fn clip_space(&self) -> ClipSpace {
        ClipSpace::YUp
    }

    fn create_device(&mut self) -> Result<Box<dyn Device>> {
        if self.journal.state.lock().fail_device_creation {
            return Err(GfxError::Driver("simulated device creation failure".to_string()));
        }

        // A fresh device starts healthy.
        self.journal.state.lock().device_lost = false;
        self.journal.record(NativeCall::CreateDevice);
        Ok(Box::new(HeadlessDevice::new(self.platform, self.journal.clone())))
    }
}

#[derive(Debug)]
struct Buffer {
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Texture {
    width: u32,
    height: u32,
    usage: TextureUsage,
    pixels: Vec<u8>,
}

#[derive(Debug)]
struct SwapChain {
    info: SwapChainInfo,
    back_buffer: Option<TextureId>,
}

#[derive(Debug, Default)]
struct Bound {
    program: Option<ProgramId>,
    vertex_buffer: Option<BufferId>,
    target: Option<TargetId>,
}

struct HeadlessDevice {
    platform: HeadlessPlatform,
    journal: Journal,
    /// Blend states carry their mode, rasterizer states none.
    states: SlotMap<StateId, Option<BlendMode>>,
    buffers: SlotMap<BufferId, Buffer>,
    programs: SlotMap<ProgramId, u32>,
    textures: SlotMap<TextureId, Texture>,
    targets: SlotMap<TargetId, TextureId>,
    swap_chains: SlotMap<SwapChainId, SwapChain>,
    bound: Bound,
    next_export_handle: i64,
}

impl HeadlessDevice {
    fn new(platform: HeadlessPlatform, journal: Journal) -> Self {
        Self {
            platform,
            journal,
            states: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            targets: SlotMap::with_key(),
            swap_chains: SlotMap::with_key(),
            bound: Bound::default(),
            next_export_handle: 100,
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.journal.device_lost() {
            Err(GfxError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.journal.record(NativeCall::DestroyDevice);
    }
}

impl Device for HeadlessDevice {
    fn adapter_name(&self) -> &str {
        "Headless Simulated Adapter"
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            flip_presentation: self.platform.flip_presentation,
            external_memory: self.platform.external_memory,
        }
    }

    fn create_blend_state(&mut self, mode: BlendMode) -> Result<StateId> {
        self.journal.record(NativeCall::CreateState);
        Ok(self.states.insert(Some(mode)))
    }

    fn create_rasterizer_state(&mut self, _desc: &RasterizerDesc) -> Result<StateId> {
        self.journal.record(NativeCall::CreateState);
        Ok(self.states.insert(None))
    }

    fn set_blend_state(&mut self, state: StateId) {
        if let Some(Some(mode)) = self.states.get(state) {
            let mode = *mode;
            self.journal.record(NativeCall::SetBlendState(mode));
        }
    }

    fn set_rasterizer_state(&mut self, state: StateId) {
        debug_assert!(self.states.contains_key(state));
        self.journal.record(NativeCall::SetRasterizerState);
    }

    fn create_buffer(&mut self, desc: &BufferDesc, initial: Option<&[u8]>) -> Result<BufferId> {
        if desc.size == 0 {
            return Err(GfxError::InvalidArgument("zero sized buffer".to_string()));
        }

        let mut data = vec![0u8; desc.size];
        if let Some(initial) = initial {
            if initial.len() > desc.size {
                return Err(GfxError::InvalidArgument(format!(
                    "{} initial bytes for a {} byte buffer",
                    initial.len(),
                    desc.size
                )));
            }
            data[..initial.len()].copy_from_slice(initial);
        }

        self.journal.record(NativeCall::CreateBuffer {
            usage: desc.usage,
            size: desc.size,
            initialized: initial.is_some(),
        });
        Ok(self.buffers.insert(Buffer {
            usage: desc.usage,
            data,
        }))
    }

    fn write_discard(&mut self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(buffer)
            .ok_or(GfxError::InvalidHandle("buffer"))?;
        if data.len() > buffer.data.len() {
            return Err(GfxError::InvalidArgument(format!(
                "{} bytes written to a {} byte buffer",
                data.len(),
                buffer.data.len()
            )));
        }

        // Discard: the previous contents are gone.
        buffer.data.iter_mut().for_each(|b| *b = 0);
        buffer.data[..data.len()].copy_from_slice(data);

        let usage = buffer.usage;
        self.journal.record(NativeCall::WriteDiscard {
            usage,
            len: data.len(),
        });
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(buffer).is_some() {
            if self.bound.vertex_buffer == Some(buffer) {
                self.bound.vertex_buffer = None;
            }
            self.journal.record(NativeCall::ReleaseBuffer);
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramId> {
        const MAGIC: u32 = 0x0723_0203;
        for (stage, words) in [("vertex", desc.vertex_spirv), ("fragment", desc.fragment_spirv)] {
            if words.first() != Some(&MAGIC) {
                return Err(GfxError::InvalidArgument(format!(
                    "{} stage is not SPIR-V",
                    stage
                )));
            }
        }
        if desc.layout.attributes.is_empty() {
            return Err(GfxError::InvalidArgument("empty vertex layout".to_string()));
        }

        self.journal.record(NativeCall::CreateProgram);
        Ok(self.programs.insert(desc.layout.stride()))
    }

    fn release_program(&mut self, program: ProgramId) {
        if self.programs.remove(program).is_some() {
            if self.bound.program == Some(program) {
                self.bound.program = None;
            }
            self.journal.record(NativeCall::ReleaseProgram);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GfxError::InvalidArgument(format!(
                "{}x{} texture",
                desc.width, desc.height
            )));
        }

        self.journal.record(NativeCall::CreateTexture {
            width: desc.width,
            height: desc.height,
            exportable: false,
        });
        Ok(self.textures.insert(Texture {
            width: desc.width,
            height: desc.height,
            usage: desc.usage,
            pixels: vec![0; desc.byte_len()],
        }))
    }

    fn create_exportable_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<(TextureId, ExternalMemory)> {
        if !self.platform.external_memory {
            return Err(GfxError::InteropUnavailable);
        }

        let desc = TextureDesc {
            width,
            height,
            usage: TextureUsage::Dynamic,
        };
        let size = desc.byte_len() as u64;
        let id = self.textures.insert(Texture {
            width,
            height,
            usage: desc.usage,
            pixels: vec![0; desc.byte_len()],
        });
        self.journal.record(NativeCall::CreateTexture {
            width,
            height,
            exportable: true,
        });

        let handle = self.next_export_handle;
        self.next_export_handle += 1;
        Ok((
            id,
            ExternalMemory {
                kind: ExternalHandleKind::OpaqueFd,
                handle,
                size,
            },
        ))
    }

    fn write_texture(&mut self, texture: TextureId, pixels: &[u8]) -> Result<()> {
        let texture = self
            .textures
            .get_mut(texture)
            .ok_or(GfxError::InvalidHandle("texture"))?;
        if texture.usage != TextureUsage::Dynamic {
            return Err(GfxError::InvalidOperation(
                "only dynamic textures are CPU writable".to_string(),
            ));
        }
        let expected = texture.width as usize * texture.height as usize * 4;
        if pixels.len() != expected {
            return Err(GfxError::InvalidArgument(format!(
                "expected {} pixel bytes, got {}",
                expected,
                pixels.len()
            )));
        }

        texture.pixels.copy_from_slice(pixels);
        self.journal.record(NativeCall::WriteTexture);
        Ok(())
    }

    fn create_target_view(&mut self, texture: TextureId) -> Result<TargetId> {
        let tex = self
            .textures
            .get(texture)
            .ok_or(GfxError::InvalidHandle("texture"))?;
        if tex.usage != TextureUsage::RenderTarget {
            return Err(GfxError::InvalidOperation(
                "texture was not created renderable".to_string(),
            ));
        }

        self.journal.record(NativeCall::CreateTargetView);
        Ok(self.targets.insert(texture))
    }

    fn release_target_view(&mut self, target: TargetId) {
        if self.targets.remove(target).is_some() {
            if self.bound.target == Some(target) {
                self.bound.target = None;
            }
            self.journal.record(NativeCall::ReleaseTargetView);
        }
    }

    fn release_texture(&mut self, texture: TextureId) {
        if self.textures.remove(texture).is_some() {
            for swap_chain in self.swap_chains.iter_mut().map(|(_, s)| s) {
                if swap_chain.back_buffer == Some(texture) {
                    swap_chain.back_buffer = None;
                }
            }
            self.journal.record(NativeCall::ReleaseTexture);
        }
    }

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> Result<SwapChainId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GfxError::InvalidArgument(format!(
                "{}x{} swap chain",
                desc.width, desc.height
            )));
        }
        if !desc.legacy && !self.platform.flip_presentation {
            return Err(GfxError::Presentation(
                "extended surface factory is not available".to_string(),
            ));
        }
        if !desc.legacy
            && desc.effect == SwapEffect::FlipDiscard
            && self.platform.fail_flip_swap_chain
        {
            self.journal.record(NativeCall::RejectSwapChain {
                effect: desc.effect,
                allow_tearing: desc.allow_tearing,
            });
            return Err(GfxError::Presentation(
                "flip model swap chain creation failed".to_string(),
            ));
        }

        let allow_tearing =
            desc.allow_tearing && !desc.legacy && desc.effect == SwapEffect::FlipDiscard;
        self.journal.record(NativeCall::CreateSwapChain {
            effect: desc.effect,
            allow_tearing,
            legacy: desc.legacy,
        });
        Ok(self.swap_chains.insert(SwapChain {
            info: SwapChainInfo {
                width: desc.width,
                height: desc.height,
                effect: desc.effect,
                allow_tearing,
            },
            back_buffer: None,
        }))
    }

    fn swap_chain_info(&self, swap_chain: SwapChainId) -> Option<SwapChainInfo> {
        self.swap_chains.get(swap_chain).map(|s| s.info)
    }

    fn swap_chain_buffer(&mut self, swap_chain: SwapChainId) -> Result<TextureId> {
        let chain = self
            .swap_chains
            .get(swap_chain)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        if let Some(texture) = chain.back_buffer {
            return Ok(texture);
        }

        let (width, height) = (chain.info.width, chain.info.height);
        let texture = self.textures.insert(Texture {
            width,
            height,
            usage: TextureUsage::RenderTarget,
            pixels: Vec::new(),
        });
        if let Some(chain) = self.swap_chains.get_mut(swap_chain) {
            chain.back_buffer = Some(texture);
        }
        Ok(texture)
    }

    fn ignore_mode_switches(&mut self, swap_chain: SwapChainId) -> Result<()> {
        if !self.swap_chains.contains_key(swap_chain) {
            return Err(GfxError::InvalidHandle("swap chain"));
        }
        self.journal.record(NativeCall::IgnoreModeSwitches);
        Ok(())
    }

    fn resize_swap_chain(&mut self, swap_chain: SwapChainId, width: u32, height: u32) -> Result<()> {
        let chain = self
            .swap_chains
            .get_mut(swap_chain)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        if chain.back_buffer.is_some() {
            return Err(GfxError::InvalidOperation(
                "back buffer must be released before resizing".to_string(),
            ));
        }

        chain.info.width = width.max(1);
        chain.info.height = height.max(1);
        self.journal.record(NativeCall::ResizeSwapChain { width, height });
        Ok(())
    }

    fn present(&mut self, swap_chain: SwapChainId, vsync: bool) -> Result<()> {
        self.check_alive()?;
        if !self.swap_chains.contains_key(swap_chain) {
            return Err(GfxError::InvalidHandle("swap chain"));
        }
        self.journal.record(NativeCall::Present { vsync });
        Ok(())
    }

    fn release_swap_chain(&mut self, swap_chain: SwapChainId) {
        if let Some(chain) = self.swap_chains.remove(swap_chain) {
            if let Some(texture) = chain.back_buffer {
                self.textures.remove(texture);
            }
            self.journal.record(NativeCall::ReleaseSwapChain);
        }
    }

    fn set_program(&mut self, program: ProgramId) {
        self.bound.program = Some(program);
        self.journal.record(NativeCall::SetProgram);
    }

    fn set_constant_buffers(&mut self, stage: ShaderStage, buffers: &[Option<BufferId>]) {
        let bound = buffers.iter().filter(|b| b.is_some()).count();
        self.journal
            .record(NativeCall::SetConstantBuffers { stage, bound });
    }

    fn unset_shader_resources(&mut self, stage: ShaderStage) {
        self.journal.record(NativeCall::UnsetShaderResources(stage));
    }

    fn set_shader_resource(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        texture: TextureId,
        _filter: TextureFilter,
    ) {
        debug_assert!(self.textures.contains_key(texture));
        self.journal
            .record(NativeCall::SetShaderResource { stage, slot });
    }

    fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, stride: u32) {
        self.bound.vertex_buffer = buffer;
        self.journal.record(NativeCall::SetVertexBuffer {
            bound: buffer.is_some(),
            stride,
        });
    }

    fn set_render_target(&mut self, target: TargetId) {
        self.bound.target = Some(target);
        self.journal.record(NativeCall::SetRenderTarget);
    }

    fn clear_render_target(&mut self, target: TargetId, color: [f32; 4]) -> Result<()> {
        if !self.targets.contains_key(target) {
            return Err(GfxError::InvalidHandle("render target view"));
        }
        self.journal.record(NativeCall::ClearRenderTarget(color));
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.journal.record(NativeCall::SetViewport(viewport));
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<()> {
        self.check_alive()?;
        let program = self
            .bound
            .program
            .ok_or_else(|| GfxError::Driver("draw with no program bound".to_string()))?;
        if !self.programs.contains_key(program) {
            return Err(GfxError::Driver("bound program was released".to_string()));
        }
        let buffer = self
            .bound
            .vertex_buffer
            .and_then(|b| self.buffers.get(b))
            .ok_or_else(|| GfxError::Driver("draw with no vertex buffer bound".to_string()))?;
        let stride = self.programs.get(program).copied().unwrap_or(0) as usize;
        if stride * (first_vertex + vertex_count) as usize > buffer.data.len() {
            return Err(GfxError::Driver("draw reads past the vertex buffer".to_string()));
        }

        self.journal.record(NativeCall::Draw {
            vertex_count,
            first_vertex,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.check_alive()?;
        if self.journal.state.lock().fail_flush {
            return Err(GfxError::Driver("simulated flush failure".to_string()));
        }
        self.journal.record(NativeCall::Flush);
        Ok(())
    }
}
