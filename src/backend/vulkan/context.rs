// Immediate context over Vulkan
//
// State setters only update a CPU-side copy of the bound state; draw
// resolves it and records everything it needs into the single command
// buffer. Work is submitted on flush and present, each submit waiting for
// completion before returning. Dynamic rendering instances are opened on
// demand and closed before any transfer or layout change.

use super::buffer::{usage_flags, BufferSlot, GpuBuffer};
use super::device::Core;
use super::image::{copy_from_buffer, transition, GpuImage};
use super::pipeline::{uniform_binding, Program, SAMPLER_BASE};
use super::swapchain::Swapchain;
use super::sync::SubmitSync;
use super::VulkanSettings;
use crate::backend::*;
use ash::vk;
use slotmap::SlotMap;

enum StateObject {
    Blend(BlendMode),
    Rasterizer(RasterizerDesc),
}

struct Frame {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    sync: SubmitSync,
    recording: bool,
    /// Target of the open dynamic rendering instance.
    rendering: Option<TargetId>,
    /// An acquire signaled `image_available`; the next submit must wait on it.
    wait_acquire: bool,
}

#[derive(Default)]
struct Objects {
    buffers: SlotMap<BufferId, BufferSlot>,
    images: SlotMap<TextureId, GpuImage>,
    targets: SlotMap<TargetId, TextureId>,
    programs: SlotMap<ProgramId, Program>,
    swapchains: SlotMap<SwapChainId, Swapchain>,
    states: SlotMap<StateId, StateObject>,
}

struct Defaults {
    nearest: vk::Sampler,
    linear: vk::Sampler,
    /// Bound to declared sampler slots nothing was bound to.
    blank: TextureId,
    /// Bound to declared constant buffer slots nothing was bound to.
    null_uniform: BufferId,
}

struct Bound {
    program: Option<ProgramId>,
    constant_buffers: [[Option<BufferId>; MAX_CONSTANT_BUFFER_SLOTS]; 2],
    resources: [[Option<(TextureId, TextureFilter)>; MAX_SAMPLER_SLOTS]; 2],
    vertex_buffer: Option<BufferId>,
    target: Option<TargetId>,
    viewport: Option<Viewport>,
    blend: BlendMode,
    rasterizer: RasterizerDesc,
}

impl Default for Bound {
    fn default() -> Self {
        Self {
            program: None,
            constant_buffers: [[None; MAX_CONSTANT_BUFFER_SLOTS]; 2],
            resources: [[None; MAX_SAMPLER_SLOTS]; 2],
            vertex_buffer: None,
            target: None,
            viewport: None,
            blend: BlendMode::Disabled,
            rasterizer: RasterizerDesc::default(),
        }
    }
}

fn stage_index(stage: ShaderStage) -> usize {
    match stage {
        ShaderStage::Vertex => 0,
        ShaderStage::Pixel => 1,
    }
}

/// What a texture resolves to right now.
#[derive(Clone, Copy)]
struct Resolved {
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
    layout: vk::ImageLayout,
}

pub struct VulkanDevice {
    objects: Objects,
    frame: Frame,
    bound: Bound,
    defaults: Defaults,
    retired: Vec<GpuBuffer>,
    core: Core,
}

fn create_sampler(device: &ash::Device, filter: vk::Filter) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(0.0);
    Ok(unsafe { device.create_sampler(&info, None) }?)
}

impl VulkanDevice {
    pub(super) fn new(entry: ash::Entry, settings: &VulkanSettings) -> Result<Self> {
        let mut core = Core::new(entry, settings)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(core.queue_family);
        let pool = unsafe { core.device.create_command_pool(&pool_info, None) }?;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { core.device.allocate_command_buffers(&alloc_info) }?[0];
        let sync = SubmitSync::new(&core.device)?;

        let mut objects = Objects::default();
        let blank = GpuImage::new(&mut core, 1, 1, TextureUsage::Dynamic)?;
        let blank = objects.images.insert(blank);

        let mut null_uniform = GpuBuffer::new(&mut core, 256, usage_flags(BufferUsage::Constant), "null uniform")?;
        null_uniform.write(&[0; 256])?;
        let null_uniform = objects.buffers.insert(BufferSlot {
            current: null_uniform,
            usage: BufferUsage::Constant,
            in_flight: false,
        });

        let defaults = Defaults {
            nearest: create_sampler(&core.device, vk::Filter::NEAREST)?,
            linear: create_sampler(&core.device, vk::Filter::LINEAR)?,
            blank,
            null_uniform,
        };

        let mut device = Self {
            objects,
            frame: Frame {
                pool,
                cmd,
                sync,
                recording: false,
                rendering: None,
                wait_acquire: false,
            },
            bound: Bound::default(),
            defaults,
            retired: Vec::new(),
            core,
        };

        device.write_texture(blank, &[0; 4])?;
        device.flush()?;
        Ok(device)
    }

    fn begin(&mut self) -> Result<()> {
        if !self.frame.recording {
            let info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.core.device.begin_command_buffer(self.frame.cmd, &info) }?;
            self.frame.recording = true;
        }
        Ok(())
    }

    fn end_rendering(&mut self) {
        if self.frame.rendering.take().is_some() {
            unsafe { self.core.device.cmd_end_rendering(self.frame.cmd) };
        }
    }

    /// Ends recording, submits and waits. Retired storage is freed and no
    /// buffer is in flight afterwards.
    fn submit(&mut self, signal_render_finished: bool) -> Result<()> {
        self.begin()?;
        self.end_rendering();

        let cmd = self.frame.cmd;
        unsafe { self.core.device.end_command_buffer(cmd) }?;
        self.frame.recording = false;

        let wait_semaphores: Vec<vk::Semaphore> = if self.frame.wait_acquire {
            vec![self.frame.sync.image_available]
        } else {
            Vec::new()
        };
        let wait_stages =
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = if signal_render_finished {
            vec![self.frame.sync.render_finished]
        } else {
            Vec::new()
        };
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.core
                .device
                .queue_submit(self.core.queue, &[submit_info], self.frame.sync.submitted)
        }?;
        self.frame.wait_acquire = false;

        let waited = self.frame.sync.wait(&self.core.device);
        for buffer in self.retired.drain(..) {
            buffer.destroy(&mut self.core);
        }
        for (_, slot) in self.objects.buffers.iter_mut() {
            slot.in_flight = false;
        }
        waited
    }

    /// Flushes before destroying something recorded work may reference.
    fn flush_before_release(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("Flush before release failed: {}", err);
        }
    }

    fn acquire(&mut self, chain_id: SwapChainId) -> Result<()> {
        let acquired = self
            .objects
            .swapchains
            .get(chain_id)
            .ok_or(GfxError::InvalidHandle("swap chain"))?
            .acquired
            .is_some();
        if acquired {
            return Ok(());
        }

        // One acquire semaphore: consume a pending one first
        if self.frame.wait_acquire {
            self.submit(false)?;
        }

        let semaphore = self.frame.sync.image_available;
        if let Some(chain) = self.objects.swapchains.get_mut(chain_id) {
            chain.acquire(&self.core, semaphore)?;
            self.frame.wait_acquire = true;
        }
        Ok(())
    }

    fn resolve(&mut self, texture: TextureId) -> Result<Resolved> {
        let image = self
            .objects
            .images
            .get(texture)
            .ok_or(GfxError::InvalidHandle("texture"))?;
        let chain_id = match image.swap_chain() {
            None => {
                return Ok(Resolved {
                    image: image.image,
                    view: image.view,
                    extent: image.extent,
                    layout: image.layout,
                })
            }
            Some(id) => id,
        };

        self.acquire(chain_id)?;
        let chain = self
            .objects
            .swapchains
            .get(chain_id)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        let index = chain
            .acquired
            .ok_or_else(|| GfxError::Presentation("swap chain image not acquired".to_string()))?
            as usize;
        Ok(Resolved {
            image: chain.images[index],
            view: chain.image_views[index],
            extent: chain.extent,
            layout: chain.layouts[index],
        })
    }

    fn store_layout(&mut self, texture: TextureId, layout: vk::ImageLayout) {
        let Some(image) = self.objects.images.get_mut(texture) else {
            return;
        };
        match image.swap_chain() {
            None => image.layout = layout,
            Some(id) => {
                if let Some(chain) = self.objects.swapchains.get_mut(id) {
                    if let Some(index) = chain.acquired {
                        chain.layouts[index as usize] = layout;
                    }
                }
            }
        }
    }

    fn ensure_layout(&mut self, texture: TextureId, layout: vk::ImageLayout) -> Result<Resolved> {
        let resolved = self.resolve(texture)?;
        if resolved.layout != layout {
            self.begin()?;
            self.end_rendering();
            transition(
                &self.core.device,
                self.frame.cmd,
                resolved.image,
                resolved.layout,
                layout,
            );
            self.store_layout(texture, layout);
        }
        Ok(Resolved { layout, ..resolved })
    }

    /// Opens a rendering instance on `target` unless one is already open.
    fn ensure_rendering(&mut self, target: TargetId) -> Result<vk::Extent2D> {
        let texture = *self
            .objects
            .targets
            .get(target)
            .ok_or(GfxError::InvalidHandle("render target view"))?;
        if self.frame.rendering == Some(target) {
            return Ok(self.resolve(texture)?.extent);
        }

        self.begin()?;
        self.end_rendering();
        let resolved = self.ensure_layout(texture, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;

        let attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(resolved.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build()];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: resolved.extent,
            })
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe {
            self.core
                .device
                .cmd_begin_rendering(self.frame.cmd, &rendering_info)
        };
        self.frame.rendering = Some(target);
        Ok(resolved.extent)
    }

    fn viewport_and_scissor(&self, extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
        let vp = self.bound.viewport.unwrap_or(Viewport {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        });
        let viewport = vk::Viewport {
            x: vp.x as f32,
            y: vp.y as f32,
            width: vp.width as f32,
            height: vp.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let full = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        if !self.bound.rasterizer.scissor {
            return (viewport, full);
        }
        let x0 = vp.x.max(0) as u32;
        let y0 = vp.y.max(0) as u32;
        let x1 = ((vp.x + vp.width as i32).max(0) as u32).min(extent.width);
        let y1 = ((vp.y + vp.height as i32).max(0) as u32).min(extent.height);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x0 as i32,
                y: y0 as i32,
            },
            extent: vk::Extent2D {
                width: x1.saturating_sub(x0),
                height: y1.saturating_sub(y0),
            },
        };
        (viewport, scissor)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let _ = self.core.wait_idle();

        for (_, mut chain) in self.objects.swapchains.drain() {
            chain.destroy(&self.core);
        }
        for (_, image) in self.objects.images.drain() {
            image.destroy(&mut self.core);
        }
        for (_, slot) in self.objects.buffers.drain() {
            slot.current.destroy(&mut self.core);
        }
        for buffer in self.retired.drain(..) {
            buffer.destroy(&mut self.core);
        }
        for (_, mut program) in self.objects.programs.drain() {
            program.destroy(&self.core.device);
        }

        unsafe {
            self.core.device.destroy_sampler(self.defaults.nearest, None);
            self.core.device.destroy_sampler(self.defaults.linear, None);
            self.frame.sync.destroy(&self.core.device);
            self.core.device.destroy_command_pool(self.frame.pool, None);
        }
    }
}

impl Device for VulkanDevice {
    fn adapter_name(&self) -> &str {
        &self.core.adapter_name
    }

    fn caps(&self) -> DeviceCaps {
        self.core.caps()
    }

    fn create_blend_state(&mut self, mode: BlendMode) -> Result<StateId> {
        Ok(self.objects.states.insert(StateObject::Blend(mode)))
    }

    fn create_rasterizer_state(&mut self, desc: &RasterizerDesc) -> Result<StateId> {
        Ok(self.objects.states.insert(StateObject::Rasterizer(*desc)))
    }

    fn set_blend_state(&mut self, state: StateId) {
        if let Some(StateObject::Blend(mode)) = self.objects.states.get(state) {
            self.bound.blend = *mode;
        }
    }

    fn set_rasterizer_state(&mut self, state: StateId) {
        if let Some(StateObject::Rasterizer(desc)) = self.objects.states.get(state) {
            self.bound.rasterizer = *desc;
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc, initial: Option<&[u8]>) -> Result<BufferId> {
        if desc.size == 0 {
            return Err(GfxError::InvalidArgument("zero sized buffer".to_string()));
        }

        let mut buffer = GpuBuffer::new(&mut self.core, desc.size, usage_flags(desc.usage), "buffer")?;
        if let Some(initial) = initial {
            if let Err(err) = buffer.write(initial) {
                buffer.destroy(&mut self.core);
                return Err(err);
            }
        }
        Ok(self.objects.buffers.insert(BufferSlot {
            current: buffer,
            usage: desc.usage,
            in_flight: false,
        }))
    }

    fn write_discard(&mut self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let slot = self
            .objects
            .buffers
            .get_mut(buffer)
            .ok_or(GfxError::InvalidHandle("buffer"))?;
        slot.write_discard(&mut self.core, &mut self.retired, data)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        let in_flight = match self.objects.buffers.get(buffer) {
            Some(slot) => slot.in_flight,
            None => return,
        };
        if in_flight {
            self.flush_before_release();
        }
        if self.bound.vertex_buffer == Some(buffer) {
            self.bound.vertex_buffer = None;
        }
        if let Some(slot) = self.objects.buffers.remove(buffer) {
            slot.current.destroy(&mut self.core);
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramId> {
        if desc.layout.attributes.is_empty() {
            return Err(GfxError::InvalidArgument("empty vertex layout".to_string()));
        }
        let program = Program::new(&self.core.device, desc)?;
        Ok(self.objects.programs.insert(program))
    }

    fn release_program(&mut self, program: ProgramId) {
        if !self.objects.programs.contains_key(program) {
            return;
        }
        self.flush_before_release();
        if self.bound.program == Some(program) {
            self.bound.program = None;
        }
        if let Some(mut program) = self.objects.programs.remove(program) {
            program.destroy(&self.core.device);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GfxError::InvalidArgument(format!(
                "{}x{} texture",
                desc.width, desc.height
            )));
        }
        let image = GpuImage::new(&mut self.core, desc.width, desc.height, desc.usage)?;
        Ok(self.objects.images.insert(image))
    }

    fn create_exportable_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<(TextureId, ExternalMemory)> {
        let (image, memory) = GpuImage::new_exportable(&mut self.core, width, height)?;
        Ok((self.objects.images.insert(image), memory))
    }

    fn write_texture(&mut self, texture: TextureId, pixels: &[u8]) -> Result<()> {
        let image = self
            .objects
            .images
            .get(texture)
            .ok_or(GfxError::InvalidHandle("texture"))?;
        if image.usage != TextureUsage::Dynamic || image.swap_chain().is_some() {
            return Err(GfxError::InvalidOperation(
                "only dynamic textures are CPU writable".to_string(),
            ));
        }
        let expected = image.extent.width as usize * image.extent.height as usize * 4;
        if pixels.len() != expected {
            return Err(GfxError::InvalidArgument(format!(
                "expected {} pixel bytes, got {}",
                expected,
                pixels.len()
            )));
        }

        let mut staging = GpuBuffer::new(
            &mut self.core,
            pixels.len(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            "texture staging",
        )?;
        if let Err(err) = staging.write(pixels) {
            staging.destroy(&mut self.core);
            return Err(err);
        }

        self.begin()?;
        self.end_rendering();
        let resolved = self.ensure_layout(texture, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        copy_from_buffer(
            &self.core.device,
            self.frame.cmd,
            staging.buffer,
            resolved.image,
            resolved.extent,
        );
        self.retired.push(staging);
        Ok(())
    }

    fn create_target_view(&mut self, texture: TextureId) -> Result<TargetId> {
        let image = self
            .objects
            .images
            .get(texture)
            .ok_or(GfxError::InvalidHandle("texture"))?;
        if image.usage != TextureUsage::RenderTarget {
            return Err(GfxError::InvalidOperation(
                "texture was not created renderable".to_string(),
            ));
        }
        Ok(self.objects.targets.insert(texture))
    }

    fn release_target_view(&mut self, target: TargetId) {
        if self.frame.rendering == Some(target) {
            self.end_rendering();
        }
        if self.bound.target == Some(target) {
            self.bound.target = None;
        }
        self.objects.targets.remove(target);
    }

    fn release_texture(&mut self, texture: TextureId) {
        let is_back_buffer = match self.objects.images.get(texture) {
            Some(image) => image.swap_chain().is_some(),
            None => return,
        };
        if !is_back_buffer {
            self.flush_before_release();
        }
        for resources in self.bound.resources.iter_mut() {
            for slot in resources.iter_mut() {
                if matches!(slot, Some((t, _)) if *t == texture) {
                    *slot = None;
                }
            }
        }
        if let Some(image) = self.objects.images.remove(texture) {
            if let Some(chain) = image
                .swap_chain()
                .and_then(|id| self.objects.swapchains.get_mut(id))
            {
                chain.back_buffer = None;
            }
            image.destroy(&mut self.core);
        }
    }

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> Result<SwapChainId> {
        let chain = Swapchain::new(&self.core, desc)?;
        Ok(self.objects.swapchains.insert(chain))
    }

    fn swap_chain_info(&self, swap_chain: SwapChainId) -> Option<SwapChainInfo> {
        self.objects.swapchains.get(swap_chain).map(|c| c.info)
    }

    fn swap_chain_buffer(&mut self, swap_chain: SwapChainId) -> Result<TextureId> {
        let chain = self
            .objects
            .swapchains
            .get(swap_chain)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        if let Some(texture) = chain.back_buffer {
            return Ok(texture);
        }

        let image = GpuImage::swap_chain_backed(swap_chain, chain.extent);
        let texture = self.objects.images.insert(image);
        if let Some(chain) = self.objects.swapchains.get_mut(swap_chain) {
            chain.back_buffer = Some(texture);
        }
        Ok(texture)
    }

    fn ignore_mode_switches(&mut self, swap_chain: SwapChainId) -> Result<()> {
        if !self.objects.swapchains.contains_key(swap_chain) {
            return Err(GfxError::InvalidHandle("swap chain"));
        }
        // The window system never switches modes behind a Vulkan swap chain
        log::debug!("Display mode switches are owned by the window");
        Ok(())
    }

    fn resize_swap_chain(&mut self, swap_chain: SwapChainId, width: u32, height: u32) -> Result<()> {
        if !self.objects.swapchains.contains_key(swap_chain) {
            return Err(GfxError::InvalidHandle("swap chain"));
        }
        self.flush()?;
        if let Some(chain) = self.objects.swapchains.get_mut(swap_chain) {
            chain.resize(&self.core, width, height)?;
            if let Some(image) = chain
                .back_buffer
                .and_then(|texture| self.objects.images.get_mut(texture))
            {
                image.extent = chain.extent;
            }
        }
        Ok(())
    }

    fn present(&mut self, swap_chain: SwapChainId, vsync: bool) -> Result<()> {
        // Present mode is fixed when the swap chain is created
        log::trace!("present (vsync requested: {})", vsync);

        self.acquire(swap_chain)?;
        self.begin()?;
        self.end_rendering();

        let chain = self
            .objects
            .swapchains
            .get_mut(swap_chain)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        let index = chain
            .acquired
            .ok_or_else(|| GfxError::Presentation("swap chain image not acquired".to_string()))?
            as usize;
        transition(
            &self.core.device,
            self.frame.cmd,
            chain.images[index],
            chain.layouts[index],
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        chain.layouts[index] = vk::ImageLayout::PRESENT_SRC_KHR;

        self.submit(true)?;

        let render_finished = self.frame.sync.render_finished;
        let chain = self
            .objects
            .swapchains
            .get_mut(swap_chain)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        chain.present(&self.core, render_finished)
    }

    fn release_swap_chain(&mut self, swap_chain: SwapChainId) {
        if !self.objects.swapchains.contains_key(swap_chain) {
            return;
        }
        self.flush_before_release();
        let _ = self.core.wait_idle();

        if let Some(mut chain) = self.objects.swapchains.remove(swap_chain) {
            if let Some(texture) = chain.back_buffer.take() {
                self.objects.images.remove(texture);
            }
            chain.destroy(&self.core);
        }
    }

    fn set_program(&mut self, program: ProgramId) {
        self.bound.program = Some(program);
    }

    fn set_constant_buffers(&mut self, stage: ShaderStage, buffers: &[Option<BufferId>]) {
        let slots = &mut self.bound.constant_buffers[stage_index(stage)];
        for (slot, buffer) in slots.iter_mut().zip(buffers.iter()) {
            *slot = *buffer;
        }
    }

    fn unset_shader_resources(&mut self, stage: ShaderStage) {
        self.bound.resources[stage_index(stage)] = [None; MAX_SAMPLER_SLOTS];
    }

    fn set_shader_resource(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        texture: TextureId,
        filter: TextureFilter,
    ) {
        if let Some(entry) = self.bound.resources[stage_index(stage)].get_mut(slot as usize) {
            *entry = Some((texture, filter));
        }
    }

    fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, _stride: u32) {
        // Stride is part of the program's pipeline
        self.bound.vertex_buffer = buffer;
    }

    fn set_render_target(&mut self, target: TargetId) {
        self.bound.target = Some(target);
    }

    fn clear_render_target(&mut self, target: TargetId, color: [f32; 4]) -> Result<()> {
        let extent = self.ensure_rendering(target)?;

        let attachments = [vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        }];
        let rects = [vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        }];
        unsafe {
            self.core
                .device
                .cmd_clear_attachments(self.frame.cmd, &attachments, &rects)
        };
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.bound.viewport = Some(viewport);
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<()> {
        let program_id = self
            .bound
            .program
            .ok_or_else(|| GfxError::Driver("draw with no program bound".to_string()))?;
        let target = self
            .bound
            .target
            .ok_or_else(|| GfxError::Driver("draw with no render target bound".to_string()))?;
        let vertex_buffer = self
            .bound
            .vertex_buffer
            .ok_or_else(|| GfxError::Driver("draw with no vertex buffer bound".to_string()))?;
        self.begin()?;

        // Sampled images change layout outside of a rendering instance
        let samplers = self
            .objects
            .programs
            .get(program_id)
            .ok_or(GfxError::InvalidHandle("program"))?
            .samplers
            .clone();
        let mut image_infos = Vec::with_capacity(samplers.len());
        for slot in samplers {
            let (texture, filter) = self.bound.resources[stage_index(ShaderStage::Pixel)]
                .get(slot as usize)
                .copied()
                .flatten()
                .unwrap_or((self.defaults.blank, TextureFilter::Nearest));
            let resolved =
                self.ensure_layout(texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
            let sampler = match filter {
                TextureFilter::Nearest => self.defaults.nearest,
                TextureFilter::Linear => self.defaults.linear,
            };
            image_infos.push((
                SAMPLER_BASE + slot,
                vk::DescriptorImageInfo {
                    sampler,
                    image_view: resolved.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            ));
        }

        let extent = self.ensure_rendering(target)?;
        let (viewport, scissor) = self.viewport_and_scissor(extent);

        let blend = self.bound.blend;
        let rasterizer = self.bound.rasterizer;
        let program = self
            .objects
            .programs
            .get_mut(program_id)
            .ok_or(GfxError::InvalidHandle("program"))?;
        let pipeline = program.variant(&self.core.device, blend, rasterizer)?;
        let layout = program.layout;
        let constant_buffers = program.constant_buffers.clone();

        let mut buffer_infos = Vec::with_capacity(constant_buffers.len());
        for (stage, slot) in constant_buffers {
            let bound = self.bound.constant_buffers[stage_index(stage)]
                .get(slot as usize)
                .copied()
                .flatten()
                .unwrap_or(self.defaults.null_uniform);
            let buffer = match self.objects.buffers.get_mut(bound) {
                Some(entry) => {
                    entry.in_flight = true;
                    entry.current.buffer
                }
                None => {
                    return Err(GfxError::Driver(format!(
                        "constant buffer {:?} slot {} was released",
                        stage, slot
                    )))
                }
            };
            buffer_infos.push((
                uniform_binding(stage, slot),
                vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                },
            ));
        }

        let vertex = self
            .objects
            .buffers
            .get_mut(vertex_buffer)
            .ok_or_else(|| GfxError::Driver("bound vertex buffer was released".to_string()))?;
        vertex.in_flight = true;
        let vertex_buffer = vertex.current.buffer;

        let mut writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        writes.extend(image_infos.iter().map(|(binding, info)| {
            vk::WriteDescriptorSet::builder()
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(info))
                .build()
        }));

        let cmd = self.frame.cmd;
        let device = &self.core.device;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
            if !writes.is_empty() {
                self.core.push_descriptor.cmd_push_descriptor_set(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    &writes,
                );
            }
            device.cmd_draw(cmd, vertex_count, 1, first_vertex, 0);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.frame.recording && !self.frame.wait_acquire {
            return Ok(());
        }
        self.submit(false)
    }
}
