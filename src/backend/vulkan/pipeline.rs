// Programs and graphics pipeline variants
//
// A program owns its shader modules, a push-descriptor set layout and the
// pipeline layout. Fixed-function state lives outside the program, so the
// actual VkPipeline is built lazily per (blend, rasterizer) combination.
//
// Descriptor bindings (set 0):
//   vertex constant buffer slot s   -> binding s
//   pixel constant buffer slot s    -> binding PIXEL_UNIFORM_BASE + s
//   pixel sampler slot t            -> binding SAMPLER_BASE + t

use super::image::COLOR_FORMAT;
use super::shader::create_shader_module;
use crate::backend::{
    AttribFormat, BlendMode, ProgramDesc, RasterizerDesc, ShaderStage, Topology,
};
use crate::error::{GfxError, Result};
use ash::vk;
use std::collections::HashMap;
use std::ffi::CString;

pub(super) const PIXEL_UNIFORM_BASE: u32 = 16;
pub(super) const SAMPLER_BASE: u32 = 32;

pub(super) fn uniform_binding(stage: ShaderStage, slot: u32) -> u32 {
    match stage {
        ShaderStage::Vertex => slot,
        ShaderStage::Pixel => PIXEL_UNIFORM_BASE + slot,
    }
}

fn attrib_format(format: AttribFormat) -> vk::Format {
    match format {
        AttribFormat::Float1 => vk::Format::R32_SFLOAT,
        AttribFormat::Float2 => vk::Format::R32G32_SFLOAT,
        AttribFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        AttribFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        AttribFormat::UNorm4 => vk::Format::R8G8B8A8_UNORM,
    }
}

pub(super) struct Program {
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    vertex_entry: CString,
    fragment_entry: CString,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub constant_buffers: Vec<(ShaderStage, u32)>,
    pub samplers: Vec<u32>,
    variants: HashMap<(BlendMode, RasterizerDesc), vk::Pipeline>,
}

impl Program {
    pub fn new(device: &ash::Device, desc: &ProgramDesc<'_>) -> Result<Self> {
        let entry = |name: &str| {
            CString::new(name)
                .map_err(|_| GfxError::InvalidArgument(format!("bad entry point `{}`", name)))
        };
        let vertex_entry = entry(desc.vertex_entry)?;
        let fragment_entry = entry(desc.fragment_entry)?;

        let stride = desc.layout.stride();
        let bindings = vec![vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(stride)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()];
        let attributes = desc
            .layout
            .attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::builder()
                    .binding(0)
                    .location(a.location)
                    .format(attrib_format(a.format))
                    .offset(a.offset)
                    .build()
            })
            .collect();

        let topology = match desc.topology {
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        };

        let mut program = Self {
            vertex_module: vk::ShaderModule::null(),
            fragment_module: vk::ShaderModule::null(),
            vertex_entry,
            fragment_entry,
            bindings,
            attributes,
            topology,
            set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            constant_buffers: desc.constant_buffers.to_vec(),
            samplers: desc.samplers.to_vec(),
            variants: HashMap::new(),
        };

        if let Err(err) = program.create_objects(device, desc) {
            program.destroy(device);
            return Err(err);
        }
        Ok(program)
    }

    fn create_objects(&mut self, device: &ash::Device, desc: &ProgramDesc<'_>) -> Result<()> {
        self.vertex_module = create_shader_module(device, desc.vertex_spirv)?;
        self.fragment_module = create_shader_module(device, desc.fragment_spirv)?;

        let mut bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .constant_buffers
            .iter()
            .map(|&(stage, slot)| {
                let stage_flags = match stage {
                    ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
                    ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
                };
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(uniform_binding(stage, slot))
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(stage_flags)
                    .build()
            })
            .collect();
        bindings.extend(self.samplers.iter().map(|&slot| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(SAMPLER_BASE + slot)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build()
        }));

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings);
        self.set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_info, None) }?;

        let set_layouts = [self.set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        self.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;
        Ok(())
    }

    /// The pipeline for this fixed-function state, built on first use.
    pub fn variant(
        &mut self,
        device: &ash::Device,
        blend: BlendMode,
        rasterizer: RasterizerDesc,
    ) -> Result<vk::Pipeline> {
        if let Some(&pipeline) = self.variants.get(&(blend, rasterizer)) {
            return Ok(pipeline);
        }

        let pipeline = self.create_pipeline(device, blend, rasterizer)?;
        log::debug!(
            "Built pipeline variant ({:?}, cull: {})",
            blend,
            rasterizer.cull_back_faces
        );
        self.variants.insert((blend, rasterizer), pipeline);
        Ok(pipeline)
    }

    fn create_pipeline(
        &self,
        device: &ash::Device,
        blend: BlendMode,
        rasterizer: RasterizerDesc,
    ) -> Result<vk::Pipeline> {
        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(self.vertex_module)
            .name(&self.vertex_entry)
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(self.fragment_module)
            .name(&self.fragment_entry)
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&self.bindings)
            .vertex_attribute_descriptions(&self.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let cull_mode = if rasterizer.cull_back_faces {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(cull_mode)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachment = match blend {
            BlendMode::Disabled => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build(),
            BlendMode::Alpha => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        };

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let color_formats = [COLOR_FORMAT];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
        }?;

        Ok(pipelines[0])
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for (_, pipeline) in self.variants.drain() {
                device.destroy_pipeline(pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.set_layout, None);
            }
            if self.vertex_module != vk::ShaderModule::null() {
                device.destroy_shader_module(self.vertex_module, None);
            }
            if self.fragment_module != vk::ShaderModule::null() {
                device.destroy_shader_module(self.fragment_module, None);
            }
        }
    }
}
