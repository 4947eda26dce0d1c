//! Pipeline state: one compiled program plus the buffers it draws from.
//!
//! The vertex buffer grows to fit the largest draw seen so far and is
//! otherwise rewritten in place with discard semantics. Uniforms are staged
//! in CPU-side pending buffers per constant-buffer slot and stage; a slot is
//! only uploaded by the next draw when its dirty flag is set.

use crate::backend::{
    spirv_words, BufferDesc, BufferId, BufferUsage, Device, ProgramDesc, ProgramId, ShaderStage,
    StateId, Topology, VertexLayout, MAX_CONSTANT_BUFFER_SLOTS, MAX_SAMPLER_SLOTS,
};
use crate::error::{GfxError, Result};
use crate::gl::DrawStats;

/// One uniform inside a constant-buffer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformDecl {
    pub name: String,
    pub stage: ShaderStage,
    /// Constant-buffer slot (uniform block binding).
    pub block: u32,
    /// Byte offset inside the block.
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerDecl {
    pub name: String,
    /// Pixel-stage sampler slot.
    pub slot: u32,
}

/// Everything needed to build a pipeline from precompiled shaders.
#[derive(Debug, Clone)]
pub struct PipelineCompileArgs {
    pub vertex_spirv: Vec<u8>,
    pub vertex_entry: String,
    pub fragment_spirv: Vec<u8>,
    pub fragment_entry: String,
    pub layout: VertexLayout,
    pub topology: Topology,
    pub uniforms: Vec<UniformDecl>,
    pub samplers: Vec<SamplerDecl>,
}

impl PipelineCompileArgs {
    pub fn new(vertex_spirv: Vec<u8>, fragment_spirv: Vec<u8>, layout: VertexLayout) -> Self {
        Self {
            vertex_spirv,
            vertex_entry: "main".to_string(),
            fragment_spirv,
            fragment_entry: "main".to_string(),
            layout,
            topology: Topology::TriangleList,
            uniforms: Vec::new(),
            samplers: Vec::new(),
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_uniform(mut self, name: &str, stage: ShaderStage, block: u32, offset: u32, size: u32) -> Self {
        self.uniforms.push(UniformDecl {
            name: name.to_string(),
            stage,
            block,
            offset,
            size,
        });
        self
    }

    pub fn with_sampler(mut self, name: &str, slot: u32) -> Self {
        self.samplers.push(SamplerDecl {
            name: name.to_string(),
            slot,
        });
        self
    }
}

fn stage_index(stage: ShaderStage) -> usize {
    match stage {
        ShaderStage::Vertex => 0,
        ShaderStage::Pixel => 1,
    }
}

struct StageBuffer {
    buffer: BufferId,
    pending: Vec<u8>,
    dirty: bool,
}

struct ConstantSlot {
    size: usize,
    stages: [Option<StageBuffer>; 2],
}

/// Largest constant block, 4096 four-component registers.
const MAX_BLOCK_BYTES: u32 = 64 * 1024;

/// Block sizes, dense from slot 0, each rounded up to 16 bytes.
fn block_sizes(uniforms: &[UniformDecl]) -> Result<Vec<usize>> {
    let mut sizes: Vec<usize> = Vec::new();
    for uniform in uniforms {
        if uniform.size == 0 {
            return Err(GfxError::InvalidArgument(format!(
                "uniform `{}` has zero size",
                uniform.name
            )));
        }
        let block = uniform.block as usize;
        if block >= MAX_CONSTANT_BUFFER_SLOTS {
            return Err(GfxError::InvalidArgument(format!(
                "uniform `{}` uses block {}, only {} are available",
                uniform.name, block, MAX_CONSTANT_BUFFER_SLOTS
            )));
        }
        if sizes.len() <= block {
            sizes.resize(block + 1, 0);
        }
        let end = uniform
            .offset
            .checked_add(uniform.size)
            .filter(|&end| end <= MAX_BLOCK_BYTES)
            .ok_or_else(|| {
                GfxError::InvalidArgument(format!(
                    "uniform `{}` ends past the {} byte block limit",
                    uniform.name, MAX_BLOCK_BYTES
                ))
            })?;
        sizes[block] = sizes[block].max(end as usize);
    }

    if let Some(gap) = sizes.iter().position(|&size| size == 0) {
        return Err(GfxError::InvalidArgument(format!(
            "uniform blocks must be dense from 0, block {} is unused",
            gap
        )));
    }
    Ok(sizes.into_iter().map(|size| (size + 15) & !15).collect())
}

pub(crate) struct Pipeline {
    program: ProgramId,
    stride: u32,
    vertex_buffer: Option<BufferId>,
    /// In vertices; never shrinks.
    capacity: u32,
    slots: [Option<ConstantSlot>; MAX_CONSTANT_BUFFER_SLOTS],
    uniforms: Vec<UniformDecl>,
    samplers: Vec<SamplerDecl>,
    generation: u64,
}

impl Pipeline {
    pub fn create(device: &mut dyn Device, args: &PipelineCompileArgs, generation: u64) -> Result<Self> {
        if args.layout.attributes.is_empty() || args.layout.stride() == 0 {
            return Err(GfxError::InvalidArgument("vertex layout is empty".to_string()));
        }
        for (i, uniform) in args.uniforms.iter().enumerate() {
            if args.uniforms[..i]
                .iter()
                .any(|u| u.name == uniform.name && u.stage == uniform.stage)
            {
                return Err(GfxError::InvalidArgument(format!(
                    "uniform `{}` declared twice for the {:?} stage",
                    uniform.name, uniform.stage
                )));
            }
        }
        for sampler in &args.samplers {
            if sampler.slot as usize >= MAX_SAMPLER_SLOTS {
                return Err(GfxError::InvalidArgument(format!(
                    "sampler `{}` uses slot {}, only {} are available",
                    sampler.name, sampler.slot, MAX_SAMPLER_SLOTS
                )));
            }
        }

        let sizes = block_sizes(&args.uniforms)?;
        let mut stage_blocks: Vec<(ShaderStage, u32)> = Vec::new();
        for uniform in &args.uniforms {
            if !stage_blocks.contains(&(uniform.stage, uniform.block)) {
                stage_blocks.push((uniform.stage, uniform.block));
            }
        }
        let sampler_slots: Vec<u32> = args.samplers.iter().map(|s| s.slot).collect();

        let vertex_spirv = spirv_words(&args.vertex_spirv)?;
        let fragment_spirv = spirv_words(&args.fragment_spirv)?;
        let program = device.create_program(&ProgramDesc {
            vertex_spirv: &vertex_spirv,
            vertex_entry: &args.vertex_entry,
            fragment_spirv: &fragment_spirv,
            fragment_entry: &args.fragment_entry,
            layout: &args.layout,
            topology: args.topology,
            constant_buffers: &stage_blocks,
            samplers: &sampler_slots,
        })?;

        let mut pipeline = Self {
            program,
            stride: args.layout.stride(),
            vertex_buffer: None,
            capacity: 0,
            slots: std::array::from_fn(|_| None),
            uniforms: args.uniforms.clone(),
            samplers: args.samplers.clone(),
            generation,
        };

        for (block, &size) in sizes.iter().enumerate() {
            let mut slot = ConstantSlot {
                size,
                stages: [None, None],
            };
            for stage in ShaderStage::ALL {
                if !stage_blocks.contains(&(stage, block as u32)) {
                    continue;
                }
                let pending = vec![0u8; size];
                let buffer = match device.create_buffer(
                    &BufferDesc {
                        size,
                        usage: BufferUsage::Constant,
                    },
                    Some(&pending),
                ) {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        pipeline.slots[block] = Some(slot);
                        pipeline.release(device);
                        return Err(err);
                    }
                };
                slot.stages[stage_index(stage)] = Some(StageBuffer {
                    buffer,
                    pending,
                    dirty: false,
                });
            }
            pipeline.slots[block] = Some(slot);
        }

        log::debug!(
            "Pipeline created: stride {}, {} uniform blocks, {} samplers",
            pipeline.stride,
            sizes.len(),
            pipeline.samplers.len()
        );
        Ok(pipeline)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn vertex_capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_dirty(&self, block: u32, stage: ShaderStage) -> bool {
        self.slots
            .get(block as usize)
            .and_then(|slot| slot.as_ref())
            .and_then(|slot| slot.stages[stage_index(stage)].as_ref())
            .map_or(false, |stage| stage.dirty)
    }

    fn used_slots(&self) -> impl Iterator<Item = &ConstantSlot> {
        self.slots.iter().map_while(|slot| slot.as_ref())
    }

    /// Makes this pipeline the one the immediate context draws with.
    pub fn bind(&self, device: &mut dyn Device, rasterizer: StateId) {
        device.set_program(self.program);
        for stage in ShaderStage::ALL {
            let buffers: Vec<Option<BufferId>> = self
                .used_slots()
                .map(|slot| slot.stages[stage_index(stage)].as_ref().map(|s| s.buffer))
                .collect();
            device.set_constant_buffers(stage, &buffers);
        }
        // Nothing sampled by the previous pipeline may leak into this one
        for stage in ShaderStage::ALL {
            device.unset_shader_resources(stage);
        }
        device.set_vertex_buffer(self.vertex_buffer, self.stride);
        device.set_rasterizer_state(rasterizer);
    }

    pub fn draw(
        &mut self,
        device: &mut dyn Device,
        vertices: &[u8],
        count: u32,
        stats: &mut DrawStats,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let len = self.stride as usize * count as usize;
        if vertices.len() < len {
            return Err(GfxError::InvalidArgument(format!(
                "{} vertices of {} bytes need {} bytes, got {}",
                count,
                self.stride,
                len,
                vertices.len()
            )));
        }
        let vertices = &vertices[..len];

        match self.vertex_buffer {
            Some(buffer) if count <= self.capacity => {
                device.write_discard(buffer, vertices)?;
                stats.vertex_uploads += 1;
            }
            _ => {
                if let Some(old) = self.vertex_buffer.take() {
                    device.release_buffer(old);
                }
                let buffer = device.create_buffer(
                    &BufferDesc {
                        size: len,
                        usage: BufferUsage::Vertex,
                    },
                    Some(vertices),
                )?;
                log::debug!("Vertex buffer grown from {} to {} vertices", self.capacity, count);
                self.vertex_buffer = Some(buffer);
                self.capacity = count;
                stats.vertex_reallocations += 1;
                device.set_vertex_buffer(Some(buffer), self.stride);
            }
        }

        for slot in self.slots.iter_mut().map_while(|slot| slot.as_mut()) {
            for stage in slot.stages.iter_mut().flatten() {
                if stage.dirty {
                    device.write_discard(stage.buffer, &stage.pending)?;
                    stage.dirty = false;
                    stats.constant_uploads += 1;
                }
            }
        }

        device.draw(count, 0)?;
        stats.draws += 1;
        Ok(())
    }

    /// Copies `data` into every stage's pending buffer declaring `name`.
    pub fn set_uniform(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let targets: Vec<UniformDecl> = self
            .uniforms
            .iter()
            .filter(|u| u.name == name)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(GfxError::UnknownUniform(name.to_string()));
        }

        for uniform in &targets {
            if data.len() > uniform.size as usize {
                return Err(GfxError::InvalidArgument(format!(
                    "{} bytes for uniform `{}` of {} bytes",
                    data.len(),
                    name,
                    uniform.size
                )));
            }
        }

        for uniform in targets {
            let stage = self.slots[uniform.block as usize]
                .as_mut()
                .and_then(|slot| slot.stages[stage_index(uniform.stage)].as_mut())
                .ok_or_else(|| GfxError::UnknownUniform(name.to_string()))?;
            let offset = uniform.offset as usize;
            stage.pending[offset..offset + data.len()].copy_from_slice(data);
            stage.dirty = true;
        }
        Ok(())
    }

    pub fn sampler_slot(&self, name: &str) -> Result<u32> {
        self.samplers
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.slot)
            .ok_or_else(|| GfxError::UnknownUniform(name.to_string()))
    }

    /// Releases every native object. Only valid for the generation that
    /// created them.
    pub fn release(self, device: &mut dyn Device) {
        if let Some(buffer) = self.vertex_buffer {
            device.release_buffer(buffer);
        }
        for slot in self.slots.into_iter().flatten() {
            for stage in slot.stages.into_iter().flatten() {
                device.release_buffer(stage.buffer);
            }
        }
        device.release_program(self.program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(name: &str, stage: ShaderStage, block: u32, offset: u32, size: u32) -> UniformDecl {
        UniformDecl {
            name: name.to_string(),
            stage,
            block,
            offset,
            size,
        }
    }

    #[test]
    fn block_sizes_round_up_to_16() {
        let sizes = block_sizes(&[
            uniform("mvp", ShaderStage::Vertex, 0, 0, 64),
            uniform("tint", ShaderStage::Pixel, 1, 0, 16),
            uniform("scale", ShaderStage::Pixel, 1, 16, 4),
        ])
        .unwrap();
        assert_eq!(sizes, vec![64, 32]);
    }

    #[test]
    fn block_sizes_reject_gaps() {
        let err = block_sizes(&[uniform("late", ShaderStage::Vertex, 2, 0, 16)]).unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
    }

    #[test]
    fn block_sizes_reject_out_of_range_slot() {
        let err = block_sizes(&[uniform(
            "far",
            ShaderStage::Vertex,
            MAX_CONSTANT_BUFFER_SLOTS as u32,
            0,
            4,
        )])
        .unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
    }

    #[test]
    fn block_sizes_reject_offsets_past_the_limit() {
        let err = block_sizes(&[uniform("wrap", ShaderStage::Vertex, 0, u32::MAX - 3, 8)])
            .unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));

        let err = block_sizes(&[uniform("huge", ShaderStage::Pixel, 0, MAX_BLOCK_BYTES, 4)])
            .unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));

        let sizes = block_sizes(&[uniform("last", ShaderStage::Pixel, 0, MAX_BLOCK_BYTES - 16, 16)])
            .unwrap();
        assert_eq!(sizes, vec![MAX_BLOCK_BYTES as usize]);
    }
}
