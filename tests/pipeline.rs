mod common;

use common::{params, renderer, spirv, stride12_args, vertices};
use emu_gfx::backend::{AttribFormat, BufferUsage, ShaderStage, VertexLayout};
use emu_gfx::gl::{Gl, PipelineCompileArgs};
use emu_gfx::{GfxError, NativeCall};
use glam::{Mat4, Vec4};

fn vertex_writes(call: &NativeCall) -> bool {
    matches!(
        call,
        NativeCall::WriteDiscard {
            usage: BufferUsage::Vertex,
            ..
        }
    )
}

fn constant_writes(call: &NativeCall) -> bool {
    matches!(
        call,
        NativeCall::WriteDiscard {
            usage: BufferUsage::Constant,
            ..
        }
    )
}

fn vertex_allocations(call: &NativeCall) -> bool {
    matches!(
        call,
        NativeCall::CreateBuffer {
            usage: BufferUsage::Vertex,
            ..
        }
    )
}

#[test]
fn vertex_capacity_grows_only_when_exceeded() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    journal.clear();

    gl.draw(&vertices(4), 4).unwrap();
    assert_eq!(gl.pipeline_vertex_capacity(pipeline).unwrap(), 4);
    assert_eq!(journal.count(vertex_allocations), 1);
    assert!(journal.calls().contains(&NativeCall::CreateBuffer {
        usage: BufferUsage::Vertex,
        size: 48,
        initialized: true,
    }));

    gl.draw(&vertices(4), 4).unwrap();
    assert_eq!(gl.pipeline_vertex_capacity(pipeline).unwrap(), 4);
    assert_eq!(journal.count(vertex_allocations), 1);
    assert_eq!(journal.count(vertex_writes), 1);

    gl.draw(&vertices(10), 10).unwrap();
    assert_eq!(gl.pipeline_vertex_capacity(pipeline).unwrap(), 10);
    assert_eq!(journal.count(vertex_allocations), 2);
    assert_eq!(journal.count(|c| *c == NativeCall::ReleaseBuffer), 1);

    let stats = gl.stats();
    assert_eq!(stats.draws, 3);
    assert_eq!(stats.vertex_reallocations, 2);
    assert_eq!(stats.vertex_uploads, 1);
}

#[test]
fn smaller_draws_copy_only_what_they_use() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    gl.draw(&vertices(10), 10).unwrap();
    journal.clear();

    // Extra trailing bytes in the caller's buffer are ignored
    gl.draw(&vertices(8), 3).unwrap();
    assert_eq!(gl.pipeline_vertex_capacity(pipeline).unwrap(), 10);
    assert_eq!(
        journal.calls(),
        vec![
            NativeCall::WriteDiscard {
                usage: BufferUsage::Vertex,
                len: 36,
            },
            NativeCall::Draw {
                vertex_count: 3,
                first_vertex: 0,
            },
        ]
    );
}

#[test]
fn draw_needs_a_bound_pipeline() {
    let (mut gl, _journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    gl.create_pipeline(&stride12_args()).unwrap();

    assert!(matches!(
        gl.draw(&vertices(3), 3),
        Err(GfxError::NoPipelineBound)
    ));
}

#[test]
fn draw_rejects_short_vertex_data() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();

    assert!(matches!(
        gl.draw(&vertices(2), 3),
        Err(GfxError::InvalidArgument(_))
    ));

    journal.clear();
    gl.draw(&[], 0).unwrap();
    assert!(journal.calls().is_empty());
}

#[test]
fn uniform_dirty_flag_follows_writes_and_draws() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    assert!(!gl.is_uniform_dirty(pipeline, 0, ShaderStage::Vertex).unwrap());

    gl.set_uniform_mat4(pipeline, "mvp", &Mat4::IDENTITY, false)
        .unwrap();
    assert!(gl.is_uniform_dirty(pipeline, 0, ShaderStage::Vertex).unwrap());
    assert!(!gl.is_uniform_dirty(pipeline, 0, ShaderStage::Pixel).unwrap());

    journal.clear();
    gl.draw(&vertices(3), 3).unwrap();
    assert!(!gl.is_uniform_dirty(pipeline, 0, ShaderStage::Vertex).unwrap());
    assert_eq!(journal.count(constant_writes), 1);
    let upload = journal.position(constant_writes).unwrap();
    let draw = journal
        .position(|c| matches!(c, NativeCall::Draw { .. }))
        .unwrap();
    assert!(upload < draw);

    // No write in between: nothing to upload
    gl.draw(&vertices(3), 3).unwrap();
    assert!(!gl.is_uniform_dirty(pipeline, 0, ShaderStage::Vertex).unwrap());
    assert_eq!(journal.count(constant_writes), 1);
    assert_eq!(gl.stats().constant_uploads, 1);
}

#[test]
fn vertex_and_pixel_stages_upload_independently() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();

    gl.set_uniform_vec4(pipeline, "tint", Vec4::new(1.0, 0.5, 0.5, 1.0))
        .unwrap();
    gl.set_uniform_mat4(pipeline, "mvp", &Mat4::IDENTITY, true)
        .unwrap();
    journal.clear();

    gl.draw(&vertices(3), 3).unwrap();
    assert_eq!(journal.count(constant_writes), 2);
    assert_eq!(gl.stats().constant_uploads, 2);
}

#[test]
fn unknown_and_oversized_uniforms_are_rejected() {
    let (mut gl, _journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();

    assert!(matches!(
        gl.set_uniform_f32(pipeline, "gamma", 2.2),
        Err(GfxError::UnknownUniform(name)) if name == "gamma"
    ));
    assert!(matches!(
        gl.set_uniform(pipeline, "tint", &[0u8; 32]),
        Err(GfxError::InvalidArgument(_))
    ));
    assert!(!gl.is_uniform_dirty(pipeline, 0, ShaderStage::Pixel).unwrap());
}

#[test]
fn bind_clears_shader_resources_and_reapplies_rasterizer() {
    let (mut gl, journal) = renderer();
    let first = gl.create_pipeline(&stride12_args()).unwrap();
    let second = gl.create_pipeline(&stride12_args()).unwrap();
    journal.clear();

    gl.bind_pipeline(Some(first)).unwrap();
    let calls = journal.calls();
    assert_eq!(calls.first(), Some(&NativeCall::SetProgram));
    assert!(calls.contains(&NativeCall::SetConstantBuffers {
        stage: ShaderStage::Vertex,
        bound: 1,
    }));
    assert!(calls.contains(&NativeCall::UnsetShaderResources(ShaderStage::Vertex)));
    assert!(calls.contains(&NativeCall::UnsetShaderResources(ShaderStage::Pixel)));
    assert_eq!(calls.last(), Some(&NativeCall::SetRasterizerState));

    gl.bind_pipeline(Some(second)).unwrap();
    gl.bind_pipeline(Some(second)).unwrap();
    assert_eq!(journal.count(|c| *c == NativeCall::SetRasterizerState), 3);
    assert_eq!(gl.current_pipeline(), Some(second));
}

#[test]
fn binding_none_only_clears_the_marker() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    journal.clear();

    gl.bind_pipeline(None).unwrap();
    assert!(journal.calls().is_empty());
    assert_eq!(gl.current_pipeline(), None);
    assert!(matches!(
        gl.draw(&vertices(3), 3),
        Err(GfxError::NoPipelineBound)
    ));
}

#[test]
fn samplers_bind_on_the_current_pipeline_only() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    let texture = gl.create_texture(16, 16).unwrap();

    assert!(matches!(
        gl.set_uniform_sampler(pipeline, "frame", texture),
        Err(GfxError::InvalidOperation(_))
    ));

    gl.bind_pipeline(Some(pipeline)).unwrap();
    journal.clear();
    gl.set_uniform_sampler(pipeline, "frame", texture).unwrap();
    assert_eq!(
        journal.calls(),
        vec![NativeCall::SetShaderResource {
            stage: ShaderStage::Pixel,
            slot: 0,
        }]
    );
    assert!(matches!(
        gl.set_uniform_sampler(pipeline, "palette", texture),
        Err(GfxError::UnknownUniform(_))
    ));
}

#[test]
fn uniform_blocks_must_be_dense() {
    let (mut gl, _journal) = renderer();
    let layout = VertexLayout::new().with("position", AttribFormat::Float2);
    let args = PipelineCompileArgs::new(spirv(), spirv(), layout).with_uniform(
        "late",
        ShaderStage::Vertex,
        1,
        0,
        16,
    );

    assert!(matches!(
        gl.create_pipeline(&args),
        Err(GfxError::InvalidArgument(_))
    ));
}

#[test]
fn uniform_offsets_cannot_overflow_their_block() {
    let (mut gl, journal) = renderer();
    let layout = VertexLayout::new().with("position", AttribFormat::Float2);
    let args = PipelineCompileArgs::new(spirv(), spirv(), layout).with_uniform(
        "far",
        ShaderStage::Vertex,
        0,
        u32::MAX - 3,
        8,
    );

    assert!(matches!(
        gl.create_pipeline(&args),
        Err(GfxError::InvalidArgument(_))
    ));
    assert_eq!(journal.count(|c| *c == NativeCall::CreateProgram), 0);
}

#[test]
fn destroyed_pipeline_handles_stay_dead_after_slot_reuse() {
    let (mut gl, _journal) = renderer();
    let old = gl.create_pipeline(&stride12_args()).unwrap();
    gl.destroy_pipeline(old).unwrap();

    let new = gl.create_pipeline(&stride12_args()).unwrap();
    assert_ne!(old, new);
    assert!(matches!(
        gl.bind_pipeline(Some(old)),
        Err(GfxError::InvalidHandle(_))
    ));
    gl.bind_pipeline(Some(new)).unwrap();
}

#[test]
fn garbage_shader_bytes_are_rejected() {
    let (mut gl, journal) = renderer();
    let mut args = stride12_args();
    args.vertex_spirv = vec![0xde, 0xad, 0xbe, 0xef];

    assert!(gl.create_pipeline(&args).is_err());
    assert_eq!(journal.count(|c| *c == NativeCall::CreateProgram), 0);
}

#[test]
fn destroying_the_bound_pipeline_unbinds_it() {
    let (mut gl, journal) = renderer();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    gl.draw(&vertices(3), 3).unwrap();
    journal.clear();

    gl.destroy_pipeline(pipeline).unwrap();
    assert_eq!(gl.current_pipeline(), None);
    assert_eq!(journal.count(|c| *c == NativeCall::ReleaseProgram), 1);
    // Vertex buffer plus one constant buffer per stage
    assert_eq!(journal.count(|c| *c == NativeCall::ReleaseBuffer), 3);
    assert!(matches!(
        gl.destroy_pipeline(pipeline),
        Err(GfxError::InvalidHandle(_))
    ));
}
