mod common;

use common::{params, renderer, renderer_on, renderer_with, stride12_args, vertices};
use emu_gfx::backend::{BlendMode, SwapEffect, Viewport};
use emu_gfx::gl::{Gl, Renderer, RendererSettings};
use emu_gfx::{DispMethod, GfxError, HeadlessDriver, HeadlessPlatform, Journal, NativeCall};
use glam::Vec3;

fn position(journal: &Journal, call: NativeCall) -> usize {
    journal
        .position(|c| *c == call)
        .unwrap_or_else(|| panic!("{:?} was never recorded", call))
}

#[test]
fn second_control_surface_is_an_invalid_operation() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();

    assert!(matches!(
        gl.create_surface(&params(640, 480)),
        Err(GfxError::InvalidOperation(_))
    ));
    assert_eq!(
        journal.count(|c| matches!(c, NativeCall::CreateSwapChain { .. })),
        1
    );
}

#[test]
fn flip_model_surface_allows_tearing() {
    let (mut gl, journal) = renderer();
    let surface = gl.create_surface(&params(640, 480)).unwrap();

    assert_eq!(surface.effect, SwapEffect::FlipDiscard);
    assert!(surface.allow_tearing);
    assert_eq!((surface.width, surface.height), (640, 480));
    assert_eq!(gl.surface(), Some(surface));
    assert!(
        position(&journal, NativeCall::IgnoreModeSwitches)
            > position(
                &journal,
                NativeCall::CreateSwapChain {
                    effect: SwapEffect::FlipDiscard,
                    allow_tearing: true,
                    legacy: false,
                }
            )
    );
    assert!(journal
        .calls()
        .contains(&NativeCall::SetViewport(Viewport {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        })));
}

#[test]
fn tearing_can_be_turned_off() {
    let settings = RendererSettings {
        allow_tearing: false,
        vsync: true,
    };
    let (mut gl, _journal) = renderer_with(HeadlessPlatform::default(), settings);
    let surface = gl.create_surface(&params(640, 480)).unwrap();

    assert_eq!(surface.effect, SwapEffect::FlipDiscard);
    assert!(!surface.allow_tearing);
}

#[test]
fn missing_flip_model_falls_back_to_a_legacy_surface() {
    let platform = HeadlessPlatform {
        flip_presentation: false,
        ..Default::default()
    };
    let (mut gl, journal) = renderer_on(platform);
    let surface = gl.create_surface(&params(640, 480)).unwrap();

    assert_eq!(surface.effect, SwapEffect::Discard);
    assert!(!surface.allow_tearing);
    assert!(journal.calls().contains(&NativeCall::CreateSwapChain {
        effect: SwapEffect::Discard,
        allow_tearing: false,
        legacy: true,
    }));
    assert_eq!(journal.count(|c| *c == NativeCall::IgnoreModeSwitches), 1);

    // Same external behavior as the flip path
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    gl.clear_color([0.0, 0.0, 0.0, 1.0]).unwrap();
    gl.draw(&vertices(6), 6).unwrap();
    gl.present().unwrap();
}

#[test]
fn failed_flip_creation_retries_once_with_discard() {
    let platform = HeadlessPlatform {
        fail_flip_swap_chain: true,
        ..Default::default()
    };
    let (mut gl, journal) = renderer_on(platform);
    let surface = gl.create_surface(&params(640, 480)).unwrap();

    assert_eq!(surface.effect, SwapEffect::Discard);
    assert!(!surface.allow_tearing);
    let rejected = position(
        &journal,
        NativeCall::RejectSwapChain {
            effect: SwapEffect::FlipDiscard,
            allow_tearing: true,
        },
    );
    let created = position(
        &journal,
        NativeCall::CreateSwapChain {
            effect: SwapEffect::Discard,
            allow_tearing: false,
            legacy: false,
        },
    );
    assert!(rejected < created);
    assert_eq!(
        journal.count(|c| matches!(c, NativeCall::CreateSwapChain { .. })),
        1
    );
}

#[test]
fn unsupported_platform_fails_construction() {
    let driver = HeadlessDriver::new(HeadlessPlatform {
        supported: false,
        ..Default::default()
    });
    let journal = driver.journal();

    let Err(err) = Renderer::new(Box::new(driver), None, RendererSettings::default()) else {
        panic!("renderer started on an unsupported platform");
    };
    assert!(matches!(err, GfxError::Unsupported(_)));
    assert!(journal.calls().is_empty());
}

#[test]
fn construction_creates_state_objects_and_disables_blending() {
    let (gl, journal) = renderer();

    assert_eq!(gl.disp_method(), DispMethod::Headless);
    assert_eq!(gl.generation(), 1);
    assert_eq!(
        journal.calls(),
        vec![
            NativeCall::CreateDevice,
            NativeCall::CreateState,
            NativeCall::CreateState,
            NativeCall::CreateState,
            NativeCall::SetBlendState(BlendMode::Disabled),
        ]
    );
}

#[test]
fn reset_flushes_before_rebuilding_the_device() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    journal.clear();

    let surface = gl.reset_surface(&params(800, 600)).unwrap();
    assert_eq!((surface.width, surface.height), (800, 600));
    assert_eq!(surface.generation, 2);

    let release = position(&journal, NativeCall::ReleaseSwapChain);
    let flush = position(&journal, NativeCall::Flush);
    let destroy = position(&journal, NativeCall::DestroyDevice);
    let create = position(&journal, NativeCall::CreateDevice);
    let swap_chain = journal
        .position(|c| matches!(c, NativeCall::CreateSwapChain { .. }))
        .unwrap();
    assert!(release < flush);
    assert!(flush < destroy);
    assert!(destroy < create);
    assert!(create < swap_chain);
}

#[test]
fn reset_after_device_loss_recovers() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();

    journal.lose_device();
    assert!(matches!(
        gl.draw(&vertices(3), 3),
        Err(GfxError::DeviceLost)
    ));
    assert!(matches!(gl.present(), Err(GfxError::DeviceLost)));

    gl.reset_surface(&params(640, 480)).unwrap();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    gl.draw(&vertices(3), 3).unwrap();
    gl.present().unwrap();
}

#[test]
fn objects_from_before_a_reset_are_stale() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    let texture = gl.create_texture(8, 8).unwrap();
    let target = gl.create_render_target(32, 32).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    gl.draw(&vertices(4), 4).unwrap();

    gl.reset_surface(&params(640, 480)).unwrap();

    assert!(gl.draw(&vertices(4), 4).is_err());
    assert!(matches!(
        gl.bind_pipeline(Some(pipeline)),
        Err(GfxError::StaleResource {
            created: 1,
            current: 2,
            ..
        })
    ));
    assert!(matches!(
        gl.load_texture(texture, &[0u8; 8 * 8 * 4]),
        Err(GfxError::StaleResource { .. })
    ));
    assert!(matches!(
        gl.bind_render_target(target),
        Err(GfxError::StaleResource { .. })
    ));

    // Stale objects can still be dropped; their device already freed them
    journal.clear();
    gl.destroy_pipeline(pipeline).unwrap();
    gl.destroy_texture(texture).unwrap();
    gl.destroy_render_target(target).unwrap();
    assert!(journal.calls().is_empty());
}

#[test]
fn failed_reset_leaves_the_backend_unusable() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();

    journal.fail_device_creation(true);
    assert!(matches!(
        gl.reset_surface(&params(640, 480)),
        Err(GfxError::Driver(_))
    ));
    assert_eq!(gl.surface(), None);
    assert!(matches!(
        gl.draw(&vertices(3), 3),
        Err(GfxError::DeviceUnavailable)
    ));
    assert!(matches!(
        gl.create_pipeline(&stride12_args()),
        Err(GfxError::DeviceUnavailable)
    ));

    journal.fail_device_creation(false);
    gl.reset_surface(&params(640, 480)).unwrap();
    assert_eq!(gl.generation(), 2);
    gl.create_pipeline(&stride12_args()).unwrap();
}

#[test]
fn failed_flush_aborts_the_reset() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    journal.clear();

    journal.fail_flush(true);
    assert!(matches!(
        gl.reset_surface(&params(640, 480)),
        Err(GfxError::Driver(_))
    ));
    assert_eq!(journal.count(|c| *c == NativeCall::CreateDevice), 0);
    assert_eq!(gl.surface(), None);
    assert!(matches!(
        gl.draw(&vertices(3), 3),
        Err(GfxError::DeviceUnavailable)
    ));
    assert!(matches!(
        gl.create_texture(16, 16),
        Err(GfxError::DeviceUnavailable)
    ));

    journal.fail_flush(false);
    gl.reset_surface(&params(640, 480)).unwrap();
    gl.create_pipeline(&stride12_args()).unwrap();
}

#[test]
fn lost_device_does_not_block_the_reset() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();

    journal.lose_device();
    assert!(matches!(gl.flush(), Err(GfxError::DeviceLost)));
    gl.reset_surface(&params(640, 480)).unwrap();
    assert!(gl.surface().is_some());
}

#[test]
fn reset_reapplies_blending() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    gl.enable_blending().unwrap();
    journal.clear();

    gl.reset_surface(&params(640, 480)).unwrap();
    let create = position(&journal, NativeCall::CreateDevice);
    let blend = position(&journal, NativeCall::SetBlendState(BlendMode::Alpha));
    assert!(create < blend);
}

#[test]
fn resize_refreshes_the_back_buffer() {
    let (mut gl, journal) = renderer();
    let before = gl.create_surface(&params(640, 480)).unwrap();
    journal.clear();

    let after = gl.resize_surface(1024, 768).unwrap();
    assert_eq!((after.width, after.height), (1024, 768));
    assert_ne!(before.view, after.view);
    assert!(
        position(&journal, NativeCall::ReleaseTargetView)
            < position(
                &journal,
                NativeCall::ResizeSwapChain {
                    width: 1024,
                    height: 768,
                }
            )
    );
    assert!(journal.calls().contains(&NativeCall::SetViewport(Viewport {
        x: 0,
        y: 0,
        width: 1024,
        height: 768,
    })));
}

#[test]
fn present_honors_vsync_setting() {
    let settings = RendererSettings {
        allow_tearing: true,
        vsync: false,
    };
    let (mut gl, journal) = renderer_with(HeadlessPlatform::default(), settings);
    assert!(matches!(gl.present(), Err(GfxError::InvalidOperation(_))));

    gl.create_surface(&params(640, 480)).unwrap();
    gl.present().unwrap();
    gl.set_vsync(true);
    gl.present().unwrap();
    assert_eq!(
        journal.count(|c| matches!(c, NativeCall::Present { .. })),
        2
    );
    assert!(journal
        .calls()
        .ends_with(&[NativeCall::Present { vsync: true }]));
}

#[test]
fn render_targets_replace_the_default_target() {
    let (mut gl, journal) = renderer();
    gl.create_surface(&params(640, 480)).unwrap();
    let target = gl.create_render_target(256, 224).unwrap();
    let texture = gl.render_target_texture(target).unwrap();

    gl.bind_render_target(target).unwrap();
    assert_eq!(gl.current_render_target(), Some(target));
    journal.clear();
    gl.clear_color([1.0, 0.0, 0.0, 1.0]).unwrap();
    assert_eq!(
        journal.calls(),
        vec![NativeCall::ClearRenderTarget([1.0, 0.0, 0.0, 1.0])]
    );

    // Its color buffer belongs to the target
    assert!(matches!(
        gl.destroy_texture(texture),
        Err(GfxError::InvalidOperation(_))
    ));

    gl.bind_default_target().unwrap();
    assert_eq!(gl.current_render_target(), None);

    gl.bind_render_target(target).unwrap();
    journal.clear();
    gl.destroy_render_target(target).unwrap();
    assert_eq!(gl.current_render_target(), None);
    assert_eq!(
        journal.calls(),
        vec![
            NativeCall::SetRenderTarget,
            NativeCall::ReleaseTargetView,
            NativeCall::ReleaseTexture,
        ]
    );
}

#[test]
fn clearing_needs_a_target() {
    let (mut gl, _journal) = renderer();
    assert!(matches!(
        gl.clear_color([0.0; 4]),
        Err(GfxError::InvalidOperation(_))
    ));
}

#[test]
fn textures_take_exactly_one_frame_of_pixels() {
    let (mut gl, journal) = renderer();
    let texture = gl.create_texture(4, 2).unwrap();

    assert!(matches!(
        gl.load_texture(texture, &[0u8; 16]),
        Err(GfxError::InvalidArgument(_))
    ));
    gl.load_texture(texture, &[0x80u8; 32]).unwrap();
    assert_eq!(journal.count(|c| *c == NativeCall::WriteTexture), 1);
}

#[test]
fn viewport_rejects_empty_rectangles() {
    let (mut gl, _journal) = renderer();
    assert!(matches!(
        gl.set_viewport(0, 0, 0, 480),
        Err(GfxError::InvalidArgument(_))
    ));
    gl.set_viewport(16, 8, 320, 240).unwrap();
}

#[test]
fn view_matrix_follows_the_driver_clip_space() {
    let (gl, _journal) = renderer();
    let (w, h) = (256.0, 224.0);
    let m = gl.create_projection_matrix(w, h) * gl.create_view_matrix(w, h, false);

    // The headless driver's clip space is Y-up
    assert!(m
        .transform_point3(Vec3::ZERO)
        .abs_diff_eq(Vec3::new(-1.0, 1.0, 0.0), 1e-6));
    assert_eq!(
        gl.create_view_matrix(w, h, true),
        gl.create_view_matrix(w, h, false)
    );
}
