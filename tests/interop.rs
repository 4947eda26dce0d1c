mod common;

use common::{params, stride12_args};
use emu_gfx::backend::ExternalMemory;
use emu_gfx::config::Config;
use emu_gfx::gl::{create_backend, Gl, InteropPeer, Renderer, RendererSettings, SharedInteropPeer};
use emu_gfx::{GfxError, HeadlessDriver, HeadlessPlatform, Journal, NativeCall};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MockPeer {
    available: bool,
    fail_import: bool,
    opened: u32,
    closed: u32,
    imports: Vec<(u32, u32, u32, i64)>,
}

impl InteropPeer for MockPeer {
    fn is_available(&self) -> bool {
        self.available
    }

    fn open(&mut self) -> emu_gfx::Result<()> {
        self.opened += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.closed += 1;
    }

    fn import_texture(
        &mut self,
        foreign_id: u32,
        width: u32,
        height: u32,
        memory: &ExternalMemory,
    ) -> emu_gfx::Result<()> {
        if self.fail_import {
            return Err(GfxError::Driver("import rejected".to_string()));
        }
        self.imports.push((foreign_id, width, height, memory.handle));
        Ok(())
    }
}

fn peer(available: bool) -> (Arc<Mutex<MockPeer>>, SharedInteropPeer) {
    let peer = Arc::new(Mutex::new(MockPeer {
        available,
        ..Default::default()
    }));
    let shared: SharedInteropPeer = peer.clone();
    (peer, shared)
}

fn renderer_with_peer(platform: HeadlessPlatform, shared: SharedInteropPeer) -> (Renderer, Journal) {
    let driver = HeadlessDriver::new(platform);
    let journal = driver.journal();
    let renderer = match Renderer::new(Box::new(driver), Some(shared), RendererSettings::default()) {
        Ok(renderer) => renderer,
        Err(err) => panic!("headless renderer failed to start: {}", err),
    };
    (renderer, journal)
}

#[test]
fn without_a_peer_interop_is_unavailable() {
    let (mut gl, _journal) = common::renderer();

    assert!(!gl.has_interop());
    assert!(matches!(
        gl.wrap_external_texture(1, 64, 64),
        Err(GfxError::InteropUnavailable)
    ));
}

#[test]
fn peer_without_its_extension_is_never_opened() {
    let (mock, shared) = peer(false);
    let (mut gl, _journal) = renderer_with_peer(HeadlessPlatform::default(), shared);

    assert!(!gl.has_interop());
    assert_eq!(mock.lock().opened, 0);
    assert!(matches!(
        gl.wrap_external_texture(1, 64, 64),
        Err(GfxError::InteropUnavailable)
    ));
}

#[test]
fn device_without_external_memory_disables_interop() {
    let (mock, shared) = peer(true);
    let platform = HeadlessPlatform {
        external_memory: false,
        ..Default::default()
    };
    let (gl, _journal) = renderer_with_peer(platform, shared);

    assert!(!gl.has_interop());
    assert_eq!(mock.lock().opened, 0);
}

#[test]
fn wrapped_textures_share_exported_memory() {
    let (mock, shared) = peer(true);
    let (mut gl, journal) = renderer_with_peer(HeadlessPlatform::default(), shared);
    assert!(gl.has_interop());
    assert_eq!(mock.lock().opened, 1);

    let texture = gl.wrap_external_texture(7, 64, 32).unwrap();
    assert!(journal.calls().contains(&NativeCall::CreateTexture {
        width: 64,
        height: 32,
        exportable: true,
    }));
    assert_eq!(mock.lock().imports, vec![(7, 64, 32, 100)]);

    // Usable like any other texture
    gl.load_texture(texture, &vec![0u8; 64 * 32 * 4]).unwrap();
    let pipeline = gl.create_pipeline(&stride12_args()).unwrap();
    gl.bind_pipeline(Some(pipeline)).unwrap();
    gl.set_uniform_sampler(pipeline, "frame", texture).unwrap();
}

#[test]
fn failed_import_releases_the_texture() {
    let (mock, shared) = peer(true);
    mock.lock().fail_import = true;
    let (mut gl, journal) = renderer_with_peer(HeadlessPlatform::default(), shared);

    assert!(gl.wrap_external_texture(3, 16, 16).is_err());
    assert_eq!(journal.count(|c| *c == NativeCall::ReleaseTexture), 1);
}

#[test]
fn reset_reopens_the_bridge() {
    let (mock, shared) = peer(true);
    let (mut gl, _journal) = renderer_with_peer(HeadlessPlatform::default(), shared);
    gl.create_surface(&params(640, 480)).unwrap();
    let texture = gl.wrap_external_texture(7, 64, 32).unwrap();

    gl.reset_surface(&params(640, 480)).unwrap();
    {
        let mock = mock.lock();
        assert_eq!(mock.closed, 1);
        assert_eq!(mock.opened, 2);
    }
    assert!(gl.has_interop());
    assert!(matches!(
        gl.load_texture(texture, &vec![0u8; 64 * 32 * 4]),
        Err(GfxError::StaleResource { .. })
    ));
    gl.wrap_external_texture(7, 64, 32).unwrap();
}

#[test]
fn dropping_the_renderer_closes_the_bridge() {
    let (mock, shared) = peer(true);
    let (gl, _journal) = renderer_with_peer(HeadlessPlatform::default(), shared);

    drop(gl);
    assert_eq!(mock.lock().closed, 1);
}

#[test]
fn config_can_disable_interop() {
    let config = Config::from_toml(
        r#"
        [graphics]
        backend = "headless"

        [interop]
        enabled = false
        "#,
    )
    .unwrap();
    let (mock, shared) = peer(true);

    let gl = match create_backend(&config, Some(shared)) {
        Ok(gl) => gl,
        Err(err) => panic!("headless backend failed to start: {}", err),
    };
    assert!(!gl.has_interop());
    assert_eq!(mock.lock().opened, 0);
}
