// Shared fixtures for the headless integration tests
#![allow(dead_code)]

use emu_gfx::backend::{AttribFormat, ShaderStage, VertexLayout};
use emu_gfx::gl::{ControlParameters, PipelineCompileArgs, Renderer, RendererSettings};
use emu_gfx::{HeadlessDriver, HeadlessPlatform, Journal};
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, Win32WindowHandle, WindowsDisplayHandle,
};
use std::num::NonZeroIsize;

/// The headless driver never looks at the handles.
pub fn params(width: u32, height: u32) -> ControlParameters {
    let hwnd = NonZeroIsize::new(0x1234).expect("non-zero window handle");
    ControlParameters {
        window: RawWindowHandle::Win32(Win32WindowHandle::new(hwnd)),
        display: RawDisplayHandle::Windows(WindowsDisplayHandle::new()),
        width,
        height,
    }
}

/// Smallest byte string that passes as SPIR-V.
pub fn spirv() -> Vec<u8> {
    let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0; 12]);
    bytes
}

pub fn renderer_with(platform: HeadlessPlatform, settings: RendererSettings) -> (Renderer, Journal) {
    let driver = HeadlessDriver::new(platform);
    let journal = driver.journal();
    let renderer = match Renderer::new(Box::new(driver), None, settings) {
        Ok(renderer) => renderer,
        Err(err) => panic!("headless renderer failed to start: {}", err),
    };
    (renderer, journal)
}

pub fn renderer_on(platform: HeadlessPlatform) -> (Renderer, Journal) {
    renderer_with(platform, RendererSettings::default())
}

pub fn renderer() -> (Renderer, Journal) {
    renderer_on(HeadlessPlatform::default())
}

/// Position only (12 bytes per vertex), an MVP for the vertex stage, a tint
/// for the pixel stage, one sampler.
pub fn stride12_args() -> PipelineCompileArgs {
    let layout = VertexLayout::new().with("position", AttribFormat::Float3);
    PipelineCompileArgs::new(spirv(), spirv(), layout)
        .with_uniform("mvp", ShaderStage::Vertex, 0, 0, 64)
        .with_uniform("tint", ShaderStage::Pixel, 0, 0, 16)
        .with_sampler("frame", 0)
}

pub fn vertices(count: usize) -> Vec<u8> {
    vec![0u8; 12 * count]
}
