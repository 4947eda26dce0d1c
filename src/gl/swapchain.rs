// Control surface - the swap chain bound to the emulator window
//
// Negotiation:
// 1. Extended factory present: flip-discard, tearing if configured.
//    If that creation fails, retry once with discard and no tearing.
// 2. No extended factory: legacy blit-model swap chain, never tearing.
// Either way the device is then told to leave display modes alone.

use crate::backend::{Device, SwapChainDesc, SwapChainId, SwapChainInfo, SwapEffect, TargetId, TextureId};
use crate::error::{GfxError, Result};
use crate::gl::{ControlParameters, SurfaceHandle};

const BUFFER_COUNT: u32 = 2;

fn negotiate(
    device: &mut dyn Device,
    params: &ControlParameters,
    allow_tearing: bool,
) -> Result<SwapChainId> {
    let legacy = SwapChainDesc {
        window: params.window,
        display: params.display,
        width: params.width,
        height: params.height,
        buffer_count: BUFFER_COUNT,
        effect: SwapEffect::Discard,
        allow_tearing: false,
        legacy: true,
    };

    let swap_chain = if device.caps().flip_presentation {
        let modern = SwapChainDesc {
            effect: SwapEffect::FlipDiscard,
            allow_tearing,
            legacy: false,
            ..legacy
        };
        match device.create_swap_chain(&modern) {
            Ok(swap_chain) => swap_chain,
            Err(err) => {
                log::warn!(
                    "Flip-model swap chain creation failed ({}), retrying with discard and no tearing",
                    err
                );
                let conservative = SwapChainDesc {
                    legacy: false,
                    ..legacy
                };
                device.create_swap_chain(&conservative)?
            }
        }
    } else {
        log::info!("Extended surface factory unavailable, using a legacy swap chain");
        device.create_swap_chain(&legacy)?
    };

    if let Err(err) = device.ignore_mode_switches(swap_chain) {
        device.release_swap_chain(swap_chain);
        return Err(err);
    }
    Ok(swap_chain)
}

pub(crate) struct ControlSurface {
    swap_chain: SwapChainId,
    back_buffer: TextureId,
    view: TargetId,
    info: SwapChainInfo,
    generation: u64,
}

impl ControlSurface {
    pub fn create(
        device: &mut dyn Device,
        params: &ControlParameters,
        allow_tearing: bool,
        generation: u64,
    ) -> Result<Self> {
        let swap_chain = negotiate(device, params, allow_tearing)?;

        let attached = (|| {
            let info = device
                .swap_chain_info(swap_chain)
                .ok_or(GfxError::InvalidHandle("swap chain"))?;
            let back_buffer = device.swap_chain_buffer(swap_chain)?;
            let view = match device.create_target_view(back_buffer) {
                Ok(view) => view,
                Err(err) => {
                    device.release_texture(back_buffer);
                    return Err(err);
                }
            };
            Ok((info, back_buffer, view))
        })();

        let (info, back_buffer, view) = match attached {
            Ok(parts) => parts,
            Err(err) => {
                device.release_swap_chain(swap_chain);
                return Err(err);
            }
        };

        log::info!(
            "Control surface {}x{} ({:?}, tearing: {})",
            info.width,
            info.height,
            info.effect,
            info.allow_tearing
        );
        Ok(Self {
            swap_chain,
            back_buffer,
            view,
            info,
            generation,
        })
    }

    pub fn handle(&self) -> SurfaceHandle {
        SurfaceHandle {
            width: self.info.width,
            height: self.info.height,
            effect: self.info.effect,
            allow_tearing: self.info.allow_tearing,
            back_buffer: self.back_buffer,
            view: self.view,
            generation: self.generation,
        }
    }

    pub fn view(&self) -> TargetId {
        self.view
    }

    /// Resizes the buffers. The back buffer and its view are released
    /// first and fetched again afterwards.
    pub fn resize(&mut self, device: &mut dyn Device, width: u32, height: u32) -> Result<()> {
        device.release_target_view(self.view);
        device.release_texture(self.back_buffer);
        device.resize_swap_chain(self.swap_chain, width, height)?;

        self.back_buffer = device.swap_chain_buffer(self.swap_chain)?;
        self.view = device.create_target_view(self.back_buffer)?;
        self.info = device
            .swap_chain_info(self.swap_chain)
            .ok_or(GfxError::InvalidHandle("swap chain"))?;
        log::debug!("Control surface resized to {}x{}", self.info.width, self.info.height);
        Ok(())
    }

    pub fn present(&self, device: &mut dyn Device, vsync: bool) -> Result<()> {
        device.present(self.swap_chain, vsync)
    }

    pub fn release(self, device: &mut dyn Device) {
        device.release_target_view(self.view);
        device.release_texture(self.back_buffer);
        device.release_swap_chain(self.swap_chain);
    }
}
