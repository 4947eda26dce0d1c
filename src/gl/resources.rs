// Device Resource Owner
//
// Owns the driver, the live device (device + immediate context + surface
// factory) and the cached fixed-function state objects. The live part is
// created and destroyed as one unit; each creation bumps the generation that
// every device-owned object is tagged with.

use crate::backend::{BlendMode, Device, Driver, RasterizerDesc, StateId};
use crate::error::{GfxError, Result};
use crate::gl::{PipelineHandle, RenderTargetHandle};

#[derive(Debug, Clone, Copy)]
pub(crate) struct StateObjects {
    pub blend_enabled: StateId,
    pub blend_disabled: StateId,
    pub rasterizer: StateId,
}

struct Live {
    device: Box<dyn Device>,
    states: StateObjects,
}

pub(crate) struct DeviceResources {
    // Dropped before the driver
    live: Option<Live>,
    driver: Box<dyn Driver>,
    generation: u64,
    pub current_pipeline: Option<PipelineHandle>,
    pub current_render_target: Option<RenderTargetHandle>,
}

impl DeviceResources {
    /// Fails with `Unsupported` before touching the device when the
    /// platform cannot run the driver.
    pub fn new(driver: Box<dyn Driver>) -> Result<Self> {
        driver.check_platform()?;

        let mut resources = Self {
            live: None,
            driver,
            generation: 0,
            current_pipeline: None,
            current_render_target: None,
        };
        resources.create_resources()?;
        Ok(resources)
    }

    /// Creates the device and state objects unless they already exist.
    pub fn create_resources(&mut self) -> Result<()> {
        if self.live.is_some() {
            return Ok(());
        }

        let mut device = self.driver.create_device()?;
        let states = StateObjects {
            blend_enabled: device.create_blend_state(BlendMode::Alpha)?,
            blend_disabled: device.create_blend_state(BlendMode::Disabled)?,
            rasterizer: device.create_rasterizer_state(&RasterizerDesc::default())?,
        };

        self.generation += 1;
        log::info!(
            "Device resources created on {} ({:?}, generation {})",
            device.adapter_name(),
            self.driver.disp_method(),
            self.generation
        );
        self.live = Some(Live { device, states });
        Ok(())
    }

    /// Releases the device and everything it owns.
    pub fn destroy_resources(&mut self) {
        self.current_pipeline = None;
        self.current_render_target = None;
        if self.live.take().is_some() {
            log::debug!("Device resources destroyed (generation {})", self.generation);
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn device(&mut self) -> Result<&mut dyn Device> {
        match self.live.as_mut() {
            Some(live) => Ok(live.device.as_mut()),
            None => Err(GfxError::DeviceUnavailable),
        }
    }

    pub fn device_ref(&self) -> Result<&dyn Device> {
        match self.live.as_ref() {
            Some(live) => Ok(live.device.as_ref()),
            None => Err(GfxError::DeviceUnavailable),
        }
    }

    pub fn states(&self) -> Result<StateObjects> {
        self.live
            .as_ref()
            .map(|live| live.states)
            .ok_or(GfxError::DeviceUnavailable)
    }

    /// Fails unless the device is live and `created` is its generation.
    pub fn check(&self, kind: &'static str, created: u64) -> Result<()> {
        if self.live.is_none() {
            return Err(GfxError::DeviceUnavailable);
        }
        if created != self.generation {
            return Err(GfxError::StaleResource {
                kind,
                created,
                current: self.generation,
            });
        }
        Ok(())
    }
}

impl Drop for DeviceResources {
    fn drop(&mut self) {
        self.destroy_resources();
    }
}
