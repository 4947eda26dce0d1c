// Render targets and sampled textures
//
// Every texture the facade hands out lives in one slot map, whether it was
// created on its own, as the color buffer of a render target, or shared
// through interop. Entries remember the device generation they were created
// for; entries from an older generation are dropped without touching the
// device, which already released them.

use crate::backend::{Device, TargetId, TextureDesc, TextureFilter, TextureId, TextureUsage};
use crate::error::{GfxError, Result};
use crate::gl::{RenderTargetHandle, TextureHandle};
use slotmap::SlotMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TextureOwner {
    Standalone,
    /// Color buffer of a render target; released with it.
    RenderTarget,
    Interop { foreign_id: u32 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TextureEntry {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub filter: TextureFilter,
    pub owner: TextureOwner,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderTargetEntry {
    pub texture: TextureHandle,
    pub view: TargetId,
    pub generation: u64,
}

#[derive(Default)]
pub(crate) struct Targets {
    textures: SlotMap<TextureHandle, TextureEntry>,
    render_targets: SlotMap<RenderTargetHandle, RenderTargetEntry>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_texture(&mut self, entry: TextureEntry) -> TextureHandle {
        self.textures.insert(entry)
    }

    pub fn create_texture(
        &mut self,
        device: &mut dyn Device,
        width: u32,
        height: u32,
        generation: u64,
    ) -> Result<TextureHandle> {
        let id = device.create_texture(&TextureDesc {
            width,
            height,
            usage: TextureUsage::Dynamic,
        })?;
        log::debug!("Texture created: {}x{}", width, height);
        Ok(self.insert_texture(TextureEntry {
            id,
            width,
            height,
            filter: TextureFilter::default(),
            owner: TextureOwner::Standalone,
            generation,
        }))
    }

    /// Tracks a texture already shared with the secondary context.
    pub fn insert_interop(
        &mut self,
        id: TextureId,
        foreign_id: u32,
        width: u32,
        height: u32,
        generation: u64,
    ) -> TextureHandle {
        self.insert_texture(TextureEntry {
            id,
            width,
            height,
            filter: TextureFilter::default(),
            owner: TextureOwner::Interop { foreign_id },
            generation,
        })
    }

    pub fn texture(&self, handle: TextureHandle) -> Result<&TextureEntry> {
        self.textures
            .get(handle)
            .ok_or(GfxError::InvalidHandle("texture"))
    }

    pub fn texture_mut(&mut self, handle: TextureHandle) -> Result<&mut TextureEntry> {
        self.textures
            .get_mut(handle)
            .ok_or(GfxError::InvalidHandle("texture"))
    }

    /// `device` is `None` when the entry's device is already gone.
    pub fn destroy_texture(
        &mut self,
        device: Option<&mut dyn Device>,
        handle: TextureHandle,
    ) -> Result<()> {
        let entry = self.texture(handle)?;
        if entry.owner == TextureOwner::RenderTarget {
            return Err(GfxError::InvalidOperation(
                "render target textures are destroyed with their target".to_string(),
            ));
        }

        if let Some(entry) = self.textures.remove(handle) {
            if let Some(device) = device {
                device.release_texture(entry.id);
            }
            if let TextureOwner::Interop { foreign_id } = entry.owner {
                log::debug!("Shared texture {} destroyed", foreign_id);
            }
        }
        Ok(())
    }

    pub fn create_render_target(
        &mut self,
        device: &mut dyn Device,
        width: u32,
        height: u32,
        generation: u64,
    ) -> Result<RenderTargetHandle> {
        let id = device.create_texture(&TextureDesc {
            width,
            height,
            usage: TextureUsage::RenderTarget,
        })?;
        let view = match device.create_target_view(id) {
            Ok(view) => view,
            Err(err) => {
                device.release_texture(id);
                return Err(err);
            }
        };

        let texture = self.insert_texture(TextureEntry {
            id,
            width,
            height,
            filter: TextureFilter::default(),
            owner: TextureOwner::RenderTarget,
            generation,
        });
        log::debug!("Render target created: {}x{}", width, height);
        Ok(self.render_targets.insert(RenderTargetEntry {
            texture,
            view,
            generation,
        }))
    }

    pub fn render_target(&self, handle: RenderTargetHandle) -> Result<&RenderTargetEntry> {
        self.render_targets
            .get(handle)
            .ok_or(GfxError::InvalidHandle("render target"))
    }

    pub fn destroy_render_target(
        &mut self,
        device: Option<&mut dyn Device>,
        handle: RenderTargetHandle,
    ) -> Result<()> {
        let entry = self
            .render_targets
            .remove(handle)
            .ok_or(GfxError::InvalidHandle("render target"))?;
        let texture = self.textures.remove(entry.texture);

        if let Some(device) = device {
            device.release_target_view(entry.view);
            if let Some(texture) = texture {
                device.release_texture(texture.id);
            }
        }
        Ok(())
    }
}
