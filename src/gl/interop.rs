//! Texture sharing with a secondary GPU context.
//!
//! The secondary context is owned by the application (for instance a UI
//! toolkit running its own GPU API) and plugged in through [`InteropPeer`].
//! The bridge only exists when the peer reported its interop extension at
//! startup and the device can export memory; otherwise every interop call
//! fails with [`GfxError::InteropUnavailable`].

use crate::backend::{Device, DeviceCaps, ExternalMemory, TextureId};
use crate::error::{GfxError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// The secondary GPU context, as seen from this crate.
pub trait InteropPeer: Send {
    /// Whether the peer's interop extension was found when it started.
    fn is_available(&self) -> bool;

    /// Registers this device with the peer. Called at startup and again
    /// after every reset.
    fn open(&mut self) -> Result<()>;

    /// Drops every texture imported since `open`.
    fn close(&mut self);

    /// Aliases the peer's texture `foreign_id` onto `memory`.
    fn import_texture(
        &mut self,
        foreign_id: u32,
        width: u32,
        height: u32,
        memory: &ExternalMemory,
    ) -> Result<()>;
}

pub type SharedInteropPeer = Arc<Mutex<dyn InteropPeer>>;

pub(crate) struct InteropBridge {
    peer: SharedInteropPeer,
    open: bool,
}

impl InteropBridge {
    /// Checked once at startup.
    pub fn probe(peer: Option<SharedInteropPeer>, caps: DeviceCaps) -> Option<Self> {
        let peer = peer?;
        if !peer.lock().is_available() {
            log::info!("Interop disabled: secondary context lacks its interop extension");
            return None;
        }
        if !caps.external_memory {
            log::info!("Interop disabled: device cannot export memory");
            return None;
        }
        Some(Self { peer, open: false })
    }

    pub fn open(&mut self) -> Result<()> {
        if !self.open {
            self.peer.lock().open()?;
            self.open = true;
            log::debug!("Interop bridge opened");
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.open {
            self.peer.lock().close();
            self.open = false;
            log::debug!("Interop bridge closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Creates an exportable texture and hands its memory to the peer.
    pub fn wrap(
        &mut self,
        device: &mut dyn Device,
        foreign_id: u32,
        width: u32,
        height: u32,
    ) -> Result<TextureId> {
        if !self.open {
            return Err(GfxError::InteropUnavailable);
        }

        let (texture, memory) = device.create_exportable_texture(width, height)?;
        if let Err(err) = self
            .peer
            .lock()
            .import_texture(foreign_id, width, height, &memory)
        {
            device.release_texture(texture);
            return Err(err);
        }

        log::debug!(
            "Shared {}x{} texture with foreign id {} ({:?} {})",
            width,
            height,
            foreign_id,
            memory.kind,
            memory.handle
        );
        Ok(texture)
    }
}

impl Drop for InteropBridge {
    fn drop(&mut self) {
        self.close();
    }
}
