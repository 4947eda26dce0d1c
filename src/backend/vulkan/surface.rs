// Window surfaces from raw-window-handle 0.6 handles
//
// Only the window systems whose instance extension was enabled can be used.

use super::device::Core;
use crate::error::{GfxError, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

/// Candidate surface extensions for this target.
pub(super) fn platform_extensions() -> Vec<&'static CStr> {
    #[cfg(target_os = "windows")]
    {
        vec![khr::Win32Surface::name()]
    }
    #[cfg(all(unix, not(target_os = "macos"), not(target_os = "ios")))]
    {
        vec![
            khr::XlibSurface::name(),
            khr::XcbSurface::name(),
            khr::WaylandSurface::name(),
        ]
    }
    #[cfg(not(any(
        target_os = "windows",
        all(unix, not(target_os = "macos"), not(target_os = "ios"))
    )))]
    {
        Vec::new()
    }
}

fn require(core: &Core, name: &'static CStr) -> Result<()> {
    if core.surface_extensions.contains(&name) {
        Ok(())
    } else {
        Err(GfxError::Unsupported(format!(
            "{} is not enabled",
            name.to_string_lossy()
        )))
    }
}

pub(super) fn create_surface(
    core: &Core,
    window: RawWindowHandle,
    display: RawDisplayHandle,
) -> Result<vk::SurfaceKHR> {
    match (window, display) {
        #[cfg(target_os = "windows")]
        (RawWindowHandle::Win32(handle), _) => {
            require(core, khr::Win32Surface::name())?;
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0);
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(handle.hwnd.get() as vk::HWND);
            let loader = khr::Win32Surface::new(&core.entry, &core.instance);
            Ok(unsafe { loader.create_win32_surface(&create_info, None) }?)
        }
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "ios")))]
        (RawWindowHandle::Xlib(handle), RawDisplayHandle::Xlib(display)) => {
            require(core, khr::XlibSurface::name())?;
            let dpy = display
                .display
                .ok_or_else(|| GfxError::InvalidArgument("Xlib display is null".to_string()))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(handle.window as vk::Window);
            let loader = khr::XlibSurface::new(&core.entry, &core.instance);
            Ok(unsafe { loader.create_xlib_surface(&create_info, None) }?)
        }
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "ios")))]
        (RawWindowHandle::Xcb(handle), RawDisplayHandle::Xcb(display)) => {
            require(core, khr::XcbSurface::name())?;
            let connection = display
                .connection
                .ok_or_else(|| GfxError::InvalidArgument("XCB connection is null".to_string()))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut vk::xcb_connection_t)
                .window(handle.window.get() as vk::xcb_window_t);
            let loader = khr::XcbSurface::new(&core.entry, &core.instance);
            Ok(unsafe { loader.create_xcb_surface(&create_info, None) }?)
        }
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "ios")))]
        (RawWindowHandle::Wayland(handle), RawDisplayHandle::Wayland(display)) => {
            require(core, khr::WaylandSurface::name())?;
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(handle.surface.as_ptr() as *mut vk::wl_surface);
            let loader = khr::WaylandSurface::new(&core.entry, &core.instance);
            Ok(unsafe { loader.create_wayland_surface(&create_info, None) }?)
        }
        (window, _) => Err(GfxError::Unsupported(format!(
            "window handle {:?} has no Vulkan surface path here",
            window
        ))),
    }
}
