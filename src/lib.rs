//! Backend-agnostic GPU rendering layer for emulator video output.
//!
//! The [`gl::Gl`] facade is what the video output layer draws through. A
//! [`gl::Renderer`] implements it on top of one native driver chosen at
//! startup (Vulkan, or the headless simulation used by tests).

pub mod backend;
pub mod config;
pub mod error;
pub mod gl;
pub mod logging;
pub mod math;

pub use backend::{DispMethod, HeadlessDriver, HeadlessPlatform, Journal, NativeCall};
pub use config::Config;
pub use error::{GfxError, Result};
pub use gl::{create_backend, ControlParameters, Gl, Renderer};
