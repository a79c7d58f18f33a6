//! Core renderer types shared across modules

pub mod config;

pub use config::{RendererConfig, ShaderConfig};
