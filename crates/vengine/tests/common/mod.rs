//! Shared setup for integration tests: SPIR-V stubs on disk and a renderer
//! over the recording device

#![allow(dead_code)]

use std::path::PathBuf;

use vengine::prelude::*;
use vengine::render::backends::mock::RecordingDevice;

/// Smallest blob the shader loader accepts: the SPIR-V magic and a version word
pub fn spirv_stub() -> Vec<u8> {
    [0x0723_0203u32, 0x0001_0000]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

/// Write a vertex and fragment stub under a directory unique to `test_name`
pub fn shader_config(test_name: &str) -> ShaderConfig {
    let dir: PathBuf = std::env::temp_dir().join("vengine_tests").join(test_name);
    std::fs::create_dir_all(&dir).unwrap();
    let vert = dir.join("triangle.vert.spv");
    let frag = dir.join("triangle.frag.spv");
    std::fs::write(&vert, spirv_stub()).unwrap();
    std::fs::write(&frag, spirv_stub()).unwrap();
    ShaderConfig::new(vert.to_string_lossy(), frag.to_string_lossy())
}

/// Default test configuration: 800x600, two frames in flight, no validation
pub fn config(test_name: &str) -> RendererConfig {
    RendererConfig::new(test_name)
        .with_validation(false)
        .with_framebuffer_size(800, 600)
        .with_frames_in_flight(2)
        .with_shaders(shader_config(test_name))
}

/// Renderer over a fresh recording device
pub fn renderer(test_name: &str) -> VulkanRenderer<RecordingDevice> {
    VulkanRenderer::with_device(RecordingDevice::new(), config(test_name)).unwrap()
}

/// Drive one full frame with no geometry
pub fn empty_frame(renderer: &mut VulkanRenderer<RecordingDevice>) {
    renderer.begin(ClearColor::new(0.2, 0.2, 0.2, 1.0)).unwrap();
    renderer.end().unwrap();
    renderer.render().unwrap();
    renderer.present().unwrap();
}

/// Interleaved position and color, matching the default vertex layout
pub const TRIANGLE: [[f32; 6]; 3] = [
    [0.0, -0.5, 0.0, 1.0, 0.0, 0.0],
    [0.5, 0.5, 0.0, 0.0, 1.0, 0.0],
    [-0.5, 0.5, 0.0, 0.0, 0.0, 1.0],
];
