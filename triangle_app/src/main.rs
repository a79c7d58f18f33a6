//! Triangle demo
//!
//! Opens a window and draws one colored triangle through the frame protocol
//! until the window closes or `--frames N` frames were presented.
//!
//! ```text
//! triangle [--frames N] [--config renderer.toml|renderer.ron]
//! ```

mod window;

use std::path::PathBuf;
use std::process::ExitCode;

use glfw::{Action, Key, WindowEvent};
use thiserror::Error;
use vengine::foundation::logging;
use vengine::prelude::*;

use window::{Window, WindowError};

const CLEAR_COLOR: ClearColor = ClearColor::new(0.2, 0.2, 0.2, 1.0);

/// Position then color, matching the default vertex layout
const VERTICES: [[f32; 6]; 3] = [
    [0.0, -0.5, 0.0, 1.0, 0.0, 0.0],
    [0.5, 0.5, 0.0, 0.0, 1.0, 0.0],
    [-0.5, 0.5, 0.0, 0.0, 0.0, 1.0],
];

const INDICES: [u16; 3] = [0, 1, 2];

#[derive(Error, Debug)]
enum AppError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    frames: Option<u64>,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, AppError> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let value = args
                    .next()
                    .ok_or_else(|| AppError::Usage("--frames needs a value".to_string()))?;
                let frames = value
                    .parse()
                    .map_err(|_| AppError::Usage(format!("Invalid frame count: {value}")))?;
                parsed.frames = Some(frames);
            }
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| AppError::Usage("--config needs a path".to_string()))?;
                parsed.config = Some(PathBuf::from(value));
            }
            other => return Err(AppError::Usage(format!("Unknown argument: {other}"))),
        }
    }
    Ok(parsed)
}

fn renderer_config(args: &Args) -> Result<RendererConfig, AppError> {
    if let Some(path) = &args.config {
        log::info!("Loading renderer configuration from {}", path.display());
        return Ok(RendererConfig::load_from_file(path)?);
    }

    let shader_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/target/shaders");
    Ok(RendererConfig::new("Triangle")
        .with_framebuffer_size(800, 600)
        .with_shaders(ShaderConfig::new(
            format!("{shader_dir}/triangle.vert.spv"),
            format!("{shader_dir}/triangle.frag.spv"),
        )))
}

fn run(args: &Args) -> Result<(), AppError> {
    let config = renderer_config(args)?;
    let (width, height) = config.framebuffer_size;

    let mut window = Window::new("vengine - Triangle", width, height)?;
    let mut renderer = VulkanRenderer::init(config, &window)?;

    let (vertices, indices) = {
        let factory = renderer.resource_factory();
        let vertices = factory
            .create_vertex_buffer(&VertexBufferDesc::from_slice(&VERTICES, BufferUsage::Static))
            .map_err(RenderError::from)?;
        let indices = factory
            .create_index_buffer(&IndexBufferDesc::from_u16(&INDICES, BufferUsage::Static))
            .map_err(RenderError::from)?;
        (vertices, indices)
    };

    let mut presented = 0u64;
    while !window.should_close() {
        window.poll_events();
        for event in window.drain_events() {
            match event {
                WindowEvent::FramebufferSize(w, h) => {
                    let width = u32::try_from(w).unwrap_or(0);
                    let height = u32::try_from(h).unwrap_or(0);
                    renderer.frame_buffer_resize(width, height);
                }
                WindowEvent::Key(Key::Escape, _, Action::Press, _) | WindowEvent::Close => {
                    window.set_should_close(true);
                }
                _ => {}
            }
        }

        renderer.begin(CLEAR_COLOR)?;
        renderer.submit_geometry(&vertices, &indices)?;
        renderer.end()?;
        renderer.render()?;
        renderer.present()?;

        presented += 1;
        if args.frames.is_some_and(|limit| presented >= limit) {
            break;
        }
    }

    log::info!("Shutting down after {} frames", renderer.frames_presented());
    renderer.finish()?;
    {
        let factory = renderer.resource_factory();
        factory.delete_vertex_buffer(vertices);
        factory.delete_index_buffer(indices);
    }
    renderer.terminate()?;
    Ok(())
}

fn main() -> ExitCode {
    logging::init_with_level(log::LevelFilter::Info);

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("usage: triangle [--frames N] [--config FILE]");
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, AppError> {
        parse_args(list.iter().map(ToString::to_string))
    }

    #[test]
    fn test_parse_frames_and_config() {
        let parsed = args(&["--frames", "120", "--config", "renderer.toml"]).unwrap();
        assert_eq!(parsed.frames, Some(120));
        assert_eq!(parsed.config, Some(PathBuf::from("renderer.toml")));
        assert_eq!(args(&[]).unwrap(), Args::default());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(args(&["--frames"]), Err(AppError::Usage(_))));
        assert!(matches!(args(&["--frames", "many"]), Err(AppError::Usage(_))));
        assert!(matches!(args(&["--fullscreen"]), Err(AppError::Usage(_))));
    }
}
