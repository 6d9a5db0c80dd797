//! CLI entry point for the hybrid renderer.
//!
//! Renders the procedural demo scene either headless (N frames into
//! offscreen targets, the last one saved as PNG) or in a winit window.

mod acceleration_structures;
mod buffer_helpers;
mod camera;
mod config;
mod descriptors;
mod direct_lighting;
mod forward_stage;
mod gbuffer_stage;
mod geometry;
mod ibl;
mod image_helpers;
mod lighting_stage;
mod memory_manager;
mod pipelines;
mod render_helpers;
mod renderer;
mod scene;
mod scene_binding;
mod screenshot;
mod shader_manager;
mod swapchain;
mod vulkan_context;

use ash::vk;
use clap::Parser;
use log::{debug, error, info};
use std::path::{Path, PathBuf};

use config::RenderConfig;
use renderer::Renderer;

/// Hybrid rasterization / ray tracing renderer.
#[derive(Parser)]
#[command(name = "hybrid-renderer", about = "Hybrid Vulkan renderer")]
struct Args {
    /// JSON renderer configuration. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Target height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Force the rasterization-only lighting path.
    #[arg(long)]
    no_ray_tracing: bool,

    /// Open a window instead of rendering headless.
    #[arg(long)]
    interactive: bool,

    /// Frames rendered before the headless capture.
    #[arg(long, default_value = "3")]
    frames: u32,

    /// Output PNG file path for headless runs.
    #[arg(long, default_value = "capture.png")]
    output: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<RenderConfig, String> {
    let mut config = match &args.config {
        Some(path) => RenderConfig::load(path)?,
        None => RenderConfig::default(),
    };
    if args.no_ray_tracing {
        config.ray_tracing_enabled = false;
    }
    Ok(config)
}

fn run(args: Args) -> Result<(), String> {
    let config = load_config(&args)?;
    let extent = vk::Extent2D {
        width: args.width.max(1),
        height: args.height.max(1),
    };

    info!("Resolution: {}x{}", extent.width, extent.height);
    info!("Ray tracing requested: {}", config.ray_tracing_enabled);

    if args.interactive {
        run_interactive(config, extent)
    } else {
        run_headless(&config, extent, args.frames.max(1), &args.output)
    }
}

/// Render `frames` frames offscreen and save the last one.
fn run_headless(
    config: &RenderConfig,
    extent: vk::Extent2D,
    frames: u32,
    output: &Path,
) -> Result<(), String> {
    let mut renderer = Renderer::new(config, None, extent)?;
    renderer.load_scene(&scene::demo_scene_content(config))?;

    if let Some(scene) = renderer.scene() {
        debug!(
            "Scene {:?}: {} lights, {} materials",
            scene.id(),
            scene.light_count(),
            scene.material_count()
        );
    }
    let target = renderer.extent();
    info!(
        "Rendering {} frames at {}x{}, ray tracing: {}",
        frames,
        target.width,
        target.height,
        renderer.ray_tracing_enabled()
    );

    for _ in 0..frames {
        renderer.draw_frame()?;
    }
    renderer.capture(output)?;

    renderer.destroy();
    info!("Render complete: {}", output.display());
    Ok(())
}

/// Run in interactive mode with a winit window.
fn run_interactive(config: RenderConfig, extent: vk::Extent2D) -> Result<(), String> {
    use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
    use winit::application::ApplicationHandler;
    use winit::event::{ElementState, WindowEvent};
    use winit::event_loop::{ActiveEventLoop, EventLoop};
    use winit::keyboard::{KeyCode, PhysicalKey};
    use winit::window::{Window, WindowId};

    struct App {
        config: RenderConfig,
        extent: vk::Extent2D,
        // Dropped before the window its surface belongs to.
        renderer: Option<Renderer>,
        window: Option<Window>,
        error: Option<String>,
    }

    impl App {
        fn create_renderer(&self, window: &Window) -> Result<Renderer, String> {
            let display = window
                .display_handle()
                .map_err(|e| format!("Failed to get display handle: {}", e))?
                .as_raw();
            let handle = window
                .window_handle()
                .map_err(|e| format!("Failed to get window handle: {}", e))?
                .as_raw();

            let size = window.inner_size();
            let extent = vk::Extent2D {
                width: size.width.max(1),
                height: size.height.max(1),
            };

            let mut renderer = Renderer::new(&self.config, Some((display, handle)), extent)?;
            renderer.load_scene(&scene::demo_scene_content(&self.config))?;
            Ok(renderer)
        }

        fn fail(&mut self, event_loop: &ActiveEventLoop, e: String) {
            self.renderer = None;
            self.error = Some(e);
            event_loop.exit();
        }
    }

    impl ApplicationHandler for App {
        fn resumed(&mut self, event_loop: &ActiveEventLoop) {
            if self.window.is_some() {
                return;
            }

            let window_attrs = Window::default_attributes()
                .with_title("Hybrid Renderer")
                .with_inner_size(winit::dpi::PhysicalSize::new(
                    self.extent.width,
                    self.extent.height,
                ));

            let window = match event_loop.create_window(window_attrs) {
                Ok(window) => window,
                Err(e) => return self.fail(event_loop, format!("Failed to create window: {}", e)),
            };

            match self.create_renderer(&window) {
                Ok(renderer) => {
                    info!("Controls: L toggles the light volume, R reloads shaders, Esc quits");
                    self.renderer = Some(renderer);
                    window.request_redraw();
                    self.window = Some(window);
                }
                Err(e) => self.fail(event_loop, e),
            }
        }

        fn window_event(
            &mut self,
            event_loop: &ActiveEventLoop,
            _window_id: WindowId,
            event: WindowEvent,
        ) {
            let Some(renderer) = self.renderer.as_mut() else {
                return;
            };

            match event {
                WindowEvent::CloseRequested => {
                    info!("Window close requested");
                    event_loop.exit();
                }
                WindowEvent::KeyboardInput { event, .. }
                    if event.state == ElementState::Pressed && !event.repeat =>
                {
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => event_loop.exit(),
                        PhysicalKey::Code(KeyCode::KeyL) => {
                            renderer.toggle_light_volume();
                        }
                        PhysicalKey::Code(KeyCode::KeyR) => {
                            // The previous pipelines stay in use when a shader fails to build.
                            if let Err(e) = renderer.reload_shaders() {
                                error!("Shader reload failed: {}", e);
                            }
                        }
                        _ => {}
                    }
                }
                WindowEvent::Resized(size) => {
                    if let Err(e) = renderer.resize(size.width, size.height) {
                        self.fail(event_loop, e);
                    }
                }
                WindowEvent::RedrawRequested => {
                    if let Err(e) = renderer.draw_frame() {
                        return self.fail(event_loop, e);
                    }
                    if let Some(window) = &self.window {
                        window.request_redraw();
                    }
                }
                _ => {}
            }
        }

        fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
            if let Some(mut renderer) = self.renderer.take() {
                renderer.destroy();
            }
        }
    }

    let event_loop = EventLoop::new().map_err(|e| format!("Failed to create event loop: {}", e))?;

    let mut app = App {
        config,
        extent,
        renderer: None,
        window: None,
        error: None,
    };

    event_loop
        .run_app(&mut app)
        .map_err(|e| format!("Event loop error: {}", e))?;

    match app.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_render_headless() {
        let args = Args::parse_from(["hybrid-renderer"]);
        assert!(!args.interactive);
        assert!(!args.no_ray_tracing);
        assert_eq!((args.width, args.height), (1280, 720));
        assert_eq!(args.frames, 3);
        assert_eq!(args.output, PathBuf::from("capture.png"));
    }

    #[test]
    fn no_ray_tracing_flag_overrides_config() {
        let args = Args::parse_from(["hybrid-renderer", "--no-ray-tracing"]);
        let config = load_config(&args).unwrap();
        assert!(!config.ray_tracing_enabled);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = Args::parse_from(["hybrid-renderer", "--config", "/nonexistent/config.json"]);
        assert!(load_config(&args).is_err());
    }
}
