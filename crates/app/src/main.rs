//! Vulkan Renderer - Main Entry Point
//!
//! Opens a window, loads one textured mesh and renders it with either the
//! raster or the ray-tracing back end.
//!
//! Controls:
//! - Space: switch between rasterization and ray tracing
//! - Left mouse drag or arrow keys: orbit the camera
//! - Mouse wheel: zoom

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::{MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::WindowId;

use renderer_core::{CONFIG_FILE_NAME, FpsCounter, RendererConfig, Timer};
use renderer_platform::{InputState, KeyCode, MouseButton, Window};
use renderer_renderer::{BackendKind, Renderer};
use renderer_resources::{MeshData, TextureData};
use renderer_scene::{Camera, PointLight};

/// Pixels of drag simulated per second while an arrow key is held.
const KEY_ORBIT_RATE: f32 = 300.0;
/// Longest frame delta fed into keyboard orbiting.
const MAX_FRAME_DELTA: f32 = 0.1;
/// Pixels per scroll line for touchpads reporting pixel deltas.
const PIXELS_PER_LINE: f32 = 40.0;

/// Title bar text: `"<prefix> | Mode: <mode> - <w>x<h> - <fps> fps"`.
fn window_title(prefix: &str, mode: BackendKind, width: u32, height: u32, fps: f32) -> String {
    format!(
        "{} | Mode: {} - {}x{} - {:.0} fps",
        prefix,
        mode.label(),
        width,
        height,
        fps
    )
}

struct App {
    config: RendererConfig,
    window: Option<Window>,
    renderer: Option<Renderer>,
    camera: Camera,
    light: PointLight,
    input: InputState,
    timer: Timer,
    fps: FpsCounter,
    /// Fatal error reported from `main` after the event loop returns.
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        let camera = Camera::new(config.window.width, config.window.height);
        Self {
            config,
            window: None,
            renderer: None,
            camera,
            light: PointLight::default(),
            input: InputState::new(),
            timer: Timer::new(),
            fps: FpsCounter::default(),
            fatal: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(
            event_loop,
            self.config.window.width,
            self.config.window.height,
            &self.config.window.title,
        )?;
        let mut renderer =
            Renderer::new(&window, &self.config).context("Failed to create renderer")?;

        let mesh = MeshData::load_or_cube(&self.config.assets.mesh)?;
        let texture = TextureData::load_or_checkerboard(&self.config.assets.texture)?;
        renderer
            .load_scene(&mesh, &texture)
            .context("Failed to upload the scene")?;

        debug!(
            "{} of {} descriptor table slots in use",
            renderer.descriptor_table().slots().allocated(),
            renderer.descriptor_table().slots().capacity()
        );
        self.camera.set_viewport(window.width(), window.height());
        self.renderer = Some(renderer);
        self.window = Some(window);
        self.update_title();
        info!("Initialization complete, entering main loop");
        Ok(())
    }

    /// Stops the loop and keeps `err` for `main` to report.
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("Fatal: {:#}", err);
        self.fatal = Some(err);
        // The device must go before the window it presents to.
        self.renderer = None;
        event_loop.exit();
    }

    fn update_title(&self) {
        if let (Some(window), Some(renderer)) = (&self.window, &self.renderer) {
            window.set_title(&window_title(
                &self.config.window.title,
                renderer.active_backend(),
                window.width(),
                window.height(),
                self.fps.fps(),
            ));
        }
    }

    /// Applies this frame's input to the camera and the back-end toggle.
    fn apply_input(&mut self, delta: f32) {
        if self.input.is_key_just_pressed(KeyCode::Space)
            && let Some(renderer) = self.renderer.as_mut()
        {
            renderer.toggle_backend();
            self.update_title();
        }

        if self.input.is_mouse_pressed(MouseButton::Left) {
            let (dx, dy) = self.input.mouse_delta();
            self.camera.orbit(dx, dy);
        }

        let mut key_dx = 0.0;
        let mut key_dy = 0.0;
        if self.input.is_key_pressed(KeyCode::ArrowLeft) {
            key_dx -= 1.0;
        }
        if self.input.is_key_pressed(KeyCode::ArrowRight) {
            key_dx += 1.0;
        }
        if self.input.is_key_pressed(KeyCode::ArrowUp) {
            key_dy += 1.0;
        }
        if self.input.is_key_pressed(KeyCode::ArrowDown) {
            key_dy -= 1.0;
        }
        if key_dx != 0.0 || key_dy != 0.0 {
            let step = KEY_ORBIT_RATE * delta;
            self.camera.orbit(key_dx * step, key_dy * step);
        }

        let (_, scroll) = self.input.scroll_delta();
        if scroll != 0.0 {
            self.camera.zoom(scroll);
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let delta = self.timer.delta_secs_clamped(MAX_FRAME_DELTA);
        self.apply_input(delta);
        self.input.begin_frame();

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        if let Err(e) = renderer.render_frame(&self.camera, &self.light) {
            if e.is_device_lost() {
                self.fail(event_loop, anyhow::Error::new(e).context("GPU device lost"));
                return;
            }
            error!("Render error: {}", e);
        }

        if self.fps.frame().is_some() {
            self.update_title();
        }
    }

    fn resized(&mut self, event_loop: &ActiveEventLoop, width: u32, height: u32) {
        if let Some(window) = self.window.as_mut() {
            window.resize(width, height);
        }
        self.camera.set_viewport(width, height);
        if let Some(renderer) = self.renderer.as_mut()
            && let Err(e) = renderer.resize(width, height)
        {
            if e.is_device_lost() {
                self.fail(event_loop, anyhow::Error::new(e).context("GPU device lost"));
                return;
            }
            warn!("Resize failed: {}", e);
        }
        self.update_title();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none()
            && let Err(e) = self.init(event_loop)
        {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => self.resized(event_loop, size.width, size.height),
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    if event.state.is_pressed() {
                        if key == KeyCode::Escape {
                            event_loop.exit();
                        }
                        self.input.on_key_pressed(key);
                    } else {
                        self.input.on_key_released(key);
                    }
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                if state.is_pressed() {
                    self.input.on_mouse_pressed(button.into());
                } else {
                    self.input.on_mouse_released(button.into());
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.input
                    .on_mouse_moved(position.x as f32, position.y as f32);
            }
            WindowEvent::MouseWheel { delta, .. } => match delta {
                MouseScrollDelta::LineDelta(x, y) => self.input.on_scroll(x, y),
                MouseScrollDelta::PixelDelta(p) => self.input.on_scroll(
                    p.x as f32 / PIXELS_PER_LINE,
                    p.y as f32 / PIXELS_PER_LINE,
                ),
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    renderer_core::init_logging();
    info!("Starting Vulkan Renderer");

    let config = RendererConfig::load_or_default(Path::new(CONFIG_FILE_NAME))
        .with_context(|| format!("Failed to read {CONFIG_FILE_NAME}"))?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    info!("Event loop exited after {:.1?}", app.timer.elapsed());

    match app.fatal.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_title_format() {
        assert_eq!(
            window_title("Vulkan Renderer", BackendKind::RayTrace, 1280, 720, 59.6),
            "Vulkan Renderer | Mode: Raytracing - 1280x720 - 60 fps"
        );
        assert_eq!(
            window_title("R", BackendKind::Raster, 800, 600, 0.0),
            "R | Mode: Rasterization - 800x600 - 0 fps"
        );
    }
}
