// =============================================================================
// VK FRAME CORE DEMO - a spinning triangle through the render graph
// =============================================================================
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (main thread)                                 │
// │    └── Renderer<VulkanBackend>                                  │
// │          ├── FrameCore     acquire / record / submit / present  │
// │          ├── ModelRegistry triangle, lighting, post models      │
// │          └── Loader thread builds them in the background        │
// └─────────────────────────────────────────────────────────────────┘
//
// Keys: ESC quits, F11 toggles fullscreen, SPACE hides/shows the triangle.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use vk_frame_core::assets::LoadSource;
use vk_frame_core::backend::{VulkanBackend, VulkanDevice, VulkanModelBuilder};
use vk_frame_core::model::ModelBuilder;
use vk_frame_core::window::{WindowSurface, WinitSurface};
use vk_frame_core::{
    Config, FrameOutcome, MeshSource, ModelHandle, ModelInfo, PipelineVariant, RenderGraph,
    Renderer, VertexLayout,
};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Vulkan frame core demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, pipeline: {:?}",
        config.graphics.present_mode,
        config.graphics.pipeline
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Vulkan Frame Core Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SCENE DATA
// =============================================================================

/// Frame-global uniform block (binding 0 of every model set)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GlobalUniforms {
    view_proj: Mat4,
    /// x = seconds since start, y = aspect ratio
    time: Vec4,
}

/// Per-model uniform block of the triangle (binding 1)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TriangleUniforms {
    model: Mat4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.6, 0.0],
        color: [1.0, 0.2, 0.2],
    },
    Vertex {
        position: [0.6, 0.6, 0.0],
        color: [0.2, 1.0, 0.2],
    },
    Vertex {
        position: [-0.6, 0.6, 0.0],
        color: [0.2, 0.2, 1.0],
    },
];

fn shader(name: &str) -> LoadSource {
    LoadSource::file(format!("shaders/{}.spv", name))
}

/// Models for the configured pipeline variant: (info, is the triangle)
fn demo_models(variant: PipelineVariant) -> Vec<ModelInfo> {
    let triangle_fragment = match variant {
        PipelineVariant::Forward => "triangle.frag",
        PipelineVariant::Deferred => "gbuffer.frag",
    };
    let mut models = vec![ModelInfo {
        name: "triangle".to_string(),
        pass: 0,
        subpass: 0,
        mesh: MeshSource {
            vertices: LoadSource::buffer(bytemuck::cast_slice::<Vertex, u8>(&TRIANGLE).to_vec()),
            indices: None,
            layout: VertexLayout::new(vec![
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
            ]),
        },
        vertex_shader: shader("triangle.vert"),
        fragment_shader: shader(triangle_fragment),
        textures: Vec::new(),
        uniform_size: std::mem::size_of::<TriangleUniforms>(),
        instances: 1,
    }];

    if variant == PipelineVariant::Deferred {
        models.push(ModelInfo {
            name: "lighting".to_string(),
            pass: 0,
            subpass: 1,
            mesh: MeshSource::fullscreen_triangle(),
            vertex_shader: shader("fullscreen.vert"),
            fragment_shader: shader("lighting.frag"),
            textures: Vec::new(),
            uniform_size: 0,
            instances: 1,
        });
    }

    models.push(ModelInfo {
        name: "post".to_string(),
        pass: 1,
        subpass: 0,
        mesh: MeshSource::fullscreen_triangle(),
        vertex_shader: shader("fullscreen.vert"),
        fragment_shader: shader("post.frag"),
        textures: Vec::new(),
        uniform_size: 0,
        instances: 1,
    });
    models
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer goes before the window it
/// presents to.
struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer<VulkanBackend>>,
    triangle: Option<ModelHandle>,
    triangle_visible: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    surface: Option<Arc<WinitSurface>>,
    is_fullscreen: bool,

    start: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            triangle: None,
            triangle_visible: true,
            surface: None,
            is_fullscreen,
            start: Instant::now(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, surface: &WinitSurface) -> Result<()> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device + surface
        // ─────────────────────────────────────────────────────────────────────
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, surface)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swapchain + render targets for the configured graph
        // ─────────────────────────────────────────────────────────────────────
        let graph = Arc::new(RenderGraph::for_variant(self.config.graphics.pipeline));
        let (width, height) = surface.framebuffer_size();
        let backend = Arc::new(VulkanBackend::new(
            device,
            graph.clone(),
            self.config.get_present_mode(),
            self.config.graphics.clear_color,
            std::mem::size_of::<GlobalUniforms>(),
            width.max(1),
            height.max(1),
        )?);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Frame core, registry and loader thread
        // ─────────────────────────────────────────────────────────────────────
        let renderer = Renderer::new(backend, graph, &self.config, |core| {
            Ok(Arc::new(VulkanModelBuilder::new(core)) as Arc<dyn ModelBuilder>)
        })?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Queue the demo models; they appear once built
        // ─────────────────────────────────────────────────────────────────────
        for info in demo_models(self.config.graphics.pipeline) {
            let name = info.name.clone();
            let handle = renderer
                .new_model(info)
                .with_context(|| format!("Failed to queue model '{}'", name))?;
            log::info!("Queued model '{}' as {}", name, handle);
            if name == "triangle" {
                self.triangle = Some(handle);
            }
        }

        self.renderer = Some(renderer);
        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<FrameOutcome> {
        let (Some(renderer), Some(surface)) = (self.renderer.as_mut(), self.surface.as_ref()) else {
            return Ok(FrameOutcome::Skipped);
        };

        if surface.take_resized() {
            renderer.request_recreate();
        }
        let (width, height) = surface.framebuffer_size();
        let seconds = self.start.elapsed().as_secs_f32();
        let triangle = self.triangle;

        renderer.draw_frame(width, height, |frame| {
            let aspect = frame.aspect_ratio();
            let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
            // Vulkan clip space has Y pointing down
            proj.y_axis.y *= -1.0;
            let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.5), Vec3::ZERO, Vec3::Y);

            let globals = GlobalUniforms {
                view_proj: proj * view,
                time: Vec4::new(seconds, aspect, 0.0, 0.0),
            };
            frame.set_global(bytemuck::bytes_of(&globals));

            if let Some(handle) = triangle {
                let uniforms = TriangleUniforms {
                    model: Mat4::from_rotation_y(seconds),
                };
                frame.set_model(handle, bytemuck::bytes_of(&uniforms));
            }
        })
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(surface) = &self.surface {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                surface.window().set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                surface.window().set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            surface.notify_resized();
        }
    }

    fn toggle_triangle(&mut self) {
        let (Some(renderer), Some(handle)) = (&self.renderer, self.triangle) else {
            return;
        };
        self.triangle_visible = !self.triangle_visible;
        let instances = u32::from(self.triangle_visible);
        if let Err(e) = renderer.set_instances(handle, instances) {
            log::warn!("Failed to change triangle instances: {}", e);
        }
    }

    fn update_title(&self) {
        if !self.config.debug.show_fps {
            return;
        }
        let (Some(renderer), Some(surface)) = (&self.renderer, &self.surface) else {
            return;
        };
        if let Some(stats) = renderer.stats() {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            let memory = renderer.backend().device().memory_stats();
            surface.window().set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}] {} models, {:.1} MiB",
                self.config.window.title,
                stats.fps,
                stats.frame_time_ms,
                mode,
                renderer.registry().len(),
                memory.bytes as f64 / (1024.0 * 1024.0)
            ));
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.surface.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        let surface = Arc::new(WinitSurface::new(window));
        if let Err(e) = self.init_renderer(&surface) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }
        self.surface = Some(surface);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(surface) = &self.surface {
                    surface.notify_resized();
                    surface.window().request_redraw();
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(FrameOutcome::Skipped) => {
                    // Minimised: sleep until the next window event
                    event_loop.set_control_flow(ControlFlow::Wait);
                }
                Ok(outcome) => {
                    event_loop.set_control_flow(ControlFlow::Poll);
                    if outcome.presented() {
                        self.update_title();
                    }
                }
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::Space => self.toggle_triangle(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        let minimized = self.renderer.as_ref().is_some_and(|r| r.is_minimized());
        if let (false, Some(surface)) = (minimized, &self.surface) {
            surface.window().request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.shutdown() {
                log::error!("Renderer shutdown failed: {:#}", e);
            }
        }
        log::info!("Cleanup complete");
    }
}
