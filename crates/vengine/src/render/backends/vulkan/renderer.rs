//! Vulkan renderer facade
//!
//! [`VulkanRenderer`] owns the device and every component built on it, and
//! drives the frame protocol of [`RenderApi`]:
//!
//! 1. `begin` waits on the current slot's fence, recreates a stale swapchain,
//!    acquires an image, resets fence and command buffer and starts rendering
//! 2. `submit_geometry` records indexed draws
//! 3. `end` transitions the image for presentation and closes the command buffer
//! 4. `render` submits to the graphics queue
//! 5. `present` queues the image and advances the frame cursor
//!
//! A frame aborted in `begin` (out-of-date swapchain, minimized window) turns
//! the remaining calls of that frame into no-ops.

use ash::vk;

use crate::core::config::RendererConfig;
use crate::render::api::{BackendKind, ClearColor, RenderApi, VertexLayout, WindowSurface};
use crate::render::backends::gpu::{AcquireOutcome, GpuDevice, PresentOutcome};
use crate::render::backends::vulkan::rendering::commands::FrameAttachments;
use crate::render::backends::vulkan::{
    CommandSubmissionPipeline, DepthTarget, FrameSyncController, GraphicsPipeline,
    ImageStateTracker, IndexBuffer, ResourceFactory, ShaderBlob, SwapchainManager, SwapchainState,
    UniformRing, UploadCommands, VertexBuffer, VulkanContext, VulkanError, VulkanResult,
};
use crate::render::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePhase {
    Idle,
    Aborted,
    Recording,
    Recorded,
    Submitted,
}

/// Components under construction, torn down in reverse if a step fails
#[derive(Default)]
struct Parts {
    swapchain: Option<SwapchainManager>,
    uploads: Option<UploadCommands>,
    commands: Option<CommandSubmissionPipeline>,
    sync: Option<FrameSyncController>,
    depth: Option<DepthTarget>,
    uniforms: Option<UniformRing>,
    pipeline: Option<GraphicsPipeline>,
    tracker: ImageStateTracker,
}

impl Parts {
    fn build<D: GpuDevice>(
        &mut self,
        device: &D,
        config: &RendererConfig,
        shaders: (ShaderBlob, ShaderBlob),
    ) -> VulkanResult<()> {
        let frames = u32::try_from(config.frames_in_flight).map_err(|_| {
            VulkanError::InvalidOperation {
                reason: format!("Invalid frames in flight: {}", config.frames_in_flight),
            }
        })?;

        let swapchain = self
            .swapchain
            .insert(SwapchainManager::create(device, config.framebuffer_size)?);
        let uploads = self.uploads.insert(UploadCommands::new(device)?);
        let commands = self.commands.insert(CommandSubmissionPipeline::new(device, frames)?);
        self.sync = Some(FrameSyncController::new(device, commands.command_buffers())?);
        let depth = DepthTarget::create(device, uploads, &mut self.tracker, swapchain.extent())?;
        self.depth = Some(depth);

        if let Some(size) = config.uniform_buffer_size {
            let factory = ResourceFactory::new(device, uploads);
            let ring = UniformRing::create(device, &factory, config.frames_in_flight, size)?;
            self.uniforms = Some(ring);
        }

        let set_layouts = self
            .uniforms
            .as_ref()
            .map(|ring| vec![ring.set_layout()])
            .unwrap_or_default();
        self.pipeline = Some(GraphicsPipeline::create(
            device,
            shaders,
            VertexLayout::new(&config.vertex_layout),
            set_layouts,
            swapchain.format(),
            DepthTarget::FORMAT,
        )?);

        Ok(())
    }

    fn unwind<D: GpuDevice>(mut self, device: &D) {
        if let Err(e) = device.wait_idle() {
            log::warn!("Device did not go idle during teardown: {}", e);
        }
        if let (Some(mut ring), Some(uploads)) = (self.uniforms.take(), self.uploads.as_ref()) {
            ring.destroy(device, &ResourceFactory::new(device, uploads));
        }
        if let Some(mut sync) = self.sync.take() {
            sync.destroy(device);
        }
        if let Some(mut commands) = self.commands.take() {
            commands.destroy(device);
        }
        if let Some(mut uploads) = self.uploads.take() {
            uploads.destroy(device);
        }
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.destroy(device);
        }
        if let Some(mut depth) = self.depth.take() {
            depth.destroy(device, &mut self.tracker);
        }
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(device);
        }
    }
}

/// The render facade: device, swapchain, frame pacing, command recording and
/// resources behind the [`RenderApi`] frame protocol
pub struct VulkanRenderer<D: GpuDevice = VulkanContext> {
    device: D,
    swapchain: SwapchainManager,
    sync: FrameSyncController,
    commands: CommandSubmissionPipeline,
    uploads: UploadCommands,
    tracker: ImageStateTracker,
    depth: DepthTarget,
    pipeline: GraphicsPipeline,
    uniforms: Option<UniformRing>,
    phase: FramePhase,
    active_image: Option<u32>,
    recreate_after_present: bool,
    terminated: bool,
}

impl VulkanRenderer<VulkanContext> {
    /// Create the Vulkan context for `window` and everything built on it
    pub fn init(mut config: RendererConfig, window: &dyn WindowSurface) -> RenderResult<Self> {
        config.validate()?;
        config.framebuffer_size = initial_framebuffer_size(window, config.framebuffer_size);
        let shaders = ShaderBlob::load_pair(&config.shaders)?;
        let device = VulkanContext::new(&config, window)?;
        Self::assemble(device, &config, shaders)
    }
}

/// The window's framebuffer size, or `configured` while the window reports
/// nothing to draw into
fn initial_framebuffer_size(window: &dyn WindowSurface, configured: (u32, u32)) -> (u32, u32) {
    match window.framebuffer_size() {
        (0, _) | (_, 0) => configured,
        size => {
            if size != configured {
                log::debug!(
                    "Window framebuffer {:?} overrides configured size {:?}",
                    size,
                    configured
                );
            }
            size
        }
    }
}

impl<D: GpuDevice> VulkanRenderer<D> {
    /// Build the renderer on an already created device
    pub fn with_device(device: D, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        let shaders = ShaderBlob::load_pair(&config.shaders)?;
        Self::assemble(device, &config, shaders)
    }

    fn assemble(
        mut device: D,
        config: &RendererConfig,
        shaders: (ShaderBlob, ShaderBlob),
    ) -> RenderResult<Self> {
        let mut parts = Parts::default();
        if let Err(e) = parts.build(&device, config, shaders) {
            log::error!("Renderer initialization failed: {}", e);
            parts.unwind(&device);
            device.shutdown();
            return Err(e.into());
        }

        let Parts {
            swapchain: Some(swapchain),
            uploads: Some(uploads),
            commands: Some(commands),
            sync: Some(sync),
            depth: Some(depth),
            pipeline: Some(pipeline),
            uniforms,
            tracker,
        } = parts
        else {
            device.shutdown();
            return Err(RenderError::InitializationFailed(
                "Renderer components incomplete".to_string(),
            ));
        };

        let extent = swapchain.extent();
        log::info!(
            "Renderer '{}' initialized: {} frames in flight, {}x{}",
            config.name,
            sync.frames_in_flight(),
            extent.width,
            extent.height
        );

        Ok(Self {
            device,
            swapchain,
            sync,
            commands,
            uploads,
            tracker,
            depth,
            pipeline,
            uniforms,
            phase: FramePhase::Idle,
            active_image: None,
            recreate_after_present: false,
            terminated: false,
        })
    }

    fn ensure_alive(&self) -> RenderResult<()> {
        if self.terminated {
            return Err(RenderError::RenderingFailed("Renderer has been terminated".to_string()));
        }
        Ok(())
    }

    fn abort_frame(&mut self, reason: &str) {
        log::debug!("Frame {} aborted: {}", self.sync.frames_presented(), reason);
        self.sync.abort();
        self.commands.discard();
        self.active_image = None;
        self.phase = FramePhase::Aborted;
    }

    /// Rebuild swapchain, depth target and (on a format change) pipeline.
    /// Deferred while the framebuffer or the surface has zero area.
    fn recreate_swapchain(&mut self) -> VulkanResult<bool> {
        if self.swapchain.is_minimized() {
            log::debug!("Deferring swapchain recreation while minimized");
            return Ok(false);
        }

        let old_images = self.swapchain.state().images.clone();
        if !self.swapchain.recreate(&self.device)? {
            return Ok(false);
        }
        for image in old_images {
            self.tracker.forget(image);
        }

        self.depth
            .recreate(&self.device, &self.uploads, &mut self.tracker, self.swapchain.extent())?;
        self.pipeline.recreate_for_format(&self.device, self.swapchain.format())?;

        let extent = self.swapchain.extent();
        log::debug!("Swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(true)
    }

    /// Write `data` into the current frame slot's uniform block; call after `begin`
    pub fn update_uniform_data(&mut self, data: &[u8]) -> RenderResult<()> {
        self.ensure_alive()?;
        let ring = self.uniforms.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Renderer was configured without a uniform buffer".to_string(),
        })?;
        let factory = ResourceFactory::new(&self.device, &self.uploads);
        ring.update(&factory, self.sync.frame_index(), data)?;
        Ok(())
    }

    /// Frame cursor, always below the number of frames in flight
    pub const fn frame_index(&self) -> usize {
        self.sync.frame_index()
    }

    /// Number of frames that reached `present`
    pub const fn frames_presented(&self) -> u64 {
        self.sync.frames_presented()
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    /// Current swapchain extent
    pub const fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Current swapchain state
    pub const fn swapchain_state(&self) -> &SwapchainState {
        self.swapchain.state()
    }

    /// Whether the last `begin` aborted its frame
    pub fn frame_aborted(&self) -> bool {
        self.phase == FramePhase::Aborted
    }

    /// The device everything is built on
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Whether `terminate` already ran
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<D: GpuDevice> RenderApi for VulkanRenderer<D> {
    type VertexBuffer = VertexBuffer;
    type IndexBuffer = IndexBuffer;
    type ResourceFactory<'a> = ResourceFactory<'a, D> where Self: 'a;

    fn backend(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn begin(&mut self, clear: ClearColor) -> RenderResult<()> {
        self.ensure_alive()?;
        if !matches!(self.phase, FramePhase::Idle | FramePhase::Aborted) {
            return Err(RenderError::RenderingFailed(
                "begin called while a frame is in progress".to_string(),
            ));
        }

        self.sync.wait_current(&self.device)?;

        if self.swapchain.is_stale() && !self.recreate_swapchain()? {
            self.abort_frame("framebuffer has zero area");
            return Ok(());
        }

        let image_index = match self.sync.acquire(&self.device, self.swapchain.handle())? {
            AcquireOutcome::OutOfDate => {
                self.swapchain.mark_stale();
                self.recreate_swapchain()?;
                self.abort_frame("swapchain out of date");
                return Ok(());
            }
            AcquireOutcome::Acquired { image_index, suboptimal } => {
                if suboptimal {
                    self.swapchain.mark_stale();
                    self.recreate_after_present = true;
                }
                image_index
            }
        };

        let (Some(color_image), Some(color_view)) =
            (self.swapchain.image(image_index), self.swapchain.image_view(image_index))
        else {
            return Err(RenderError::RenderingFailed(format!(
                "Acquired image {image_index} does not exist"
            )));
        };

        let command_buffer = self.sync.begin_recording(&self.device)?;
        let attachments = FrameAttachments {
            color_image,
            color_view,
            depth: self.depth.image().zip(self.depth.view()),
            extent: self.swapchain.extent(),
        };
        self.commands
            .begin(&self.device, command_buffer, &mut self.tracker, &attachments, clear.0);

        self.active_image = Some(image_index);
        self.phase = FramePhase::Recording;
        Ok(())
    }

    fn submit_geometry(
        &mut self,
        vertex_buffer: &VertexBuffer,
        index_buffer: &IndexBuffer,
    ) -> RenderResult<()> {
        match self.phase {
            FramePhase::Aborted => Ok(()),
            FramePhase::Recording => {
                let descriptor_set = self
                    .uniforms
                    .as_ref()
                    .and_then(|ring| ring.descriptor_set(self.sync.frame_index()));
                self.commands.submit_geometry(
                    &self.device,
                    &self.pipeline,
                    descriptor_set,
                    vertex_buffer,
                    index_buffer,
                )?;
                Ok(())
            }
            _ => Err(RenderError::RenderingFailed("submit_geometry outside begin/end".to_string())),
        }
    }

    fn end(&mut self) -> RenderResult<()> {
        match self.phase {
            FramePhase::Aborted => Ok(()),
            FramePhase::Recording => {
                self.commands.end(&self.device, &mut self.tracker)?;
                self.phase = FramePhase::Recorded;
                Ok(())
            }
            _ => Err(RenderError::RenderingFailed("end without begin".to_string())),
        }
    }

    fn render(&mut self) -> RenderResult<()> {
        match self.phase {
            FramePhase::Aborted => Ok(()),
            FramePhase::Recorded => {
                self.sync.submit(&self.device)?;
                self.phase = FramePhase::Submitted;
                Ok(())
            }
            _ => Err(RenderError::RenderingFailed("render before end".to_string())),
        }
    }

    fn present(&mut self) -> RenderResult<()> {
        match self.phase {
            FramePhase::Aborted => return Ok(()),
            FramePhase::Submitted => {}
            _ => return Err(RenderError::RenderingFailed("present before render".to_string())),
        }

        let image_index = self
            .active_image
            .take()
            .ok_or_else(|| {
                RenderError::RenderingFailed("No acquired image to present".to_string())
            })?;
        self.phase = FramePhase::Idle;

        let outcome = self.sync.present(&self.device, self.swapchain.handle(), image_index)?;
        let recreate = std::mem::take(&mut self.recreate_after_present)
            | (outcome != PresentOutcome::Presented);
        if recreate {
            log::trace!("Present returned {:?}, recreating swapchain", outcome);
            self.swapchain.mark_stale();
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> RenderResult<()> {
        self.ensure_alive()?;
        self.device.wait_idle()?;
        Ok(())
    }

    fn frame_buffer_resize(&mut self, width: u32, height: u32) {
        log::debug!("Framebuffer resized to {}x{}", width, height);
        self.swapchain.set_framebuffer_size(width, height);
    }

    fn resource_factory(&self) -> ResourceFactory<'_, D> {
        ResourceFactory::new(&self.device, &self.uploads)
    }

    fn terminate(&mut self) -> RenderResult<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        let idle = self.device.wait_idle();
        if let Some(mut ring) = self.uniforms.take() {
            ring.destroy(&self.device, &ResourceFactory::new(&self.device, &self.uploads));
        }
        self.sync.destroy(&self.device);
        self.commands.destroy(&self.device);
        self.uploads.destroy(&self.device);
        self.pipeline.destroy(&self.device);
        self.depth.destroy(&self.device, &mut self.tracker);
        self.swapchain.destroy(&self.device);
        self.device.shutdown();

        log::info!("Renderer terminated after {} frames", self.sync.frames_presented());
        idle.map_err(RenderError::from)
    }
}

impl<D: GpuDevice> Drop for VulkanRenderer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log::error!("Renderer teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ShaderConfig;
    use crate::render::api::{BufferUsage, IndexBufferDesc, VertexBufferDesc};
    use crate::render::backends::mock::{Call, ObjectKind, RecordingDevice};

    fn shader_config(tag: &str) -> ShaderConfig {
        let dir = std::env::temp_dir().join(format!("vengine_renderer_{tag}"));
        std::fs::create_dir_all(&dir).unwrap();
        let spirv: Vec<u8> =
            [0x0723_0203u32, 0x0001_0000].iter().flat_map(|w| w.to_le_bytes()).collect();
        let vert = dir.join("vert.spv");
        let frag = dir.join("frag.spv");
        std::fs::write(&vert, &spirv).unwrap();
        std::fs::write(&frag, &spirv).unwrap();
        ShaderConfig::new(vert.to_string_lossy(), frag.to_string_lossy())
    }

    struct FixedWindow((u32, u32));

    impl WindowSurface for FixedWindow {
        fn required_instance_extensions(&self) -> VulkanResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn create_surface(
            &self,
            _: &ash::Entry,
            _: &ash::Instance,
        ) -> VulkanResult<vk::SurfaceKHR> {
            Ok(vk::SurfaceKHR::null())
        }

        fn framebuffer_size(&self) -> (u32, u32) {
            self.0
        }
    }

    #[test]
    fn test_window_size_seeds_the_swapchain() {
        assert_eq!(initial_framebuffer_size(&FixedWindow((1920, 1080)), (800, 600)), (1920, 1080));
        assert_eq!(initial_framebuffer_size(&FixedWindow((0, 0)), (800, 600)), (800, 600));
        assert_eq!(initial_framebuffer_size(&FixedWindow((1024, 0)), (800, 600)), (800, 600));
    }

    fn renderer(tag: &str) -> VulkanRenderer<RecordingDevice> {
        let config = RendererConfig::new("test")
            .with_validation(false)
            .with_shaders(shader_config(tag))
            .with_uniform_buffer(64);
        VulkanRenderer::with_device(RecordingDevice::new(), config).unwrap()
    }

    #[test]
    fn test_phase_violations_are_errors() {
        let mut renderer = renderer("phase");
        assert!(renderer.end().is_err());
        assert!(renderer.render().is_err());
        assert!(renderer.present().is_err());

        renderer.begin(ClearColor::default()).unwrap();
        assert!(renderer.begin(ClearColor::default()).is_err());
    }

    #[test]
    fn test_uniform_update_targets_current_slot() {
        let mut renderer = renderer("uniforms");
        renderer.begin(ClearColor::default()).unwrap();
        renderer.update_uniform_data(&[3; 64]).unwrap();

        let ring = renderer.uniforms.as_ref().unwrap();
        let factory = renderer.resource_factory();
        assert_eq!(factory.read_back(ring.buffer(0).unwrap()).unwrap(), vec![3; 64]);
        assert!(factory.read_back(ring.buffer(1).unwrap()).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_draw_binds_uniform_set() {
        let mut renderer = renderer("draw");
        let factory = renderer.resource_factory();
        let vb = factory
            .create_vertex_buffer(&VertexBufferDesc::from_slice(
                &[[0.0f32; 6]; 3],
                BufferUsage::Static,
            ))
            .unwrap();
        let ib = factory
            .create_index_buffer(&IndexBufferDesc::from_u16(&[0, 1, 2], BufferUsage::Static))
            .unwrap();

        renderer.begin(ClearColor::default()).unwrap();
        renderer.submit_geometry(&vb, &ib).unwrap();
        renderer.end().unwrap();

        let device = renderer.device();
        assert_eq!(device.count_calls(|call| matches!(call, Call::BindDescriptorSet(_))), 1);
        assert_eq!(device.count_calls(|call| matches!(call, Call::DrawIndexed(3))), 1);
        assert_eq!(
            device.count_calls(|call| {
                matches!(call, Call::BindIndexBuffer(_, vk::IndexType::UINT16))
            }),
            1
        );
    }

    #[test]
    fn test_terminate_releases_everything_once() {
        let mut renderer = renderer("terminate");
        renderer.terminate().unwrap();
        renderer.terminate().unwrap();

        let device = renderer.device();
        assert!(device.is_shut_down());
        for kind in [
            ObjectKind::Semaphore,
            ObjectKind::Fence,
            ObjectKind::CommandPool,
            ObjectKind::Swapchain,
            ObjectKind::ImageView,
            ObjectKind::Image,
            ObjectKind::Buffer,
            ObjectKind::Pipeline,
            ObjectKind::DescriptorPool,
            ObjectKind::DescriptorSetLayout,
        ] {
            assert_eq!(device.live(kind), 0, "{kind:?} still alive");
        }
        assert_eq!(device.count_calls(|call| matches!(call, Call::Shutdown)), 1);
        assert!(renderer.begin(ClearColor::default()).is_err());
    }
}
