// Headless GPU + counting model builder for unit tests
//
// The headless backend simulates fences (a submitted fence signals as soon
// as someone waits on it), cycles through swapchain images, can be told to
// report out-of-date on chosen acquire/present calls, and logs every call
// so tests can check ordering. Fence calls record a violation when two
// threads are inside them for the same fence at once.

use anyhow::Result;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::assets::LoadSource;
use crate::gpu::{
    AcquireOutcome, CommandRecorder, GpuBackend, PresentOutcome, SlotObjects, SwapchainInfo,
};
use crate::model::{MeshSource, ModelBuilder, ModelInfo, ModelResources, VertexLayout};
use crate::uniform::UniformBuffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WaitFence(u64),
    ResetFence(u64),
    ResetPool(u64),
    Submit { cmd: u64, fence: u64 },
    Acquire(u32),
    AcquireStale,
    Present(u32),
    PresentStale(u32),
    BeginPass { pass: usize, image: u32 },
    NextSubpass,
    EndPass,
    BindPipeline(u64),
    BindDescriptorSet(u64),
    Draw { count: u32, instances: u32 },
    DrawIndexed { count: u32, instances: u32 },
    GlobalUniform { image: usize, len: usize },
    WaitIdle,
    Recreate { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    Submitted,
}

pub struct HeadlessBackend {
    next_handle: AtomicU64,
    image_count: Mutex<usize>,
    extent: Mutex<vk::Extent2D>,
    next_image: AtomicUsize,
    fences: Mutex<HashMap<u64, FenceState>>,
    busy_fences: Mutex<HashSet<u64>>,
    fence_dwell: Mutex<Duration>,
    pool_fences: Mutex<HashMap<u64, u64>>,
    events: Mutex<Vec<Event>>,
    violations: Mutex<Vec<String>>,
    acquire_calls: AtomicU64,
    present_calls: AtomicU64,
    stale_acquires: Mutex<HashSet<u64>>,
    stale_presents: Mutex<HashSet<u64>>,
    queue: Mutex<()>,
    queue_holders: AtomicUsize,
    destroyed_slots: AtomicUsize,
}

impl HeadlessBackend {
    pub fn new(image_count: usize) -> Self {
        Self {
            next_handle: AtomicU64::new(1000),
            image_count: Mutex::new(image_count),
            extent: Mutex::new(vk::Extent2D {
                width: 800,
                height: 600,
            }),
            next_image: AtomicUsize::new(0),
            fences: Mutex::new(HashMap::new()),
            busy_fences: Mutex::new(HashSet::new()),
            fence_dwell: Mutex::new(Duration::ZERO),
            pool_fences: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
            acquire_calls: AtomicU64::new(0),
            present_calls: AtomicU64::new(0),
            stale_acquires: Mutex::new(HashSet::new()),
            stale_presents: Mutex::new(HashSet::new()),
            queue: Mutex::new(()),
            queue_holders: AtomicUsize::new(0),
            destroyed_slots: AtomicUsize::new(0),
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn log(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn violation(&self, message: String) {
        self.violations.lock().push(message);
    }

    /// Make the n-th acquire call (1-based) report out-of-date
    pub fn fail_acquire(&self, call: u64) {
        self.stale_acquires.lock().insert(call);
    }

    /// Make the n-th present call (1-based) report out-of-date
    pub fn fail_present(&self, call: u64) {
        self.stale_presents.lock().insert(call);
    }

    /// Stay inside every fence call this long, widening race windows
    pub fn set_fence_dwell(&self, dwell: Duration) {
        *self.fence_dwell.lock() = dwell;
    }

    /// Run `f` as the only user of `raw`
    fn touch_fence<R>(&self, raw: u64, f: impl FnOnce() -> R) -> R {
        if !self.busy_fences.lock().insert(raw) {
            self.violation(format!("fence {} used by two threads at once", raw));
        }
        let dwell = *self.fence_dwell.lock();
        if !dwell.is_zero() {
            std::thread::sleep(dwell);
        }
        let result = f();
        self.busy_fences.lock().remove(&raw);
        result
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }

    pub fn presented(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Present(_)))
            .count()
    }

    pub fn destroyed_slots(&self) -> usize {
        self.destroyed_slots.load(Ordering::Relaxed)
    }

    fn with_queue<R>(&self, f: impl FnOnce() -> R) -> R {
        let _queue = self.queue.lock();
        if self.queue_holders.fetch_add(1, Ordering::SeqCst) != 0 {
            self.violation("two threads inside the queue at once".to_string());
        }
        let result = f();
        self.queue_holders.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl GpuBackend for HeadlessBackend {
    fn create_slot(&self) -> Result<SlotObjects> {
        let objects = SlotObjects {
            command_pool: vk::CommandPool::from_raw(self.handle()),
            command_buffer: vk::CommandBuffer::from_raw(self.handle()),
            image_available: vk::Semaphore::from_raw(self.handle()),
            render_finished: vk::Semaphore::from_raw(self.handle()),
            in_flight: vk::Fence::from_raw(self.handle()),
        };
        self.fences
            .lock()
            .insert(objects.in_flight.as_raw(), FenceState::Signaled);
        self.pool_fences.lock().insert(
            objects.command_pool.as_raw(),
            objects.in_flight.as_raw(),
        );
        Ok(objects)
    }

    fn destroy_slot(&self, slot: &SlotObjects) {
        self.fences.lock().remove(&slot.in_flight.as_raw());
        self.destroyed_slots.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        let raw = fence.as_raw();
        self.log(Event::WaitFence(raw));
        self.touch_fence(raw, || {
            let mut fences = self.fences.lock();
            match fences.get(&raw).copied() {
                Some(FenceState::Submitted) | Some(FenceState::Signaled) => {
                    fences.insert(raw, FenceState::Signaled);
                    Ok(())
                }
                Some(FenceState::Unsignaled) => {
                    anyhow::bail!("waiting on fence {} that was reset but never submitted", raw)
                }
                None => anyhow::bail!("unknown fence {}", raw),
            }
        })
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let raw = fence.as_raw();
        self.log(Event::ResetFence(raw));
        self.touch_fence(raw, || {
            let mut fences = self.fences.lock();
            if fences.get(&raw) == Some(&FenceState::Submitted) {
                self.violation(format!("fence {} reset while in flight", raw));
            }
            fences.insert(raw, FenceState::Unsignaled);
        });
        Ok(())
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        let raw = pool.as_raw();
        self.log(Event::ResetPool(raw));
        if let Some(fence) = self.pool_fences.lock().get(&raw) {
            if self.fences.lock().get(fence) == Some(&FenceState::Submitted) {
                self.violation(format!("pool {} reset while its fence is in flight", raw));
            }
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        Ok(vk::CommandBuffer::from_raw(self.handle()))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, _cmd: vk::CommandBuffer) {}

    fn begin_commands(&self, _cmd: vk::CommandBuffer, _one_time: bool) -> Result<()> {
        Ok(())
    }

    fn end_commands(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn recorder(&self, _cmd: vk::CommandBuffer) -> Box<dyn CommandRecorder + '_> {
        Box::new(HeadlessRecorder { backend: self })
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        _wait: Option<vk::Semaphore>,
        _signal: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> Result<()> {
        self.with_queue(|| {
            let raw = fence.as_raw();
            self.log(Event::Submit {
                cmd: cmd.as_raw(),
                fence: raw,
            });
            self.touch_fence(raw, || {
                let mut fences = self.fences.lock();
                if fences.get(&raw) != Some(&FenceState::Unsignaled) {
                    self.violation(format!("submit with fence {} not reset", raw));
                }
                fences.insert(raw, FenceState::Submitted);
            });
            Ok(())
        })
    }

    fn acquire_next_image(&self, _signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let call = self.acquire_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stale_acquires.lock().contains(&call) {
            self.log(Event::AcquireStale);
            return Ok(AcquireOutcome::OutOfDate);
        }
        let count = (*self.image_count.lock()).max(1);
        let image_index = (self.next_image.fetch_add(1, Ordering::SeqCst) % count) as u32;
        self.log(Event::Acquire(image_index));
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn present(&self, image_index: u32, _wait: vk::Semaphore) -> Result<PresentOutcome> {
        self.with_queue(|| {
            let call = self.present_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.stale_presents.lock().contains(&call) {
                self.log(Event::PresentStale(image_index));
                return Ok(PresentOutcome::OutOfDate);
            }
            self.log(Event::Present(image_index));
            Ok(PresentOutcome::Presented)
        })
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        SwapchainInfo {
            image_count: *self.image_count.lock(),
            extent: *self.extent.lock(),
        }
    }

    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<SwapchainInfo> {
        self.log(Event::Recreate { width, height });
        *self.extent.lock() = vk::Extent2D { width, height };
        self.next_image.store(0, Ordering::SeqCst);
        Ok(self.swapchain_info())
    }

    fn write_global_uniform(&self, image_index: usize, data: &[u8]) -> Result<()> {
        self.log(Event::GlobalUniform {
            image: image_index,
            len: data.len(),
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.with_queue(|| {
            self.log(Event::WaitIdle);
            let mut fences = self.fences.lock();
            for state in fences.values_mut() {
                if *state == FenceState::Submitted {
                    *state = FenceState::Signaled;
                }
            }
            Ok(())
        })
    }
}

struct HeadlessRecorder<'a> {
    backend: &'a HeadlessBackend,
}

impl CommandRecorder for HeadlessRecorder<'_> {
    fn begin_render_pass(&mut self, pass: usize, image_index: u32) {
        self.backend.log(Event::BeginPass {
            pass,
            image: image_index,
        });
    }

    fn next_subpass(&mut self) {
        self.backend.log(Event::NextSubpass);
    }

    fn end_render_pass(&mut self) {
        self.backend.log(Event::EndPass);
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.backend.log(Event::BindPipeline(pipeline.as_raw()));
    }

    fn bind_vertex_buffers(&mut self, _buffers: &[vk::Buffer]) {}

    fn bind_index_buffer(&mut self, _buffer: vk::Buffer) {}

    fn bind_descriptor_set(&mut self, _layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        self.backend.log(Event::BindDescriptorSet(set.as_raw()));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.backend.log(Event::Draw {
            count: vertex_count,
            instances: instance_count,
        });
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        self.backend.log(Event::DrawIndexed {
            count: index_count,
            instances: instance_count,
        });
    }
}

/// Model builder producing fake handles and counting calls
pub struct CountingBuilder {
    next_handle: AtomicU64,
    constructed: AtomicUsize,
    destroyed: AtomicUsize,
    recreated: AtomicUsize,
    fail_next: AtomicBool,
    delay: Mutex<Duration>,
    images: usize,
}

impl Default for CountingBuilder {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            constructed: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            recreated: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            images: 3,
        }
    }
}

impl CountingBuilder {
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn recreated(&self) -> usize {
        self.recreated.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl ModelBuilder for CountingBuilder {
    fn construct(&self, info: &ModelInfo) -> Result<ModelResources> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("simulated construction failure for '{}'", info.name);
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.constructed.fetch_add(1, Ordering::SeqCst);

        let uniforms =
            (info.uniform_size > 0).then(|| UniformBuffer::host(info.uniform_size, 256, self.images));
        Ok(ModelResources {
            pipeline: vk::Pipeline::from_raw(self.handle()),
            pipeline_layout: vk::PipelineLayout::from_raw(self.handle()),
            vertex_buffers: vec![vk::Buffer::from_raw(self.handle())],
            index_buffer: None,
            element_count: 3,
            descriptor_sets: (0..self.images)
                .map(|_| vk::DescriptorSet::from_raw(self.handle()))
                .collect(),
            uniforms,
            ..Default::default()
        })
    }

    fn recreate(&self, _info: &ModelInfo, resources: &mut ModelResources) -> Result<()> {
        self.recreated.fetch_add(1, Ordering::SeqCst);
        resources.pipeline = vk::Pipeline::from_raw(self.handle());
        Ok(())
    }

    fn destroy(&self, _resources: ModelResources) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A single-triangle model placed at (pass, subpass)
pub fn triangle_info(pass: usize, subpass: usize) -> ModelInfo {
    let vertices: [f32; 18] = [
        0.0, -0.5, 0.0, 1.0, 0.0, 0.0, //
        0.5, 0.5, 0.0, 0.0, 1.0, 0.0, //
        -0.5, 0.5, 0.0, 0.0, 0.0, 1.0,
    ];
    let spirv: Vec<u8> = [0x0723_0203u32, 0x0001_0000]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    ModelInfo {
        name: "triangle".to_string(),
        pass,
        subpass,
        mesh: MeshSource {
            vertices: LoadSource::buffer(bytemuck::cast_slice::<f32, u8>(&vertices).to_vec()),
            indices: None,
            layout: VertexLayout::new(vec![
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
            ]),
        },
        vertex_shader: LoadSource::buffer(spirv.clone()),
        fragment_shader: LoadSource::buffer(spirv),
        textures: Vec::new(),
        uniform_size: 64,
        instances: 1,
    }
}
