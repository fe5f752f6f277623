//! Headless Vulkan capture device
//!
//! Owns a BGRA render target that a renderer draws into, and copies it into host visible
//! staging buffers with one fence per copy. Nothing waits on the render thread; the readback
//! worker waits on the fences.

use std::sync::Arc;
use std::time::Duration;

use vulkano::{
    buffer::{Buffer, BufferCreateInfo, BufferReadGuard, BufferUsage, Subbuffer},
    command_buffer::{
        allocator::StandardCommandBufferAllocator, AutoCommandBufferBuilder, ClearColorImageInfo,
        CommandBufferExecFuture, CommandBufferUsage, CopyImageToBufferInfo, PrimaryAutoCommandBuffer,
    },
    device::{
        physical::PhysicalDeviceType, Device, DeviceCreateInfo, DeviceExtensions, DeviceFeatures,
        Queue, QueueCreateInfo, QueueFlags,
    },
    format::{ClearColorValue, Format},
    image::{view::ImageView, Image, ImageCreateInfo, ImageUsage},
    instance::{Instance, InstanceCreateInfo},
    memory::allocator::{AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator},
    sync::{
        self,
        future::{FenceSignalFuture, NowFuture},
        GpuFuture,
    },
    Validated, VulkanError, VulkanLibrary,
};

use super::pixel_format::PixelFormat;
use super::readback::{CaptureLayout, CompletionFence, ReadbackBuffer, ReadbackDevice};
use crate::error::CaptureError;

const RENDER_FORMAT: Format = Format::B8G8R8A8_UNORM;

pub struct VulkanReadback {
    device: Arc<Device>,
    queue: Arc<Queue>,
    allocator: Arc<StandardMemoryAllocator>,
    cb_allocator: Arc<StandardCommandBufferAllocator>,
    render_image: Arc<ImageView>,
    clear_color: [f32; 4],
    width: u32,
    height: u32,
}

impl VulkanReadback {
    /// Pick the best GPU with a graphics queue and create a `width`x`height` render target
    pub fn new(width: u32, height: u32) -> Result<Self, CaptureError> {
        let setup = |e: String| CaptureError::Allocation(e);

        let library =
            VulkanLibrary::new().map_err(|e| setup(format!("failed to load Vulkan library: {e}")))?;
        let instance = Instance::new(library, InstanceCreateInfo::default())
            .map_err(|e| setup(format!("failed to create Vulkan instance: {e}")))?;

        let (physical_device, queue_family_index) = instance
            .enumerate_physical_devices()
            .map_err(|e| setup(format!("failed to enumerate physical devices: {e}")))?
            .filter_map(|p| {
                p.queue_family_properties()
                    .iter()
                    .position(|q| q.queue_flags.contains(QueueFlags::GRAPHICS))
                    .map(|i| (p, i as u32))
            })
            .min_by_key(|(p, _)| match p.properties().device_type {
                PhysicalDeviceType::DiscreteGpu => 0,
                PhysicalDeviceType::IntegratedGpu => 1,
                PhysicalDeviceType::VirtualGpu => 2,
                PhysicalDeviceType::Cpu => 3,
                PhysicalDeviceType::Other => 4,
                _ => 5,
            })
            .ok_or_else(|| setup("no GPU with a graphics queue found".into()))?;

        tracing::info!(
            device = %physical_device.properties().device_name,
            kind = ?physical_device.properties().device_type,
            "using capture device"
        );

        let (device, mut queues) = Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions: DeviceExtensions::empty(),
                enabled_features: DeviceFeatures::empty(),
                queue_create_infos: vec![QueueCreateInfo {
                    queue_family_index,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .map_err(|e| setup(format!("failed to create device: {e}")))?;
        let queue = queues
            .next()
            .ok_or_else(|| setup("no queue available".into()))?;

        let allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
        let cb_allocator = Arc::new(StandardCommandBufferAllocator::new(
            device.clone(),
            Default::default(),
        ));

        let render_image = ImageView::new_default(
            Image::new(
                allocator.clone(),
                ImageCreateInfo {
                    extent: [width, height, 1],
                    format: RENDER_FORMAT,
                    usage: ImageUsage::COLOR_ATTACHMENT
                        | ImageUsage::TRANSFER_SRC
                        | ImageUsage::TRANSFER_DST,
                    ..Default::default()
                },
                Default::default(),
            )
            .map_err(|e| setup(format!("failed to create render image: {e}")))?,
        )
        .map_err(|e| setup(format!("failed to create render image view: {e}")))?;

        Ok(Self {
            device,
            queue,
            allocator,
            cb_allocator,
            render_image,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            width,
            height,
        })
    }

    /// Color the render target is cleared to at the start of each frame
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn memory_allocator(&self) -> &Arc<StandardMemoryAllocator> {
        &self.allocator
    }

    pub fn command_buffer_allocator(&self) -> &Arc<StandardCommandBufferAllocator> {
        &self.cb_allocator
    }

    /// Image renderers draw into
    pub fn render_image(&self) -> &Arc<ImageView> {
        &self.render_image
    }

    fn builder(&self) -> Result<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>, CaptureError> {
        AutoCommandBufferBuilder::primary(
            self.cb_allocator.clone(),
            self.queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )
        .map_err(|e| CaptureError::Submit(format!("failed to create command buffer: {e}")))
    }
}

pub struct VulkanBuffer {
    staging: Subbuffer<[u8]>,
}

impl ReadbackBuffer for VulkanBuffer {
    type View<'a> = BufferReadGuard<'a, [u8]>;

    fn len(&self) -> usize {
        self.staging.len() as usize
    }

    fn map(&self) -> Result<BufferReadGuard<'_, [u8]>, CaptureError> {
        self.staging
            .read()
            .map_err(|e| CaptureError::Map(e.to_string()))
    }
}

type CopyFuture = FenceSignalFuture<CommandBufferExecFuture<NowFuture>>;

pub struct VulkanFence {
    future: CopyFuture,
}

impl CompletionFence for VulkanFence {
    fn is_signaled(&self) -> Result<bool, CaptureError> {
        self.future
            .is_signaled()
            .map_err(|e| CaptureError::Fence(e.to_string()))
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool, CaptureError> {
        match self.future.wait(timeout) {
            Ok(()) => Ok(true),
            Err(Validated::Error(VulkanError::Timeout)) => Ok(false),
            Err(e) => Err(CaptureError::Fence(e.to_string())),
        }
    }
}

impl ReadbackDevice for VulkanReadback {
    type Buffer = VulkanBuffer;
    type Fence = VulkanFence;

    fn layout(&self) -> CaptureLayout {
        CaptureLayout {
            width: self.width,
            height: self.height,
            format: PixelFormat::Bgra,
            bottom_up: false,
        }
    }

    fn allocate(&mut self, len: usize) -> Result<VulkanBuffer, CaptureError> {
        let staging = Buffer::new_slice::<u8>(
            self.allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::TRANSFER_DST,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::HOST_RANDOM_ACCESS,
                ..Default::default()
            },
            len as u64,
        )
        .map_err(|e| CaptureError::Allocation(e.to_string()))?;
        Ok(VulkanBuffer { staging })
    }

    fn begin_frame(&mut self) -> Result<(), CaptureError> {
        let mut builder = self.builder()?;
        builder
            .clear_color_image(ClearColorImageInfo {
                clear_value: ClearColorValue::Float(self.clear_color),
                ..ClearColorImageInfo::image(self.render_image.image().clone())
            })
            .map_err(|e| CaptureError::Submit(format!("failed to clear render image: {e}")))?;
        let command_buffer = builder
            .build()
            .map_err(|e| CaptureError::Submit(format!("failed to build command buffer: {e}")))?;
        sync::now(self.device.clone())
            .then_execute(self.queue.clone(), command_buffer)
            .map_err(|e| CaptureError::Submit(e.to_string()))?
            .flush()
            .map_err(|e| CaptureError::Submit(e.to_string()))
    }

    fn capture_into(&mut self, target: &VulkanBuffer) -> Result<VulkanFence, CaptureError> {
        let mut builder = self.builder()?;
        builder
            .copy_image_to_buffer(CopyImageToBufferInfo::image_buffer(
                self.render_image.image().clone(),
                target.staging.clone(),
            ))
            .map_err(|e| CaptureError::Submit(format!("failed to copy image to buffer: {e}")))?;
        let command_buffer = builder
            .build()
            .map_err(|e| CaptureError::Submit(format!("failed to build command buffer: {e}")))?;

        let future = sync::now(self.device.clone())
            .then_execute(self.queue.clone(), command_buffer)
            .map_err(|e| CaptureError::Submit(e.to_string()))?
            .then_signal_fence_and_flush()
            .map_err(|e| CaptureError::Submit(e.to_string()))?;
        Ok(VulkanFence { future })
    }
}
