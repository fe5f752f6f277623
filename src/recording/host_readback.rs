//! CPU backed capture device
//!
//! Renders into a plain byte frame and "reads back" with a memcpy. Fences are signaled at once,
//! or held until signaled through a [`HostFenceController`] when built with
//! [`HostReadback::deferred`].

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::pixel_format::PixelFormat;
use super::readback::{CaptureLayout, CompletionFence, ReadbackBuffer, ReadbackDevice};
use crate::error::CaptureError;

pub struct HostReadback {
    layout: CaptureLayout,
    frame: Vec<u8>,
    deferred: bool,
    pending: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl HostReadback {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let layout = CaptureLayout {
            width,
            height,
            format,
            bottom_up: false,
        };
        Self {
            frame: vec![0; layout.frame_len()],
            layout,
            deferred: false,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Report rows bottom row first, like a GL framebuffer readback
    pub fn bottom_up(mut self, bottom_up: bool) -> Self {
        self.layout.bottom_up = bottom_up;
        self
    }

    /// Hold every fence until it is signaled through the controller
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    pub fn fence_controller(&self) -> HostFenceController {
        HostFenceController {
            fences: Arc::clone(&self.pending),
        }
    }

    /// The render target, in the device's native layout
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.frame
    }
}

impl ReadbackDevice for HostReadback {
    type Buffer = HostBuffer;
    type Fence = HostFence;

    fn layout(&self) -> CaptureLayout {
        self.layout
    }

    fn allocate(&mut self, len: usize) -> Result<HostBuffer, CaptureError> {
        Ok(HostBuffer {
            data: RwLock::new(vec![0; len]),
        })
    }

    fn capture_into(&mut self, target: &HostBuffer) -> Result<HostFence, CaptureError> {
        {
            let mut data = target
                .data
                .write()
                .map_err(|_| CaptureError::Submit("host buffer lock poisoned".into()))?;
            let len = data.len().min(self.frame.len());
            data[..len].copy_from_slice(&self.frame[..len]);
        }

        let signaled = Arc::new(AtomicBool::new(!self.deferred));
        if self.deferred {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&signaled));
        }
        Ok(HostFence { signaled })
    }
}

pub struct HostBuffer {
    data: RwLock<Vec<u8>>,
}

pub struct HostView<'a>(RwLockReadGuard<'a, Vec<u8>>);

impl Deref for HostView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl ReadbackBuffer for HostBuffer {
    type View<'a> = HostView<'a>;

    fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    fn map(&self) -> Result<HostView<'_>, CaptureError> {
        self.data
            .read()
            .map(HostView)
            .map_err(|_| CaptureError::Map("host buffer lock poisoned".into()))
    }
}

pub struct HostFence {
    signaled: Arc<AtomicBool>,
}

impl CompletionFence for HostFence {
    fn is_signaled(&self) -> Result<bool, CaptureError> {
        Ok(self.signaled.load(Ordering::Acquire))
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool, CaptureError> {
        let start = Instant::now();
        loop {
            if self.signaled.load(Ordering::Acquire) {
                return Ok(true);
            }
            if timeout.is_some_and(|t| start.elapsed() >= t) {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Signals deferred host fences, in submission order
#[derive(Clone)]
pub struct HostFenceController {
    fences: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl HostFenceController {
    /// Signal the `index`-th fence ever issued. Returns false when no such fence exists.
    pub fn signal(&self, index: usize) -> bool {
        let fences = self.fences.lock().unwrap_or_else(PoisonError::into_inner);
        match fences.get(index) {
            Some(fence) => {
                fence.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Signal the oldest unsignaled fence
    pub fn signal_next(&self) -> bool {
        let fences = self.fences.lock().unwrap_or_else(PoisonError::into_inner);
        match fences.iter().find(|f| !f.load(Ordering::Acquire)) {
            Some(fence) => {
                fence.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn signal_all(&self) -> usize {
        let fences = self.fences.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for fence in fences.iter().filter(|f| !f.load(Ordering::Acquire)) {
            fence.store(true, Ordering::Release);
            count += 1;
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.fences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|f| !f.load(Ordering::Acquire))
            .count()
    }
}
