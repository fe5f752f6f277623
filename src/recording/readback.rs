//! Bounded pool of GPU readback buffers
//!
//! The render thread submits copies through [`GpuReadbackPool::begin_frame`] /
//! [`CaptureFrame::end`]. Completed buffers leave the pool strictly in submission order, either
//! through the non-blocking [`ReadbackQueue::poll`] or the blocking
//! [`ReadbackQueue::next_ready`] used by the readback worker. The writer hands buffers back
//! with [`ReadbackQueue::release`].
//!
//! An exhausted pool blocks `acquire` on a condition variable until a buffer is released.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::pixel_format::{self, PixelFormat};
use crate::error::{CaptureError, RecordingError};

const FENCE_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Geometry and byte layout of frames produced by a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Rows arrive bottom row first (GL style readback)
    pub bottom_up: bool,
}

impl CaptureLayout {
    pub fn frame_len(&self) -> usize {
        self.format.required_size(self.width, self.height)
    }
}

/// Completion token for one submitted copy
pub trait CompletionFence: Send + Sync + 'static {
    fn is_signaled(&self) -> Result<bool, CaptureError>;

    /// Block until signaled or until `timeout` passes. Returns whether the fence signaled.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, CaptureError>;
}

/// CPU visible destination of a readback copy
pub trait ReadbackBuffer: Send + 'static {
    type View<'a>: Deref<Target = [u8]>
    where
        Self: 'a;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> Result<Self::View<'_>, CaptureError>;
}

/// Device side of the capture: owns the render target and issues copies out of it
pub trait ReadbackDevice {
    type Buffer: ReadbackBuffer;
    type Fence: CompletionFence;

    fn layout(&self) -> CaptureLayout;

    fn allocate(&mut self, len: usize) -> Result<Self::Buffer, CaptureError>;

    /// Prepare the render target for a new frame
    fn begin_frame(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Queue a copy of the render target into `target`
    fn capture_into(&mut self, target: &Self::Buffer) -> Result<Self::Fence, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    InFlight,
    Ready,
}

impl BufferState {
    fn name(self) -> &'static str {
        match self {
            BufferState::Free => "Free",
            BufferState::InFlight => "InFlight",
            BufferState::Ready => "Ready",
        }
    }
}

/// One pool slot. Its bytes may only be read while `Ready`.
pub struct GpuBuffer<B> {
    slot: usize,
    sequence: u64,
    target: B,
    conversion: Option<Vec<u8>>,
    converted: bool,
    state: BufferState,
}

impl<B: ReadbackBuffer> GpuBuffer<B> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Submission index, increasing by one per captured frame
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Captured bytes in the device's native layout
    pub fn map(&self) -> Result<B::View<'_>, CaptureError> {
        if self.state != BufferState::Ready {
            return Err(CaptureError::NotReady(self.state.name()));
        }
        self.target.map()
    }

    /// Convert the captured frame into the slot's conversion buffer.
    ///
    /// The conversion buffer is allocated on first use and only when `out_format` differs from
    /// the captured layout.
    pub fn convert(
        &mut self,
        layout: &CaptureLayout,
        out_format: PixelFormat,
    ) -> Result<(), RecordingError> {
        if self.state != BufferState::Ready {
            return Err(CaptureError::NotReady(self.state.name()).into());
        }
        if out_format == layout.format {
            self.converted = false;
            return Ok(());
        }
        let size = out_format.required_size(layout.width, layout.height);
        let conversion = self.conversion.get_or_insert_with(Vec::new);
        conversion.resize(size, 0);

        let view = self.target.map()?;
        pixel_format::convert(
            &view,
            layout.format,
            conversion,
            out_format,
            layout.width,
            layout.height,
        )?;
        self.converted = true;
        Ok(())
    }

    /// Byte length of what [`write_to`](Self::write_to) emits
    pub fn payload_len(&self) -> usize {
        match (&self.conversion, self.converted) {
            (Some(conversion), true) => conversion.len(),
            _ => self.target.len(),
        }
    }

    /// Write the converted frame, or the captured bytes when no conversion was needed
    pub fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        if let (Some(conversion), true) = (&self.conversion, self.converted) {
            return sink.write_all(conversion);
        }
        let view = self.map().map_err(io::Error::other)?;
        sink.write_all(&view)
    }
}

impl<B> fmt::Debug for GpuBuffer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("slot", &self.slot)
            .field("sequence", &self.sequence)
            .field("state", &self.state)
            .finish()
    }
}

/// Receipt for a submitted copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub slot: usize,
    pub sequence: u64,
}

/// Snapshot of pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_flight: usize,
    pub queued: usize,
}

impl PoolStats {
    pub fn is_conserved(&self) -> bool {
        self.free + self.in_flight + self.queued == self.capacity
    }
}

struct InFlightEntry<B> {
    buffer: GpuBuffer<B>,
    fence: Arc<dyn CompletionFence>,
}

struct PoolState<B> {
    free: Vec<GpuBuffer<B>>,
    in_flight: VecDeque<InFlightEntry<B>>,
    // popped from `free`, copy not yet recorded in `in_flight`
    issuing: usize,
    queued: usize,
    next_sequence: u64,
    finished: bool,
    closed: bool,
}

struct PoolShared<B> {
    state: Mutex<PoolState<B>>,
    freed: Condvar,
    submitted: Condvar,
    capacity: usize,
}

impl<B: ReadbackBuffer> PoolShared<B> {
    fn lock(&self) -> MutexGuard<'_, PoolState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            capacity: self.capacity,
            free: state.free.len(),
            in_flight: state.in_flight.len() + state.issuing,
            queued: state.queued,
        }
    }

    fn mark_ready(state: &mut PoolState<B>, entry: InFlightEntry<B>) -> GpuBuffer<B> {
        let mut buffer = entry.buffer;
        buffer.state = BufferState::Ready;
        state.queued += 1;
        buffer
    }

    fn poll(&self) -> Result<Vec<GpuBuffer<B>>, CaptureError> {
        let mut state = self.lock();
        let mut ready = Vec::new();
        loop {
            let signaled = match state.in_flight.front() {
                Some(front) => front.fence.is_signaled()?,
                None => break,
            };
            if !signaled {
                break;
            }
            if let Some(entry) = state.in_flight.pop_front() {
                ready.push(Self::mark_ready(&mut state, entry));
            }
        }
        Ok(ready)
    }

    fn next_ready(&self) -> Result<Option<GpuBuffer<B>>, CaptureError> {
        loop {
            let fence = {
                let mut state = self.lock();
                loop {
                    if state.closed {
                        return Ok(None);
                    }
                    if let Some(front) = state.in_flight.front() {
                        break Arc::clone(&front.fence);
                    }
                    if state.finished && state.issuing == 0 {
                        return Ok(None);
                    }
                    state = self
                        .submitted
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            // Waited on outside the lock so acquire and release stay responsive
            while !fence.wait(Some(FENCE_WAIT_SLICE))? {
                if self.lock().closed {
                    return Ok(None);
                }
            }

            let mut state = self.lock();
            let still_front = state
                .in_flight
                .front()
                .is_some_and(|front| Arc::ptr_eq(&front.fence, &fence));
            if still_front {
                if let Some(entry) = state.in_flight.pop_front() {
                    return Ok(Some(Self::mark_ready(&mut state, entry)));
                }
            }
        }
    }

    fn release(&self, mut buffer: GpuBuffer<B>) {
        buffer.state = BufferState::Free;
        buffer.converted = false;
        let mut state = self.lock();
        state.queued = state.queued.saturating_sub(1);
        state.free.push(buffer);
        drop(state);
        self.freed.notify_one();
    }

    fn finish(&self) {
        self.lock().finished = true;
        self.submitted.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.freed.notify_all();
        self.submitted.notify_all();
    }
}

/// Consumer side handle of a [`GpuReadbackPool`], shareable across threads
pub struct ReadbackQueue<B> {
    shared: Arc<PoolShared<B>>,
}

impl<B> Clone for ReadbackQueue<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: ReadbackBuffer> ReadbackQueue<B> {
    /// Collect every completed buffer at the head of the submission order without blocking.
    /// A buffer whose fence has not signaled holds back everything submitted after it.
    pub fn poll(&self) -> Result<Vec<GpuBuffer<B>>, CaptureError> {
        self.shared.poll()
    }

    /// Block until the oldest submitted copy completes.
    ///
    /// Returns `None` once the pool is finished and drained, or closed. Only one thread may
    /// consume through this method.
    pub fn next_ready(&self) -> Result<Option<GpuBuffer<B>>, CaptureError> {
        self.shared.next_ready()
    }

    /// Return a buffer whose bytes have been written out
    pub fn release(&self, buffer: GpuBuffer<B>) {
        self.shared.release(buffer)
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Stop accepting copies and wake every waiter
    pub fn close(&self) {
        self.shared.close()
    }
}

/// Fixed set of readback buffers allocated once per recording
pub struct GpuReadbackPool<D: ReadbackDevice> {
    device: D,
    layout: CaptureLayout,
    shared: Arc<PoolShared<D::Buffer>>,
}

impl<D: ReadbackDevice> GpuReadbackPool<D> {
    pub fn new(mut device: D, capacity: usize) -> Result<Self, CaptureError> {
        let capacity = capacity.max(1);
        let layout = device.layout();
        let frame_len = layout.frame_len();

        let free = (0..capacity)
            .map(|slot| {
                Ok(GpuBuffer {
                    slot,
                    sequence: 0,
                    target: device.allocate(frame_len)?,
                    conversion: None,
                    converted: false,
                    state: BufferState::Free,
                })
            })
            .collect::<Result<Vec<_>, CaptureError>>()?;

        tracing::debug!(capacity, frame_len, "allocated readback pool");

        Ok(Self {
            device,
            layout,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    free,
                    in_flight: VecDeque::with_capacity(capacity),
                    issuing: 0,
                    queued: 0,
                    next_sequence: 0,
                    finished: false,
                    closed: false,
                }),
                freed: Condvar::new(),
                submitted: Condvar::new(),
                capacity,
            }),
        })
    }

    pub fn layout(&self) -> CaptureLayout {
        self.layout
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn queue(&self) -> ReadbackQueue<D::Buffer> {
        ReadbackQueue {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start a frame. The copy is only issued by [`CaptureFrame::end`].
    pub fn begin_frame(&mut self) -> Result<CaptureFrame<'_, D>, CaptureError> {
        self.device.begin_frame()?;
        Ok(CaptureFrame { pool: self })
    }

    /// Take a free buffer and copy the current render target into it.
    ///
    /// Blocks while every buffer is in flight or queued for writing.
    pub fn acquire(&mut self) -> Result<Submission, CaptureError> {
        let mut buffer = {
            let mut state = self.shared.lock();
            loop {
                if state.closed {
                    return Err(CaptureError::PoolClosed);
                }
                if let Some(buffer) = state.free.pop() {
                    state.issuing += 1;
                    break buffer;
                }
                tracing::trace!("readback pool exhausted, waiting for a release");
                state = self
                    .shared
                    .freed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let fence = match self.device.capture_into(&buffer.target) {
            Ok(fence) => fence,
            Err(e) => {
                let mut state = self.shared.lock();
                state.issuing -= 1;
                state.free.push(buffer);
                drop(state);
                self.shared.freed.notify_one();
                return Err(e);
            }
        };
        let fence: Arc<dyn CompletionFence> = Arc::new(fence);

        let mut state = self.shared.lock();
        state.issuing -= 1;
        buffer.state = BufferState::InFlight;
        buffer.converted = false;
        buffer.sequence = state.next_sequence;
        state.next_sequence += 1;

        let submission = Submission {
            slot: buffer.slot,
            sequence: buffer.sequence,
        };
        state.in_flight.push_back(InFlightEntry { buffer, fence });
        drop(state);
        self.shared.submitted.notify_all();
        Ok(submission)
    }

    pub fn poll(&self) -> Result<Vec<GpuBuffer<D::Buffer>>, CaptureError> {
        self.shared.poll()
    }

    pub fn release(&self, buffer: GpuBuffer<D::Buffer>) {
        self.shared.release(buffer)
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// No more frames will be submitted; `next_ready` returns `None` once drained
    pub fn finish(&self) {
        self.shared.finish()
    }

    pub fn close(&self) {
        self.shared.close()
    }

    /// Wait (bounded per fence) for outstanding copies and return their buffers to the free
    /// list. Returns how many were discarded.
    pub fn discard_in_flight(&self, timeout: Duration) -> usize {
        let entries: Vec<_> = self.shared.lock().in_flight.drain(..).collect();
        let count = entries.len();
        let mut buffers = Vec::with_capacity(count);
        for entry in entries {
            match entry.fence.wait(Some(timeout)) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(slot = entry.buffer.slot, "abandoning unsignaled readback"),
                Err(e) => tracing::warn!(slot = entry.buffer.slot, error = %e, "fence failed while discarding"),
            }
            let mut buffer = entry.buffer;
            buffer.state = BufferState::Free;
            buffers.push(buffer);
        }
        let mut state = self.shared.lock();
        state.free.extend(buffers);
        drop(state);
        self.shared.freed.notify_all();
        count
    }
}

/// A frame between `begin_frame` and `end`. Dropping it without `end` discards the frame.
#[must_use = "the frame is only captured when `end` is called"]
pub struct CaptureFrame<'a, D: ReadbackDevice> {
    pool: &'a mut GpuReadbackPool<D>,
}

impl<D: ReadbackDevice> CaptureFrame<'_, D> {
    /// Render target access for the renderer
    pub fn device(&mut self) -> &mut D {
        &mut self.pool.device
    }

    /// Issue the readback copy for this frame
    pub fn end(self) -> Result<Submission, CaptureError> {
        self.pool.acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::host_readback::{HostFenceController, HostReadback};
    use std::thread;

    fn pool(capacity: usize) -> (GpuReadbackPool<HostReadback>, HostFenceController) {
        let device = HostReadback::new(4, 2, PixelFormat::Bgra).deferred();
        let fences = device.fence_controller();
        (GpuReadbackPool::new(device, capacity).expect("pool"), fences)
    }

    #[test]
    fn exhausted_pool_blocks_third_acquire() {
        let (mut pool, fences) = pool(2);
        let queue = pool.queue();
        let (tx, rx) = crossbeam_channel::unbounded();

        let producer = thread::spawn(move || {
            for _ in 0..3 {
                let submission = pool.acquire().expect("acquire");
                tx.send(submission.sequence).expect("send");
            }
            pool
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(1));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let stats = queue.stats();
        assert_eq!((stats.free, stats.in_flight, stats.queued), (0, 2, 0));
        assert!(queue.poll().expect("poll").is_empty());

        fences.signal_next();
        let mut ready = queue.poll().expect("poll");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].sequence(), 0);
        assert!(queue.stats().is_conserved());

        queue.release(ready.remove(0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(2));

        let pool = producer.join().expect("producer thread");
        assert!(pool.stats().is_conserved());
    }

    #[test]
    fn poll_preserves_submission_order() {
        let (mut pool, fences) = pool(4);
        for _ in 0..4 {
            pool.acquire().expect("acquire");
        }

        // later copies completing first must not overtake the head
        fences.signal(2);
        fences.signal(3);
        assert!(pool.poll().expect("poll").is_empty());

        fences.signal(0);
        let ready = pool.poll().expect("poll");
        assert_eq!(ready.iter().map(|b| b.sequence()).collect::<Vec<_>>(), vec![0]);

        fences.signal(1);
        let rest = pool.poll().expect("poll");
        assert_eq!(rest.iter().map(|b| b.sequence()).collect::<Vec<_>>(), vec![1, 2, 3]);

        for buffer in ready.into_iter().chain(rest) {
            pool.release(buffer);
        }
        assert_eq!(pool.stats().free, 4);
    }

    #[test]
    fn conservation_holds_through_cycles() {
        let (mut pool, fences) = pool(3);
        let mut held = Vec::new();
        for round in 0..20 {
            if pool.stats().free > 0 {
                let mut frame = pool.begin_frame().expect("begin");
                frame.device().frame_mut().fill(round as u8);
                frame.end().expect("end");
            }
            assert!(pool.stats().is_conserved());

            if round % 2 == 1 {
                fences.signal_all();
            }
            held.extend(pool.poll().expect("poll"));
            assert!(pool.stats().is_conserved());

            if round % 3 == 2 {
                for buffer in held.drain(..) {
                    pool.release(buffer);
                }
            }
            assert!(pool.stats().is_conserved());
        }
    }

    #[test]
    fn ready_buffer_holds_frame_contents() {
        let (mut pool, fences) = pool(2);
        let mut frame = pool.begin_frame().expect("begin");
        frame.device().frame_mut().fill(7);
        frame.end().expect("end");

        fences.signal_all();
        let mut ready = pool.poll().expect("poll");
        let buffer = ready.remove(0);
        assert_eq!(buffer.state(), BufferState::Ready);
        assert!(buffer.map().expect("map").iter().all(|&b| b == 7));

        let mut sink = Vec::new();
        buffer.write_to(&mut sink).expect("write");
        assert_eq!(sink.len(), pool.layout().frame_len());
        pool.release(buffer);
    }

    #[test]
    fn next_ready_waits_for_fence_and_ends_after_finish() {
        let (mut pool, fences) = pool(2);
        let queue = pool.queue();
        pool.acquire().expect("acquire");

        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(buffer) = queue.next_ready().expect("next_ready") {
                seen.push(buffer.sequence());
                queue.release(buffer);
            }
            seen
        });

        thread::sleep(Duration::from_millis(50));
        fences.signal_all();
        pool.acquire().expect("acquire");
        fences.signal_all();
        pool.finish();

        assert_eq!(consumer.join().expect("consumer"), vec![0, 1]);
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let (mut pool, _fences) = pool(1);
        pool.close();
        assert_eq!(pool.acquire(), Err(CaptureError::PoolClosed));
    }
}
