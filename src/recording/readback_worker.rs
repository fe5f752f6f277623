//! Readback worker thread
//!
//! Resolves completion fences in submission order, blends sub-frames when motion blur is on,
//! converts to the encoder's pixel format and hands frames to the video writer.

use std::io::{self, Write};
use std::mem;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::motion_blur::MotionBlurAccumulator;
use super::pixel_format::{self, PixelFormat};
use super::readback::{CaptureLayout, GpuBuffer, ReadbackBuffer, ReadbackQueue};
use super::stream_writer::{Payload, StreamQueue};
use crate::error::{FailureSlot, RecordingError};

/// Blended frames kept around for reuse
const SPARE_FRAMES: usize = 4;

/// One frame on its way to the video encoder.
///
/// Dropping a frame hands its storage back: pooled buffers return to the readback pool, blended
/// frames to the worker's spare list.
pub enum VideoFrame<B: ReadbackBuffer> {
    Pooled {
        buffer: Option<GpuBuffer<B>>,
        pool: ReadbackQueue<B>,
    },
    Blended {
        data: Vec<u8>,
        spare: Sender<Vec<u8>>,
    },
}

impl<B: ReadbackBuffer> Drop for VideoFrame<B> {
    fn drop(&mut self) {
        match self {
            VideoFrame::Pooled { buffer, pool } => {
                if let Some(buffer) = buffer.take() {
                    pool.release(buffer);
                }
            }
            VideoFrame::Blended { data, spare } => {
                let _ = spare.try_send(mem::take(data));
            }
        }
    }
}

impl<B: ReadbackBuffer> Payload for VideoFrame<B> {
    fn len(&self) -> usize {
        match self {
            VideoFrame::Pooled { buffer, .. } => buffer.as_ref().map_or(0, |b| b.payload_len()),
            VideoFrame::Blended { data, .. } => data.len(),
        }
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        match self {
            VideoFrame::Pooled {
                buffer: Some(buffer),
                ..
            } => buffer.write_to(sink),
            VideoFrame::Pooled { buffer: None, .. } => Ok(()),
            VideoFrame::Blended { data, .. } => sink.write_all(data),
        }
    }

    fn recycle(self) {
        drop(self)
    }
}

/// Totals reported when the worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Captured frames taken off the pool
    pub captured: u64,
    /// Frames pushed to the video writer
    pub emitted: u64,
    /// Sub-frames of an incomplete blur window thrown away at the end
    pub dropped_sub_frames: u64,
}

pub struct ReadbackWorker<B: ReadbackBuffer> {
    queue: ReadbackQueue<B>,
    writer: StreamQueue<VideoFrame<B>>,
    layout: CaptureLayout,
    out_format: PixelFormat,
    blur: Option<MotionBlurAccumulator>,
    spare_tx: Sender<Vec<u8>>,
    spare_rx: Receiver<Vec<u8>>,
    failure: FailureSlot,
}

impl<B: ReadbackBuffer> ReadbackWorker<B> {
    pub fn new(
        queue: ReadbackQueue<B>,
        writer: StreamQueue<VideoFrame<B>>,
        layout: CaptureLayout,
        out_format: PixelFormat,
        blur: Option<MotionBlurAccumulator>,
        failure: FailureSlot,
    ) -> Self {
        let (spare_tx, spare_rx) = crossbeam_channel::bounded(SPARE_FRAMES);
        Self {
            queue,
            writer,
            layout,
            out_format,
            blur,
            spare_tx,
            spare_rx,
            failure,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<WorkerReport>> {
        thread::Builder::new()
            .name("readback".into())
            .spawn(move || self.run())
    }

    /// Consume until the pool is finished and drained, or closed
    pub fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport::default();
        loop {
            let buffer = match self.queue.next_ready() {
                Ok(Some(buffer)) => buffer,
                Ok(None) => break,
                Err(e) => {
                    // the head fence is unusable, nothing behind it can complete
                    self.failure.record(e.into());
                    self.queue.close();
                    break;
                }
            };
            report.captured += 1;

            if self.failure.is_tripped() {
                self.queue.release(buffer);
                continue;
            }
            if let Err(e) = self.process(buffer, &mut report) {
                self.failure.record(e);
            }
        }

        if let Some(blur) = self.blur.as_mut() {
            let dropped = blur.discard_partial();
            if dropped > 0 {
                tracing::debug!(dropped, "dropping incomplete motion blur window");
            }
            report.dropped_sub_frames = dropped as u64;
        }
        tracing::debug!(
            captured = report.captured,
            emitted = report.emitted,
            "readback worker finished"
        );
        report
    }

    fn process(&mut self, mut buffer: GpuBuffer<B>, report: &mut WorkerReport) -> Result<(), RecordingError> {
        let Some(blur) = self.blur.as_mut() else {
            if let Err(e) = buffer.convert(&self.layout, self.out_format) {
                self.queue.release(buffer);
                return Err(e);
            }
            self.writer.push(VideoFrame::Pooled {
                buffer: Some(buffer),
                pool: self.queue.clone(),
            })?;
            report.emitted += 1;
            return Ok(());
        };

        blur.begin_sub_frame();
        let accumulated = match buffer.map() {
            Ok(view) => blur.end_sub_frame(&view).map_err(RecordingError::from),
            Err(e) => Err(e.into()),
        };
        self.queue.release(buffer);
        accumulated?;

        if !blur.is_ready() {
            return Ok(());
        }

        let frame_len = self.layout.frame_len();
        let mut blended = self.spare_rx.try_recv().unwrap_or_default();
        blended.resize(frame_len, 0);
        blur.emit_into(&mut blended);

        let data = if self.out_format == self.layout.format {
            blended
        } else {
            let mut converted = self
                .spare_rx
                .try_recv()
                .unwrap_or_default();
            converted.resize(
                self.out_format.required_size(self.layout.width, self.layout.height),
                0,
            );
            pixel_format::convert(
                &blended,
                self.layout.format,
                &mut converted,
                self.out_format,
                self.layout.width,
                self.layout.height,
            )?;
            let _ = self.spare_tx.try_send(blended);
            converted
        };

        self.writer.push(VideoFrame::Blended {
            data,
            spare: self.spare_tx.clone(),
        })?;
        report.emitted += 1;
        Ok(())
    }
}
