//! Audio chunks and their pool
//!
//! The mixer fills fixed size chunks of interleaved f32 samples on the render thread. Chunks
//! travel to the audio writer and come back to the pool once written.

use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::readback::PoolStats;
use super::stream_writer::Payload;
use crate::error::{ConfigError, FailureSlot};

const TAKE_SLICE: Duration = Duration::from_millis(100);

/// Produces the recording's audio, one chunk at a time
pub trait AudioMixer {
    /// Fill `samples` (interleaved, one frame per channel group) with the next chunk
    fn fill(&mut self, samples: &mut [f32]);
}

impl<F: FnMut(&mut [f32])> AudioMixer for F {
    fn fill(&mut self, samples: &mut [f32]) {
        self(samples)
    }
}

/// Sample layout shared by the mixer, the pool and the audio encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Chunks per second of virtual time
    pub chunk_rate: u32,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, chunk_rate: u32) -> Result<Self, ConfigError> {
        if sample_rate == 0 || channels == 0 || chunk_rate == 0 {
            return Err(ConfigError::Invalid(
                "sample rate, channel count and chunk rate must be non-zero".into(),
            ));
        }
        if sample_rate % chunk_rate != 0 {
            return Err(ConfigError::Invalid(format!(
                "sample rate {sample_rate} is not divisible by the audio chunk rate {chunk_rate}"
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            chunk_rate,
        })
    }

    /// Sample frames per chunk
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate / self.chunk_rate) as usize
    }

    /// f32 values per chunk
    pub fn chunk_len(&self) -> usize {
        self.frames_per_chunk() * self.channels as usize
    }
}

/// One chunk of interleaved samples, borrowed from an [`AudioChunkPool`].
///
/// Dropping a chunk returns its storage to the pool.
pub struct AudioChunk {
    samples: Vec<f32>,
    home: Sender<Vec<f32>>,
    outstanding: Arc<AtomicUsize>,
}

impl AudioChunk {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }
}

impl Drop for AudioChunk {
    fn drop(&mut self) {
        let _ = self.home.try_send(mem::take(&mut self.samples));
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Payload for AudioChunk {
    fn len(&self) -> usize {
        self.samples.len() * mem::size_of::<f32>()
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(bytemuck::cast_slice(&self.samples))
    }

    fn recycle(self) {
        drop(self)
    }
}

/// Fixed set of chunks allocated once per recording
pub struct AudioChunkPool {
    free_tx: Sender<Vec<f32>>,
    free_rx: Receiver<Vec<f32>>,
    outstanding: Arc<AtomicUsize>,
    capacity: usize,
    chunk_len: usize,
}

impl AudioChunkPool {
    pub fn new(capacity: usize, chunk_len: usize) -> Self {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            let _ = free_tx.try_send(vec![0.0; chunk_len]);
        }
        tracing::debug!(capacity, chunk_len, "allocated audio chunk pool");
        Self {
            free_tx,
            free_rx,
            outstanding: Arc::new(AtomicUsize::new(0)),
            capacity,
            chunk_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Take a free chunk without blocking
    pub fn try_take(&self) -> Option<AudioChunk> {
        self.free_rx.try_recv().ok().map(|samples| self.wrap(samples))
    }

    /// Take a free chunk, blocking until the writer returns one. Gives up with `None` once
    /// `failure` trips, since the writer may then never return anything.
    pub fn take(&self, failure: &FailureSlot) -> Option<AudioChunk> {
        loop {
            match self.free_rx.recv_timeout(TAKE_SLICE) {
                Ok(samples) => return Some(self.wrap(samples)),
                Err(RecvTimeoutError::Timeout) if !failure.is_tripped() => {
                    tracing::trace!("audio chunk pool exhausted, waiting for the writer");
                }
                Err(_) => return None,
            }
        }
    }

    fn wrap(&self, mut samples: Vec<f32>) -> AudioChunk {
        samples.resize(self.chunk_len, 0.0);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        AudioChunk {
            samples,
            home: self.free_tx.clone(),
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    /// Chunks handed out count as queued for writing
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            free: self.free_rx.len(),
            in_flight: 0,
            queued: self.outstanding.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_requires_divisible_chunk_rate() {
        let format = AudioFormat::new(48_000, 2, 1000).expect("format");
        assert_eq!(format.frames_per_chunk(), 48);
        assert_eq!(format.chunk_len(), 96);
        assert!(AudioFormat::new(44_100, 2, 1000).is_err());
        assert!(AudioFormat::new(48_000, 0, 1000).is_err());
    }

    #[test]
    fn chunks_return_to_the_pool() {
        let pool = AudioChunkPool::new(3, 4);
        let failure = FailureSlot::new();
        let a = pool.take(&failure).expect("chunk");
        let b = pool.take(&failure).expect("chunk");
        let stats = pool.stats();
        assert_eq!((stats.free, stats.queued), (1, 2));
        assert!(stats.is_conserved());

        a.recycle();
        drop(b);
        let stats = pool.stats();
        assert_eq!((stats.free, stats.queued), (3, 0));
    }

    #[test]
    fn exhausted_pool_gives_up_after_failure() {
        let pool = AudioChunkPool::new(1, 2);
        let failure = FailureSlot::new();
        let _held = pool.take(&failure).expect("chunk");
        assert!(pool.try_take().is_none());

        failure.record(crate::error::RecordingError::stream(
            crate::error::StreamKind::Audio,
            "gone",
        ));
        assert!(pool.take(&failure).is_none());
    }

    #[test]
    fn writes_native_endian_f32() {
        let pool = AudioChunkPool::new(1, 3);
        let mut chunk = pool.try_take().expect("chunk");
        chunk.samples_mut().copy_from_slice(&[0.5, -1.0, 0.25]);
        let mut bytes = Vec::new();
        chunk.write_to(&mut bytes).expect("write");
        assert_eq!(chunk.len(), 12);
        assert_eq!(&bytes[4..8], &(-1.0f32).to_ne_bytes());
    }

    #[test]
    fn closures_are_mixers() {
        let mut phase = 0.0f32;
        let mut mixer = |samples: &mut [f32]| {
            for s in samples.iter_mut() {
                *s = phase;
                phase += 1.0;
            }
        };
        let mut buf = [0.0f32; 4];
        mixer.fill(&mut buf);
        mixer.fill(&mut buf);
        assert_eq!(buf, [4.0, 5.0, 6.0, 7.0]);
    }
}
