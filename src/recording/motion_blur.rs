//! Temporal blending of oversampled sub-frames
//!
//! Frames are captured at `fps * K` and every `K` consecutive sub-frames are folded into one
//! output frame. With `K = 1` the pipeline does not build an accumulator at all and readback
//! buffers go straight to the converter.

use rayon::prelude::*;

use super::blend_weights::BlendWeights;
use crate::error::ConversionError;

const ROW_CHUNK: usize = 64 * 1024;

pub struct MotionBlurAccumulator {
    weights: BlendWeights,
    accumulator: Vec<f32>,
    position: usize,
    applied: f32,
    sub_frame_open: bool,
}

impl MotionBlurAccumulator {
    /// `frame_len` is the byte length of one captured frame in the native layout
    pub fn new(weights: BlendWeights, frame_len: usize) -> Self {
        Self {
            weights,
            accumulator: vec![0.0; frame_len],
            position: 0,
            applied: 0.0,
            sub_frame_open: false,
        }
    }

    /// Number of sub-frames folded into one emitted frame
    pub fn window(&self) -> usize {
        self.weights.len()
    }

    pub fn frame_len(&self) -> usize {
        self.accumulator.len()
    }

    /// Sub-frames accumulated towards the next emitted frame
    pub fn pending(&self) -> usize {
        self.position
    }

    pub fn begin_sub_frame(&mut self) {
        self.sub_frame_open = true;
    }

    /// Add `frame` to the running sum with the weight of its window position
    pub fn end_sub_frame(&mut self, frame: &[u8]) -> Result<(), ConversionError> {
        if frame.len() < self.accumulator.len() {
            return Err(ConversionError::BufferTooSmall {
                which: "sub-frame",
                required: self.accumulator.len(),
                actual: frame.len(),
            });
        }
        if !self.sub_frame_open {
            tracing::trace!("end_sub_frame without begin_sub_frame");
        }
        self.sub_frame_open = false;

        if self.position >= self.window() {
            // previous window was never emitted
            tracing::warn!("motion blur window overrun, restarting accumulation");
            self.reset();
        }

        let weight = self.weights.get(self.position);
        let first = self.position == 0;
        let len = self.accumulator.len();
        self.accumulator
            .par_chunks_mut(ROW_CHUNK)
            .zip(frame[..len].par_chunks(ROW_CHUNK))
            .for_each(|(acc, px)| {
                if first {
                    for (a, p) in acc.iter_mut().zip(px) {
                        *a = weight * *p as f32;
                    }
                } else {
                    for (a, p) in acc.iter_mut().zip(px) {
                        *a += weight * *p as f32;
                    }
                }
            });

        self.applied += weight;
        self.position += 1;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.position >= self.window()
    }

    /// Emit the blended frame once a full window has been accumulated, then reset
    pub fn emit(&mut self) -> Option<Vec<u8>> {
        if !self.is_ready() {
            return None;
        }
        let mut out = vec![0u8; self.accumulator.len()];
        self.emit_into(&mut out);
        Some(out)
    }

    /// Like [`emit`](Self::emit) but writes into a caller supplied buffer
    pub fn emit_into(&mut self, out: &mut [u8]) -> bool {
        if !self.is_ready() || out.len() < self.accumulator.len() {
            return false;
        }
        let scale = if self.applied > 0.0 { 1.0 / self.applied } else { 1.0 };
        out[..self.accumulator.len()]
            .par_chunks_mut(ROW_CHUNK)
            .zip(self.accumulator.par_chunks(ROW_CHUNK))
            .for_each(|(o, acc)| {
                for (o, a) in o.iter_mut().zip(acc) {
                    *o = (a * scale).round().clamp(0.0, 255.0) as u8;
                }
            });
        self.reset();
        true
    }

    /// Drop an incomplete window, returning how many sub-frames were discarded
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.position;
        self.reset();
        dropped
    }

    fn reset(&mut self) {
        self.position = 0;
        self.applied = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::blend_weights::BlendFunction;

    fn feed(acc: &mut MotionBlurAccumulator, value: u8) -> Option<Vec<u8>> {
        let frame = vec![value; acc.frame_len()];
        acc.begin_sub_frame();
        acc.end_sub_frame(&frame).expect("sub-frame");
        acc.emit()
    }

    #[test]
    fn emits_once_per_window() {
        let multiplier = 4;
        let weights = BlendWeights::from_curve(BlendFunction::GaussSymmetric, multiplier, 1.5);
        let mut acc = MotionBlurAccumulator::new(weights, 12);

        let emitted = (0..multiplier * 5)
            .filter_map(|i| feed(&mut acc, (i * 3) as u8))
            .count();
        assert_eq!(emitted, 5);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn constant_input_survives_blending() {
        let weights = BlendWeights::from_curve(BlendFunction::InOutBack, 8, 1.5);
        let mut acc = MotionBlurAccumulator::new(weights, 16);
        let mut out = None;
        for _ in 0..8 {
            out = feed(&mut acc, 200);
        }
        assert_eq!(out.expect("blended frame"), vec![200u8; 16]);
    }

    #[test]
    fn blends_with_position_weights() {
        let weights = BlendWeights::from_manual("1 3", 2).expect("weights");
        let mut acc = MotionBlurAccumulator::new(weights, 3);
        assert!(feed(&mut acc, 0).is_none());
        let out = feed(&mut acc, 100).expect("blended frame");
        assert_eq!(out, vec![75u8; 3]);
    }

    #[test]
    fn partial_window_is_discarded() {
        let weights = BlendWeights::from_curve(BlendFunction::Flat, 3, 1.5);
        let mut acc = MotionBlurAccumulator::new(weights, 4);
        feed(&mut acc, 10);
        feed(&mut acc, 20);
        assert_eq!(acc.discard_partial(), 2);
        assert_eq!(acc.pending(), 0);
        assert!(acc.emit().is_none());
    }

    #[test]
    fn rejects_short_sub_frame() {
        let weights = BlendWeights::from_curve(BlendFunction::Flat, 2, 1.5);
        let mut acc = MotionBlurAccumulator::new(weights, 8);
        acc.begin_sub_frame();
        assert!(acc.end_sub_frame(&[0u8; 4]).is_err());
    }
}
