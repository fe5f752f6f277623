//! Sub-frame weight curves for motion blur
//!
//! Weights come from a closed catalogue of curves indexed by a stable numeric id, so that ids
//! stored in settings files keep their meaning.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::f64::consts::PI;

use crate::error::ConfigError;

const BACK_OVERSHOOT: f64 = 1.70158;
const BACK_OFFSET: f64 = 0.100004;

/// Curve catalogue. The discriminant is the id used in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BlendFunction {
    Flat = 0,
    Linear,
    InQuad,
    OutQuad,
    InOutQuad,
    InCubic,
    OutCubic,
    InOutCubic,
    InQuart,
    OutQuart,
    InOutQuart,
    InQuint,
    OutQuint,
    InOutQuint,
    InSine,
    OutSine,
    InOutSine,
    InExpo,
    OutExpo,
    InOutExpo,
    InCirc,
    OutCirc,
    InOutCirc,
    InBack,
    OutBack,
    InOutBack,
    Gauss,
    GaussSymmetric,
    PyramidSymmetric,
    SemiCircle,
}

impl BlendFunction {
    /// Look up a curve by id, falling back to [`BlendFunction::Flat`] when out of range
    pub fn from_id(id: i64) -> Self {
        u8::try_from(id)
            .ok()
            .and_then(|id| BlendFunction::try_from(id).ok())
            .unwrap_or(BlendFunction::Flat)
    }

    pub fn id(self) -> u8 {
        self.into()
    }

    /// Evaluate the curve at `t` in `[0, 1]`
    pub fn ease(self, t: f64, gauss_mult: f64) -> f64 {
        use BlendFunction::*;
        match self {
            Flat => 1.0,
            Linear => t,
            InQuad => ease_in(t, 2),
            OutQuad => ease_out(t, 2),
            InOutQuad => ease_in_out(t, 2),
            InCubic => ease_in(t, 3),
            OutCubic => ease_out(t, 3),
            InOutCubic => ease_in_out(t, 3),
            InQuart => ease_in(t, 4),
            OutQuart => ease_out(t, 4),
            InOutQuart => ease_in_out(t, 4),
            InQuint => ease_in(t, 5),
            OutQuint => ease_out(t, 5),
            InOutQuint => ease_in_out(t, 5),
            InSine => 1.0 - (t * PI / 2.0).cos(),
            OutSine => (t * PI / 2.0).sin(),
            InOutSine => -((PI * t).cos() - 1.0) / 2.0,
            InExpo => {
                if t <= 0.0 {
                    0.0
                } else {
                    2f64.powf(10.0 * t - 10.0)
                }
            }
            OutExpo => {
                if t >= 1.0 {
                    1.0
                } else {
                    1.0 - 2f64.powf(-10.0 * t)
                }
            }
            InOutExpo => {
                if t <= 0.0 {
                    0.0
                } else if t >= 1.0 {
                    1.0
                } else if t < 0.5 {
                    2f64.powf(20.0 * t - 10.0) / 2.0
                } else {
                    (2.0 - 2f64.powf(-20.0 * t + 10.0)) / 2.0
                }
            }
            InCirc => 1.0 - (1.0 - t * t).max(0.0).sqrt(),
            OutCirc => (1.0 - (t - 1.0).powi(2)).max(0.0).sqrt(),
            InOutCirc => {
                if t < 0.5 {
                    (1.0 - (1.0 - (2.0 * t).powi(2)).max(0.0).sqrt()) / 2.0
                } else {
                    ((1.0 - (-2.0 * t + 2.0).powi(2)).max(0.0).sqrt() + 1.0) / 2.0
                }
            }
            // back curves dip below zero, the offset keeps every weight positive
            InBack => (BACK_OVERSHOOT + 1.0) * t * t * t - BACK_OVERSHOOT * t * t + BACK_OFFSET,
            OutBack => {
                let u = t - 1.0;
                1.0 + (BACK_OVERSHOOT + 1.0) * u * u * u + BACK_OVERSHOOT * u * u
            }
            InOutBack => {
                let c = BACK_OVERSHOOT * 1.525;
                let v = if t < 0.5 {
                    ((2.0 * t).powi(2) * ((c + 1.0) * 2.0 * t - c)) / 2.0
                } else {
                    ((2.0 * t - 2.0).powi(2) * ((c + 1.0) * (t * 2.0 - 2.0) + c) + 2.0) / 2.0
                };
                v + BACK_OFFSET
            }
            Gauss => (-(gauss_mult * (t - 1.0)).powi(2)).exp(),
            GaussSymmetric => (-(gauss_mult * (t * 2.0 - 1.0)).powi(2)).exp(),
            PyramidSymmetric => 1.0 - (t * 2.0 - 1.0).abs(),
            SemiCircle => (1.0 - (0.5 - t).powi(2)).sqrt(),
        }
    }
}

fn ease_in(t: f64, power: i32) -> f64 {
    t.powi(power)
}

fn ease_out(t: f64, power: i32) -> f64 {
    1.0 - (1.0 - t).powi(power)
}

fn ease_in_out(t: f64, power: i32) -> f64 {
    if t < 0.5 {
        2f64.powi(power - 1) * t.powi(power)
    } else {
        1.0 - (-2.0 * t + 2.0).powi(power) / 2.0
    }
}

/// Normalised per-position weights of one blend window
#[derive(Debug, Clone, PartialEq)]
pub struct BlendWeights {
    weights: Vec<f32>,
}

impl BlendWeights {
    /// Sample `function` at `count` evenly spaced positions
    pub fn from_curve(function: BlendFunction, count: usize, gauss_mult: f64) -> Self {
        let raw = if count <= 1 {
            vec![1.0; count.max(1)]
        } else {
            (0..count)
                .map(|i| 1.0 + function.ease(i as f64 / (count - 1) as f64, gauss_mult) * 100.0)
                .collect()
        };
        Self::normalized(raw)
    }

    /// Parse a space separated list of weights, one per sub-frame
    pub fn from_manual(list: &str, count: usize) -> Result<Self, ConfigError> {
        let raw = list
            .split_whitespace()
            .map(|s| {
                s.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .ok_or_else(|| ConfigError::InvalidWeight(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if raw.len() != count {
            return Err(ConfigError::WeightCount {
                expected: count,
                actual: raw.len(),
            });
        }
        if raw.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::InvalidWeight(list.trim().to_string()));
        }
        Ok(Self::normalized(raw))
    }

    fn normalized(raw: Vec<f64>) -> Self {
        let sum: f64 = raw.iter().sum();
        Self {
            weights: raw.into_iter().map(|w| (w / sum) as f32).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn get(&self, position: usize) -> f32 {
        self.weights.get(position).copied().unwrap_or(0.0)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.weights
    }

    pub fn sum(&self) -> f32 {
        self.weights.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_curve_yields_positive_normalised_weights() {
        for id in 0..30 {
            let function = BlendFunction::from_id(id);
            assert_eq!(function.id() as i64, id);
            for count in [1usize, 2, 3, 16, 24] {
                let weights = BlendWeights::from_curve(function, count, 1.5);
                assert_eq!(weights.len(), count);
                assert!((weights.sum() - 1.0).abs() < 1e-5, "{function:?} x{count}");
                assert!(weights.as_slice().iter().all(|w| *w > 0.0), "{function:?} x{count}");
            }
        }
    }

    #[test]
    fn out_of_range_id_falls_back_to_flat() {
        assert_eq!(BlendFunction::from_id(30), BlendFunction::Flat);
        assert_eq!(BlendFunction::from_id(-1), BlendFunction::Flat);
        assert_eq!(BlendFunction::from_id(1000), BlendFunction::Flat);

        let flat = BlendWeights::from_curve(BlendFunction::Flat, 4, 1.5);
        assert_eq!(flat.as_slice(), &[0.25; 4]);
    }

    #[test]
    fn symmetric_gaussian_peaks_in_the_middle() {
        let weights = BlendWeights::from_curve(BlendFunction::GaussSymmetric, 5, 1.5);
        let w = weights.as_slice();
        assert!(w[2] > w[1] && w[1] > w[0]);
        assert!((w[0] - w[4]).abs() < 1e-6);
        assert!((w[1] - w[3]).abs() < 1e-6);
    }

    #[test]
    fn linear_weights_increase() {
        let weights = BlendWeights::from_curve(BlendFunction::Linear, 3, 1.5);
        // raw weights are 1, 51 and 101
        let w = weights.as_slice();
        assert!((w[0] - 1.0 / 153.0).abs() < 1e-6);
        assert!((w[2] - 101.0 / 153.0).abs() < 1e-6);
    }

    #[test]
    fn manual_weights_are_validated() {
        let weights = BlendWeights::from_manual("1 1 2", 3).expect("valid weights");
        assert_eq!(weights.as_slice(), &[0.25, 0.25, 0.5]);

        assert_eq!(
            BlendWeights::from_manual("1 x 2", 3),
            Err(ConfigError::InvalidWeight("x".into()))
        );
        assert_eq!(
            BlendWeights::from_manual("1 2", 3),
            Err(ConfigError::WeightCount { expected: 3, actual: 2 })
        );
        assert!(BlendWeights::from_manual("0 0 0", 3).is_err());
    }
}
