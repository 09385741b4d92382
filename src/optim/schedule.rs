//! # Learning-Rate Schedules

use crate::tensor::TensorData;
use serde::{Deserialize, Serialize};

/// Learning rate as a function of the global step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LearningRateSchedule {
    /// The base rate at every step.
    #[default]
    Constant,
    /// `base * decay_rate ^ (step / decay_steps)`, with integer division when `staircase`.
    ExponentialDecay {
        decay_steps: u64,
        decay_rate: TensorData,
        #[serde(default)]
        staircase: bool,
    },
}

impl LearningRateSchedule {
    pub fn learning_rate(&self, base: TensorData, global_step: u64) -> TensorData {
        match *self {
            LearningRateSchedule::Constant => base,
            LearningRateSchedule::ExponentialDecay {
                decay_steps,
                decay_rate,
                staircase,
            } => {
                let decay_steps = decay_steps.max(1);
                let exponent = if staircase {
                    (global_step / decay_steps) as TensorData
                } else {
                    global_step as TensorData / decay_steps as TensorData
                };
                base * decay_rate.powf(exponent)
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match *self {
            LearningRateSchedule::Constant => true,
            LearningRateSchedule::ExponentialDecay {
                decay_steps,
                decay_rate,
                ..
            } => decay_steps > 0 && decay_rate > 0.0 && decay_rate.is_finite(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_decay_values() {
        let smooth = LearningRateSchedule::ExponentialDecay {
            decay_steps: 100,
            decay_rate: 0.1,
            staircase: false,
        };
        assert_eq!(smooth.learning_rate(1.0, 0), 1.0);
        assert!((smooth.learning_rate(1.0, 100) - 0.1).abs() < 1e-6);
        assert!((smooth.learning_rate(1.0, 50) - 0.1f32.sqrt()).abs() < 1e-6);

        let stairs = LearningRateSchedule::ExponentialDecay {
            decay_steps: 100,
            decay_rate: 0.1,
            staircase: true,
        };
        assert_eq!(stairs.learning_rate(1.0, 99), 1.0);
        assert_eq!(LearningRateSchedule::Constant.learning_rate(0.5, 1_000), 0.5);
    }

    #[test]
    fn parses_from_json() {
        let s: LearningRateSchedule =
            serde_json::from_str(r#"{"kind":"exponential_decay","decay_steps":10,"decay_rate":0.5}"#)
                .unwrap();
        assert!(s.is_valid());
        let c: LearningRateSchedule = serde_json::from_str(r#"{"kind":"constant"}"#).unwrap();
        assert_eq!(c, LearningRateSchedule::Constant);
    }
}
