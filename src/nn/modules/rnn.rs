//! # Recurrent Layer Modules
//!
//! A basic LSTM cell, a multi-layer stack of cells unrolled over time, and a
//! bidirectional wrapper that runs two stacks over the sequence and its
//! time-reversed copy.
//!
//! Sequences are batch-major: `[batch, timesteps, features]`.

use super::activation::Activation;
use crate::nn::Module;
use crate::tensor::{glorot_uniform, ops, zeros, Tensor, TensorData, TensorError};
use rand::Rng;
use std::collections::BTreeMap;

/// Added to the forget gate pre-activation so a fresh cell starts out remembering.
pub const FORGET_BIAS: TensorData = 1.0;

/// Basic LSTM cell.
///
/// `[i, j, f, o] = x W_x + h W_h + b`
/// `c' = c * sigmoid(f + FORGET_BIAS) + sigmoid(i) * act(j)`
/// `h' = act(c') * sigmoid(o)`
#[derive(Debug)]
pub struct LstmCell {
    pub kernel_input: Tensor,  // [input_size, 4 * units]
    pub kernel_hidden: Tensor, // [units, 4 * units]
    pub bias: Tensor,          // [4 * units]
    input_size: usize,
    units: usize,
    activation: Activation,
}

impl LstmCell {
    /// Kernels are Glorot-uniform over the concatenated `[input; hidden]` fan-in,
    /// the bias starts at zero.
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        units: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let fan_in = input_size + units;
        let fan_out = 4 * units;
        LstmCell {
            kernel_input: glorot_uniform(&[input_size, fan_out], fan_in, fan_out, rng),
            kernel_hidden: glorot_uniform(&[units, fan_out], fan_in, fan_out, rng),
            bias: zeros(&[fan_out], true),
            input_size,
            units,
            activation,
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Zero `(h, c)` for a batch.
    pub fn zero_state(&self, batch: usize) -> (Tensor, Tensor) {
        (zeros(&[batch, self.units], false), zeros(&[batch, self.units], false))
    }

    /// Advances the cell by one time step. `x` is `[batch, input_size]`.
    pub fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor), TensorError> {
        if x.ndim() != 2 || x.shape()[1] != self.input_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![x.shape().first().copied().unwrap_or(0), self.input_size],
                got: x.shape().to_vec(),
            });
        }
        let gates = ops::add(
            &ops::add(
                &ops::matmul(x, &self.kernel_input)?,
                &ops::matmul(h, &self.kernel_hidden)?,
            )?,
            &self.bias,
        )?;
        let u = self.units;
        let i = ops::narrow(&gates, 1, 0, u)?;
        let j = ops::narrow(&gates, 1, u, u)?;
        let f = ops::narrow(&gates, 1, 2 * u, u)?;
        let o = ops::narrow(&gates, 1, 3 * u, u)?;

        let keep = ops::sigmoid(&ops::add_scalar(&f, FORGET_BIAS)?)?;
        let write = ops::mul(&ops::sigmoid(&i)?, &self.activation.apply(&j)?)?;
        let new_c = ops::add(&ops::mul(c, &keep)?, &write)?;
        let new_h = ops::mul(&self.activation.apply(&new_c)?, &ops::sigmoid(&o)?)?;
        Ok((new_h, new_c))
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        params.insert("kernel_input".to_string(), self.kernel_input.clone());
        params.insert("kernel_hidden".to_string(), self.kernel_hidden.clone());
        params.insert("bias".to_string(), self.bias.clone());
        params
    }
}

/// Several LSTM cells stacked on top of each other; the output of layer `l`
/// at time `t` is the input of layer `l + 1` at time `t`.
#[derive(Debug)]
pub struct StackedLstm {
    cells: Vec<LstmCell>,
}

impl StackedLstm {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        units: &[usize],
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        if units.is_empty() || units.contains(&0) {
            return Err(TensorError::Generic(format!(
                "LSTM stack needs at least one layer of positive width, got {:?}",
                units
            )));
        }
        let mut cells = Vec::with_capacity(units.len());
        let mut in_size = input_size;
        for &n in units {
            cells.push(LstmCell::new(in_size, n, activation, rng));
            in_size = n;
        }
        Ok(StackedLstm { cells })
    }

    pub fn cells(&self) -> &[LstmCell] {
        &self.cells
    }

    /// Width of the top layer.
    pub fn output_size(&self) -> usize {
        self.cells.last().map(LstmCell::units).unwrap_or(0)
    }

    /// Runs the whole sequence and returns the top layer's output at the last step.
    pub fn last_output(&self, x: &Tensor) -> Result<Tensor, TensorError> {
        if x.ndim() != 3 {
            return Err(TensorError::Generic(format!(
                "LSTM expects [batch, timesteps, features], got {:?}",
                x.shape()
            )));
        }
        let (batch, steps) = (x.shape()[0], x.shape()[1]);
        if steps == 0 {
            return Err(TensorError::Generic("LSTM input has zero timesteps".to_string()));
        }
        let mut states: Vec<(Tensor, Tensor)> =
            self.cells.iter().map(|cell| cell.zero_state(batch)).collect();
        let mut top = None;
        for t in 0..steps {
            let mut layer_input = ops::select(x, 1, t)?;
            for (cell, state) in self.cells.iter().zip(states.iter_mut()) {
                let (h, c) = cell.step(&layer_input, &state.0, &state.1)?;
                layer_input = h.clone();
                *state = (h, c);
            }
            top = Some(layer_input);
        }
        top.ok_or_else(|| TensorError::Generic("LSTM produced no output".to_string()))
    }
}

impl Module for StackedLstm {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        self.last_output(input)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        for (l, cell) in self.cells.iter().enumerate() {
            for (name, param) in cell.parameters() {
                params.insert(format!("layer{}.{}", l, name), param);
            }
        }
        params
    }
}

/// Bidirectional stacked LSTM.
///
/// The forward stack reads the sequence as given, the backward stack reads it
/// reversed along time. The output concatenates the last top-layer output of
/// each direction: `[batch, 2 * units.last()]`.
#[derive(Debug)]
pub struct BiLstm {
    forward: StackedLstm,
    backward: StackedLstm,
}

impl BiLstm {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        units: &[usize],
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        Ok(BiLstm {
            forward: StackedLstm::new(input_size, units, activation, rng)?,
            backward: StackedLstm::new(input_size, units, activation, rng)?,
        })
    }

    pub fn output_size(&self) -> usize {
        self.forward.output_size() + self.backward.output_size()
    }

    pub fn forward_stack(&self) -> &StackedLstm {
        &self.forward
    }

    pub fn backward_stack(&self) -> &StackedLstm {
        &self.backward
    }
}

impl Module for BiLstm {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        let fwd = self.forward.last_output(input)?;
        let reversed = ops::reverse(input, 1)?;
        let bwd = self.backward.last_output(&reversed)?;
        ops::concat(&[&fwd, &bwd], 1)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        for (name, p) in self.forward.parameters() {
            params.insert(format!("forward.{}", name), p);
        }
        for (name, p) in self.backward.parameters() {
            params.insert(format!("backward.{}", name), p);
        }
        params
    }
}
