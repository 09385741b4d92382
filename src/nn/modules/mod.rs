//! # Neural Network Layer Modules
//!
//! Layers used by the recurrent classifier.

pub mod linear;
pub use linear::{Linear, WeightInit};

pub mod activation;
pub use activation::Activation;

pub mod dropout;
pub use dropout::Dropout;

pub mod rnn;
pub use rnn::{BiLstm, LstmCell, StackedLstm};
