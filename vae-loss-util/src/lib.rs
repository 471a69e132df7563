//! Training losses for variational autoencoders.
//!
//! The engines in [`candle_vae_loss`] return a rank-0 tensor suitable for
//! `Optimizer::backward_step`; diagnostics go to an optional
//! [`candle_metric_sink::MetricSink`] owned by the training loop.

pub mod candle_gaussian_density;
pub mod candle_kl_decomposition;
pub mod candle_loss_functions;
pub mod candle_metric_sink;
pub mod candle_vae_loss;

pub use candle_core;
pub use candle_nn;
