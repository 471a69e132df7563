use crate::candle_kl_decomposition::decompose_latent_log_densities;
use crate::candle_loss_functions::{kl_normal_loss, reconstruction_loss, ReconDistribution};
use crate::candle_metric_sink::{to_scalar_f32, MetricSink};

use candle_core::{Result, Tensor};
use log::debug;
use rand::seq::SliceRandom;

/// Loss family selector for [`build_vae_loss`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaeLossKind {
    BetaH,
    Btcvae,
}

impl std::str::FromStr for VaeLossKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "betah" | "beta-h" | "beta_h" => Ok(Self::BetaH),
            "btcvae" => Ok(Self::Btcvae),
            _ => anyhow::bail!("Unknown loss: {}", s),
        }
    }
}

/// Construction parameters for the loss engines.
#[derive(Debug, Clone)]
pub struct VaeLossConfig {
    pub loss_kind: VaeLossKind,
    pub rec_dist: ReconDistribution,
    /// Record diagnostics every this many training steps.
    pub record_loss_every: usize,
    /// Training steps over which the regularization weight ramps 0 -> 1.
    pub steps_anneal: usize,
    /// KL weight of the beta-H loss.
    pub beta_h: f64,
    /// Training set size; required by the btcvae importance weighting.
    pub n_data: usize,
    /// Weight of the mutual information term.
    pub btcvae_alpha: f64,
    /// Weight of the total correlation term.
    pub btcvae_beta: f64,
    /// Weight of the dimension-wise KL term.
    pub btcvae_gamma: f64,
    /// Minibatch stratified instead of weighted sampling.
    pub is_mss: bool,
}

impl Default for VaeLossConfig {
    fn default() -> Self {
        Self {
            loss_kind: VaeLossKind::BetaH,
            rec_dist: ReconDistribution::Bernoulli,
            record_loss_every: 50,
            steps_anneal: 0,
            beta_h: 4.0,
            n_data: 0,
            btcvae_alpha: 1.0,
            btcvae_beta: 6.0,
            btcvae_gamma: 1.0,
            is_mss: true,
        }
    }
}

/// A VAE training loss over candle tensors.
///
/// `compute` returns a rank-0 tensor ready for `backward_step`. The step
/// counter advances once per training-mode call; diagnostics are
/// recorded on every evaluation-mode call and every
/// `record_loss_every`-th training call, starting from the first.
pub trait VaeLossT {
    /// * `x` - data batch, dim 0 is the batch axis
    /// * `recon_x` - reconstruction, same shape as `x`
    /// * `latent_dist` - posterior sufficient statistics (mean, lnvar),
    ///   each n x k
    /// * `latent_sample` - reparameterized draw used in the forward pass
    ///   (n x k); required by the btcvae loss
    /// * `train` - whether currently in training mode
    /// * `sink` - optional diagnostic log owned by the caller
    fn compute(
        &mut self,
        x: &Tensor,
        recon_x: &Tensor,
        latent_dist: (&Tensor, &Tensor),
        latent_sample: Option<&Tensor>,
        train: bool,
        sink: Option<&mut dyn MetricSink>,
    ) -> Result<Tensor>;

    fn name(&self) -> &'static str;
}

/// Build a loss engine from its configuration.
pub fn build_vae_loss(config: &VaeLossConfig) -> anyhow::Result<Box<dyn VaeLossT>> {
    match config.loss_kind {
        VaeLossKind::BetaH => {
            debug!("beta-h loss: beta = {}", config.beta_h);
            Ok(Box::new(BetaHLoss::new(config)))
        }
        VaeLossKind::Btcvae => {
            if config.n_data == 0 {
                anyhow::bail!("btcvae loss needs the training set size (n_data)");
            }
            debug!(
                "btcvae loss: alpha = {}, beta = {}, gamma = {}, n_data = {}, mss = {}",
                config.btcvae_alpha,
                config.btcvae_beta,
                config.btcvae_gamma,
                config.n_data,
                config.is_mss
            );
            Ok(Box::new(BtcvaeLoss::new(config)))
        }
    }
}

/// Linear ramp of a regularization weight over training steps.
///
/// Returns `fin` when `annealing_steps` is zero, otherwise
/// `min(init + (fin - init) * step / annealing_steps, fin)`.
/// Requires `fin > init`.
pub fn linear_annealing(init: f64, fin: f64, step: usize, annealing_steps: usize) -> f64 {
    if annealing_steps == 0 {
        return fin;
    }
    debug_assert!(fin > init);
    let delta = fin - init;
    (init + delta * step as f64 / annealing_steps as f64).min(fin)
}

/// Shuffle each latent dimension independently across the batch,
/// breaking the joint distribution while keeping every marginal intact
/// (the factorised-q sample of Kim & Mnih, 2018).
pub fn permute_latent_dims(z_nk: &Tensor) -> Result<Tensor> {
    let (n, k) = z_nk.dims2()?;
    let mut rng = rand::rng();

    let mut columns = Vec::with_capacity(k);
    for j in 0..k {
        let mut perm: Vec<u32> = (0..n as u32).collect();
        perm.shuffle(&mut rng);
        let perm = Tensor::from_vec(perm, (n,), z_nk.device())?;
        columns.push(z_nk.narrow(1, j, 1)?.contiguous()?.index_select(&perm, 0)?);
    }
    Tensor::cat(&columns, 1)
}

/// Step bookkeeping shared by the loss engines.
struct LossState {
    n_train_steps: usize,
    record_loss_every: usize,
    rec_dist: ReconDistribution,
    steps_anneal: usize,
}

impl LossState {
    fn new(config: &VaeLossConfig) -> Self {
        Self {
            n_train_steps: 0,
            record_loss_every: config.record_loss_every.max(1),
            rec_dist: config.rec_dist,
            steps_anneal: config.steps_anneal,
        }
    }

    /// Advance the step counter (training only) and decide whether this
    /// call records diagnostics.
    fn pre_call(&mut self, train: bool) -> bool {
        if train {
            self.n_train_steps += 1;
        }
        !train || self.n_train_steps % self.record_loss_every == 1
    }

    fn anneal_reg(&self, train: bool) -> f64 {
        if train {
            linear_annealing(0., 1., self.n_train_steps, self.steps_anneal)
        } else {
            1.
        }
    }
}

/// Reconstruction plus beta-weighted KL to the unit Gaussian
/// (Higgins et al., 2016).
pub struct BetaHLoss {
    state: LossState,
    beta: f64,
}

impl BetaHLoss {
    pub fn new(config: &VaeLossConfig) -> Self {
        Self {
            state: LossState::new(config),
            beta: config.beta_h,
        }
    }
}

impl VaeLossT for BetaHLoss {
    fn compute(
        &mut self,
        x: &Tensor,
        recon_x: &Tensor,
        latent_dist: (&Tensor, &Tensor),
        _latent_sample: Option<&Tensor>,
        train: bool,
        sink: Option<&mut dyn MetricSink>,
    ) -> Result<Tensor> {
        let recording = self.state.pre_call(train);
        let mut sink = if recording { sink } else { None };

        let (z_mean_nk, z_lnvar_nk) = latent_dist;

        let rec_loss = reconstruction_loss(x, recon_x, self.state.rec_dist, sink.as_deref_mut())?;
        let kl_loss = kl_normal_loss(z_mean_nk, z_lnvar_nk, sink.as_deref_mut())?;

        let anneal_reg = self.state.anneal_reg(train);
        let loss = (rec_loss + (kl_loss * (anneal_reg * self.beta))?)?;

        if let Some(sink) = sink {
            sink.record("loss", to_scalar_f32(&loss)?);
        }
        Ok(loss)
    }

    fn name(&self) -> &'static str {
        "beta-h"
    }
}

/// Decomposed KL loss with minibatch weighted or stratified sampling
/// (Chen et al., 2018): the KL to the prior is split into mutual
/// information, total correlation, and dimension-wise KL, each with its
/// own weight, so information loss, latent dependence, and per-dimension
/// prior divergence are penalized independently.
pub struct BtcvaeLoss {
    state: LossState,
    n_data: usize,
    alpha: f64,
    beta: f64,
    gamma: f64,
    is_mss: bool,
}

impl BtcvaeLoss {
    pub fn new(config: &VaeLossConfig) -> Self {
        Self {
            state: LossState::new(config),
            n_data: config.n_data,
            alpha: config.btcvae_alpha,
            beta: config.btcvae_beta,
            gamma: config.btcvae_gamma,
            is_mss: config.is_mss,
        }
    }
}

impl VaeLossT for BtcvaeLoss {
    fn compute(
        &mut self,
        x: &Tensor,
        recon_x: &Tensor,
        latent_dist: (&Tensor, &Tensor),
        latent_sample: Option<&Tensor>,
        train: bool,
        sink: Option<&mut dyn MetricSink>,
    ) -> Result<Tensor> {
        let recording = self.state.pre_call(train);
        let mut sink = if recording { sink } else { None };

        let z_nk = match latent_sample {
            Some(z_nk) => z_nk,
            None => candle_core::bail!("btcvae loss needs the reparameterized latent sample"),
        };
        let (z_mean_nk, z_lnvar_nk) = latent_dist;

        let rec_loss = reconstruction_loss(x, recon_x, self.state.rec_dist, sink.as_deref_mut())?;

        let ld =
            decompose_latent_log_densities(z_nk, z_mean_nk, z_lnvar_nk, self.n_data, self.is_mss)?;

        // I[z;x] = E_x[ KL[q(z|x) || q(z)] ]
        let mi_loss = ld.log_qz_cx_n.sub(&ld.log_qz_n)?.mean_all()?;
        // TC[z] = KL[q(z) || prod_d q(z_d)]
        let tc_loss = ld.log_qz_n.sub(&ld.log_prod_qzi_n)?.mean_all()?;
        // KL[prod_d q(z_d) || p(z)], per-dimension divergence from the prior
        let dw_kl_loss = ld.log_prod_qzi_n.sub(&ld.log_pz_n)?.mean_all()?;

        let anneal_reg = self.state.anneal_reg(train);
        let loss = (&rec_loss
            + (&mi_loss * self.alpha)?
            + (&tc_loss * self.beta)?
            + (&dw_kl_loss * (anneal_reg * self.gamma))?)?;

        if let Some(sink) = sink {
            sink.record("loss", to_scalar_f32(&loss)?);
            sink.record("mi_loss", to_scalar_f32(&mi_loss)?);
            sink.record("tc_loss", to_scalar_f32(&tc_loss)?);
            sink.record("dw_kl_loss", to_scalar_f32(&dw_kl_loss)?);
            // the undecomposed KL, recorded for comparison only
            kl_normal_loss(z_mean_nk, z_lnvar_nk, Some(sink))?;
        }

        Ok(loss)
    }

    fn name(&self) -> &'static str {
        "btcvae"
    }
}
