use crate::candle_gaussian_density::{
    log_density_gaussian, log_importance_weight_matrix, matrix_log_density_gaussian,
};

use candle_core::{Result, Tensor};

/// Per-sample log densities entering the decomposed KL
///
/// Each field is a length-n vector over the minibatch.
pub struct LatentLogDensities {
    /// log p(z_i) under the standard normal prior
    pub log_pz_n: Tensor,
    /// log q(z_i), estimated by mixing over the batch
    pub log_qz_n: Tensor,
    /// sum_d log q(z_i[d]), the independence baseline
    pub log_prod_qzi_n: Tensor,
    /// log q(z_i | x_i), each sample under its own posterior
    pub log_qz_cx_n: Tensor,
}

/// Decompose a latent batch into the four log densities behind the
/// mutual-information / total-correlation / dimension-wise-KL split.
///
/// The marginal estimators mix each sample over every posterior in the
/// batch: a dense n x n x k cross log-density matrix is reduced by
/// logsumexp over the batch axis, either row-summed first (joint
/// marginal) or per dimension (product of marginals). With `is_mss` the
/// matrix is reweighted by the stratified-sampling importance weights so
/// the estimate is unbiased for the full training set of `n_data`
/// samples rather than the minibatch.
///
/// * `z_nk` - reparameterized latent samples (n x k)
/// * `z_mean_nk` - posterior means (n x k)
/// * `z_lnvar_nk` - posterior log variances (n x k)
/// * `n_data` - training set size
/// * `is_mss` - minibatch stratified instead of weighted sampling
pub fn decompose_latent_log_densities(
    z_nk: &Tensor,
    z_mean_nk: &Tensor,
    z_lnvar_nk: &Tensor,
    n_data: usize,
    is_mss: bool,
) -> Result<LatentLogDensities> {
    let (n, _k) = z_nk.dims2()?;

    let log_qz_cx_n = log_density_gaussian(z_nk, z_mean_nk, z_lnvar_nk)?.sum(1)?;

    let zeros_nk = Tensor::zeros_like(z_nk)?;
    let log_pz_n = log_density_gaussian(z_nk, &zeros_nk, &zeros_nk)?.sum(1)?;

    let mut mat_log_qz_nnk = matrix_log_density_gaussian(z_nk, z_mean_nk, z_lnvar_nk)?;

    if is_mss {
        let log_iw_nn1 = log_importance_weight_matrix(n, n_data, z_nk.device())?
            .to_dtype(z_nk.dtype())?
            .reshape((n, n, 1))?;
        mat_log_qz_nnk = mat_log_qz_nnk.broadcast_add(&log_iw_nn1)?;
    }

    let log_qz_n = mat_log_qz_nnk.sum(2)?.log_sum_exp(1)?;
    let log_prod_qzi_n = mat_log_qz_nnk.log_sum_exp(1)?.sum(1)?;

    Ok(LatentLogDensities {
        log_pz_n,
        log_qz_n,
        log_prod_qzi_n,
        log_qz_cx_n,
    })
}
