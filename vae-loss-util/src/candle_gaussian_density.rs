use candle_core::{Device, Result, Tensor};

/// Log density of a diagonal Gaussian
///
/// log N(x; mu, exp(lnvar)) = -0.5 * [ (x - mu)^2 / var + lnvar + ln(2 pi) ]
///
/// Inputs broadcast, so the same formula serves both the per-sample
/// density (all shapes n x k) and the batch-pairwise matrix below.
///
/// * `x` - evaluation points
/// * `mu` - mean of Gaussian distribution
/// * `lnvar` - log variance of Gaussian distribution
pub fn log_density_gaussian(x: &Tensor, mu: &Tensor, lnvar: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let inv_var = lnvar.neg()?.exp()?;
    let sq = x.broadcast_sub(mu)?.powf(2.)?;
    (sq.broadcast_mul(&inv_var)?.broadcast_add(lnvar)? + ln_2pi)? * (-0.5)
}

/// Cross log density of every sample against every posterior in a batch
///
/// out[i,j,d] = log N(z[i,d]; mu[j,d], exp(lnvar[j,d]))
///
/// * `z_nk` - latent samples (n x k)
/// * `mu_nk` - posterior means (n x k)
/// * `lnvar_nk` - posterior log variances (n x k)
///
/// # Returns `n x n x k` tensor
pub fn matrix_log_density_gaussian(
    z_nk: &Tensor,
    mu_nk: &Tensor,
    lnvar_nk: &Tensor,
) -> Result<Tensor> {
    let (n, k) = z_nk.dims2()?;
    let z_n1k = z_nk.reshape((n, 1, k))?;
    let mu_1nk = mu_nk.reshape((1, n, k))?;
    let lnvar_1nk = lnvar_nk.reshape((1, n, k))?;
    log_density_gaussian(&z_n1k, &mu_1nk, &lnvar_1nk)
}

/// Log importance weights for minibatch stratified sampling, after
/// Chen et al. (2018), "Isolating Sources of Disentanglement in VAEs."
///
/// With M = batch_size - 1 and N = n_data, the exponentiated matrix has
/// column 0 = 1/N, column 1 = (N - M)/(N M), every other entry 1/M, and
/// entry [M-1, 0] = (N - M)/(N M). Written with the same flattened
/// stride-(M+1) passes as the published estimator so the two agree
/// entry for entry.
///
/// Returns an f64 tensor (batch_size x batch_size); cast to the latent
/// dtype before adding to a log-density matrix.
pub fn log_importance_weight_matrix(
    batch_size: usize,
    n_data: usize,
    device: &Device,
) -> Result<Tensor> {
    debug_assert!(batch_size > 1);
    debug_assert!(n_data >= batch_size);

    let n = n_data as f64;
    let m = (batch_size - 1) as f64;
    let strat_weight = (n - m) / (n * m);

    let mut w = vec![1.0 / m; batch_size * batch_size];
    let mut i = 0;
    while i < w.len() {
        w[i] = 1.0 / n;
        i += batch_size;
    }
    let mut i = 1;
    while i < w.len() {
        w[i] = strat_weight;
        i += batch_size;
    }
    w[(batch_size - 2) * batch_size] = strat_weight;

    let log_w = w.into_iter().map(f64::ln).collect::<Vec<_>>();
    Tensor::from_vec(log_w, (batch_size, batch_size), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn log_density_at_mean_unit_variance() -> Result<()> {
        // At x = mu with var = 1 the density is -0.5 * ln(2 pi) per element
        let device = Device::Cpu;
        let x = Tensor::zeros((3, 4), DType::F64, &device)?;
        let zeros = Tensor::zeros((3, 4), DType::F64, &device)?;

        let log_p = log_density_gaussian(&x, &zeros, &zeros)?;
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln();

        for v in log_p.flatten_all()?.to_vec1::<f64>()? {
            assert!((v - expected).abs() < 1e-12, "{} vs {}", v, expected);
        }
        Ok(())
    }

    #[test]
    fn matrix_diagonal_matches_own_density() -> Result<()> {
        let device = Device::Cpu;
        let n = 5;
        let k = 3;
        let z = Tensor::randn(0f64, 1f64, (n, k), &device)?;
        let mu = Tensor::randn(0f64, 1f64, (n, k), &device)?;
        let lnvar = (Tensor::randn(0f64, 1f64, (n, k), &device)? * 0.1)?;

        let mat = matrix_log_density_gaussian(&z, &mu, &lnvar)?;
        assert_eq!(mat.dims(), &[n, n, k]);

        let own = log_density_gaussian(&z, &mu, &lnvar)?;
        for i in 0..n {
            let diag_k = mat.get(i)?.get(i)?.to_vec1::<f64>()?;
            let own_k = own.get(i)?.to_vec1::<f64>()?;
            for (a, b) in diag_k.iter().zip(own_k.iter()) {
                assert!((a - b).abs() < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn importance_weights_match_published_estimator() -> Result<()> {
        let device = Device::Cpu;
        let batch_size = 4;
        let n_data = 100;
        let m = (batch_size - 1) as f64;
        let n = n_data as f64;
        let strat_weight = (n - m) / (n * m);

        let w = log_importance_weight_matrix(batch_size, n_data, &device)?
            .exp()?
            .to_vec2::<f64>()?;

        for (i, row) in w.iter().enumerate() {
            let col0 = if i == batch_size - 2 { strat_weight } else { 1.0 / n };
            assert!((row[0] - col0).abs() < 1e-12, "row {}", i);
            assert!((row[1] - strat_weight).abs() < 1e-12, "row {}", i);
            for &v in &row[2..] {
                assert!((v - 1.0 / m).abs() < 1e-12, "row {}", i);
            }
        }
        Ok(())
    }
}
