use crate::candle_metric_sink::{to_scalar_f32, MetricSink};

use candle_core::{DType, Result, Tensor};

/// Observation model of the decoder output, fixing the reconstruction
/// negative log-likelihood: Bernoulli is summed binary cross entropy,
/// Gaussian is summed squared error, Laplace is summed absolute error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconDistribution {
    Bernoulli,
    Gaussian,
    Laplace,
}

impl std::str::FromStr for ReconDistribution {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "bernoulli" => Ok(Self::Bernoulli),
            "gaussian" => Ok(Self::Gaussian),
            "laplace" => Ok(Self::Laplace),
            _ => anyhow::bail!("Unknown reconstruction distribution: {}", s),
        }
    }
}

/// Per-batch reconstruction negative log-likelihood
///
/// Sums over every element of the batch, then divides by the batch size
/// (dim 0), so the value is per sample rather than per element.
///
/// * `x` - observed data, dim 0 is the batch axis
/// * `recon_x` - reconstruction, same shape; probabilities in [0, 1]
///   for the Bernoulli model
/// * `distribution` - observation model
/// * `sink` - records the scalar under "recon_loss" when present
pub fn reconstruction_loss(
    x: &Tensor,
    recon_x: &Tensor,
    distribution: ReconDistribution,
    sink: Option<&mut (dyn MetricSink + '_)>,
) -> Result<Tensor> {
    let batch_size = x.dim(0)?;

    let loss = match distribution {
        ReconDistribution::Bernoulli => {
            let eps = 1e-7;
            let p = recon_x.clamp(eps, 1.0 - eps)?;
            let llik = (x.mul(&p.log()?)? + (1.0 - x)?.mul(&(1.0 - &p)?.log()?)?)?;
            llik.sum_all()?.neg()?
        }
        ReconDistribution::Gaussian => {
            // squared error in [0, 255] space, shrunk back by 255 to keep
            // the magnitude comparable to the Bernoulli model
            (((recon_x - x)? * 255.)?.powf(2.)?.sum_all()? / 255.)?
        }
        ReconDistribution::Laplace => {
            let l1 = ((recon_x - x)?.abs()?.sum_all()? * 3.)?;
            // an exactly-zero loss feeds 0 * log(0) into the backward pass
            l1.gt(0.0)?.where_cond(&l1, &l1.zeros_like()?)?
        }
    };

    let loss = (loss / batch_size as f64)?;

    if let Some(sink) = sink {
        sink.record("recon_loss", to_scalar_f32(&loss)?);
    }

    Ok(loss)
}

/// KL divergence of N(mean, exp(lnvar)) from the unit Gaussian,
/// batch-averaged per latent dimension and summed over dimensions
///
/// kl_d = 0.5 * mean_n( -1 - lnvar + mean^2 + exp(lnvar) )
///
/// * `z_mean_nk` - posterior means (n x k)
/// * `z_lnvar_nk` - posterior log variances (n x k)
/// * `sink` - records the total under "kl_loss" and each dimension
///   under "kl_loss_<d>" when present
pub fn kl_normal_loss(
    z_mean_nk: &Tensor,
    z_lnvar_nk: &Tensor,
    sink: Option<&mut (dyn MetricSink + '_)>,
) -> Result<Tensor> {
    let latent_kl_k =
        ((z_lnvar_nk.exp()? - 1. + z_mean_nk.powf(2.)? - z_lnvar_nk)?.mean(0)? * 0.5)?;
    let total_kl = latent_kl_k.sum_all()?;

    if let Some(sink) = sink {
        sink.record("kl_loss", to_scalar_f32(&total_kl)?);
        let per_dim = latent_kl_k.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        for (d, v) in per_dim.iter().enumerate() {
            sink.record(&format!("kl_loss_{}", d), *v);
        }
    }

    Ok(total_kl)
}
