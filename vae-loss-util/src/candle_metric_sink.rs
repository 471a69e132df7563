use candle_core::{DType, Result, Tensor};
use std::collections::HashMap;

/// Destination for scalar training diagnostics.
///
/// The loss engines only append; reading the values back is the owner's
/// business (the training loop, a plotter, a report writer).
pub trait MetricSink {
    fn record(&mut self, name: &str, value: f32);
}

/// In-memory metric log: name -> values in call order.
#[derive(Clone, Debug, Default)]
pub struct MetricStore {
    values: HashMap<String, Vec<f32>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    pub fn num_records(&self, name: &str) -> usize {
        self.values.get(name).map_or(0, |v| v.len())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl MetricSink for MetricStore {
    fn record(&mut self, name: &str, value: f32) {
        self.values.entry(name.to_string()).or_default().push(value);
    }
}

/// Pull a rank-0 tensor down to an f32 for recording.
pub fn to_scalar_f32(x: &Tensor) -> Result<f32> {
    x.to_dtype(DType::F32)?.to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_appends_in_call_order() {
        let mut store = MetricStore::new();
        assert!(store.is_empty());

        store.record("loss", 1.0);
        store.record("loss", 0.5);
        store.record("recon_loss", 2.0);

        assert_eq!(store.get("loss"), Some(&[1.0, 0.5][..]));
        assert_eq!(store.num_records("recon_loss"), 1);
        assert_eq!(store.num_records("missing"), 0);
        assert!(store.get("missing").is_none());
    }
}
