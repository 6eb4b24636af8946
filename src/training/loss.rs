//! Ordinal-distance weighted cross-entropy.
//!
//! Each sample's cross-entropy is multiplied by `|argmax(logits) - label| + 1`,
//! so a prediction that lands several grades away from the truth costs more
//! than an adjacent-grade confusion. The weight is taken from the current
//! prediction at every step and carries no gradient.

use burn::tensor::{activation::log_softmax, backend::Backend, Int, Tensor};

/// Result of scoring one batch
#[derive(Debug, Clone)]
pub struct OrdinalLossOutput<B: Backend> {
    /// Unreduced cross-entropy per sample, shape `[batch]`
    pub per_sample: Tensor<B, 1>,
    /// Ordinal weight per sample, shape `[batch]`, every entry >= 1
    pub distance: Tensor<B, 1>,
    /// Batch mean of `distance * per_sample`, shape `[1]`
    pub loss: Tensor<B, 1>,
}

/// Distance-weighted cross-entropy over stage-space labels
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdinalLoss;

impl OrdinalLoss {
    pub fn new() -> Self {
        Self
    }

    /// Score `logits` (`[batch, classes]`) against remapped `targets` (`[batch]`)
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> OrdinalLossOutput<B> {
        let [batch_size, _num_classes] = logits.dims();

        let predicted = logits.clone().detach().argmax(1).squeeze::<1>(1);

        let log_probs = log_softmax(logits, 1);
        let per_sample = log_probs
            .gather(1, targets.clone().reshape([batch_size, 1]))
            .squeeze::<1>(1)
            .neg();

        let distance = (predicted.float() - targets.float()).abs().add_scalar(1.0);
        let loss = (per_sample.clone() * distance.clone()).mean();

        OrdinalLossOutput {
            per_sample,
            distance,
            loss,
        }
    }
}

/// Host-side ordinal weight for a single prediction/label pair
pub fn ordinal_distance(prediction: usize, label: usize) -> usize {
    prediction.abs_diff(label) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{ElementConversion, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_ordinal_distance_is_at_least_one() {
        for p in 0..6 {
            for l in 0..6 {
                let d = ordinal_distance(p, l);
                assert!(d >= 1);
                assert_eq!(d == 1, p == l);
            }
        }
        assert_eq!(ordinal_distance(0, 4), 5);
    }

    #[test]
    fn test_loss_weights_far_misses_by_distance() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![2.0f32, 0.0, 0.0, 0.0, 0.0, 3.0], [2, 3]),
            &device,
        );
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 0], [2]), &device);

        let out = OrdinalLoss::new().forward(logits, targets);

        let e2 = 2.0f64.exp();
        let e3 = 3.0f64.exp();
        let ce0 = -(e2 / (e2 + 2.0)).ln();
        let ce1 = -(1.0 / (2.0 + e3)).ln();
        // sample 0 predicted correctly (weight 1), sample 1 predicted grade 2 for grade 0 (weight 3)
        let expected = (ce0 * 1.0 + ce1 * 3.0) / 2.0;

        let distance: Vec<f32> = out.distance.into_data().iter::<f32>().collect();
        assert_eq!(distance, vec![1.0, 3.0]);

        let per_sample: Vec<f32> = out.per_sample.into_data().iter::<f32>().collect();
        assert!((per_sample[0] as f64 - ce0).abs() < 1e-4);
        assert!((per_sample[1] as f64 - ce1).abs() < 1e-4);

        let loss: f64 = out.loss.into_scalar().elem();
        assert!((loss - expected).abs() < 1e-4);
    }

    #[test]
    fn test_correct_predictions_reduce_to_cross_entropy() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![0.1f32, 1.5, 4.0, -1.0], [2, 2]),
            &device,
        );
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![1i64, 0], [2]), &device);

        let out = OrdinalLoss::new().forward(logits, targets);
        let mean_ce: f64 = out.per_sample.mean().into_scalar().elem();
        let loss: f64 = out.loss.into_scalar().elem();

        assert!((mean_ce - loss).abs() < 1e-6);
    }
}
