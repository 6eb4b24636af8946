//! Test-time augmentation
//!
//! Five geometric views of a batch are scored and their logits are added to
//! a caller-supplied base prediction. The result is a plain sum of six
//! passes, never an average, so ensembles keep the scale of their inputs.

use burn::prelude::*;

use crate::model::cnn::GradeModel;

/// Rotation angle of the TTA views, in degrees
pub const TTA_ROTATION_DEGREES: f32 = 10.0;

/// One geometric view of the input batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Augmentation {
    Rotate(f32),
    HFlip,
    /// Rotate first, then mirror
    HFlipRotate(f32),
}

impl Augmentation {
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match *self {
            Augmentation::Rotate(degrees) => rotate(images, degrees),
            Augmentation::HFlip => hflip(images),
            Augmentation::HFlipRotate(degrees) => hflip(rotate(images, degrees)),
        }
    }
}

/// The five views added on top of the base prediction
pub const TTA_AUGMENTATIONS: [Augmentation; 5] = [
    Augmentation::Rotate(TTA_ROTATION_DEGREES),
    Augmentation::Rotate(-TTA_ROTATION_DEGREES),
    Augmentation::HFlip,
    Augmentation::HFlipRotate(TTA_ROTATION_DEGREES),
    Augmentation::HFlipRotate(-TTA_ROTATION_DEGREES),
];

/// Mirror along the width axis
pub fn hflip<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.flip([3])
}

/// Source index and validity mask for every output pixel of an `h x w` plane
///
/// Positive degrees rotate the content counter-clockwise about the plane's
/// centre. Sampling is nearest-neighbour; outputs whose source falls outside
/// the plane get mask 0.
pub fn rotation_map(height: usize, width: usize, degrees: f32) -> (Vec<i64>, Vec<f32>) {
    let theta = (degrees as f64).to_radians();
    let (sin, cos) = theta.sin_cos();
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;

    let mut indices = Vec::with_capacity(height * width);
    let mut mask = Vec::with_capacity(height * width);

    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let xs = (cos * dx - sin * dy + cx).round();
            let ys = (sin * dx + cos * dy + cy).round();

            if xs >= 0.0 && ys >= 0.0 && xs < width as f64 && ys < height as f64 {
                indices.push(ys as i64 * width as i64 + xs as i64);
                mask.push(1.0);
            } else {
                indices.push(0);
                mask.push(0.0);
            }
        }
    }

    (indices, mask)
}

/// Rotate every channel of a `[B, C, H, W]` batch, zero-filling uncovered pixels
pub fn rotate<B: Backend>(images: Tensor<B, 4>, degrees: f32) -> Tensor<B, 4> {
    let [batch, channels, height, width] = images.dims();
    let plane = height * width;
    let device = images.device();

    let (indices, mask) = rotation_map(height, width, degrees);
    let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [plane]), &device);
    let mask = Tensor::<B, 1>::from_floats(TensorData::new(mask, [plane]), &device).reshape([1, 1, plane]);

    images
        .reshape([batch, channels, plane])
        .select(2, indices)
        .mul(mask)
        .reshape([batch, channels, height, width])
}

/// Sums model logits over the TTA views
#[derive(Debug, Clone)]
pub struct TtaEnsembler {
    augmentations: Vec<Augmentation>,
}

impl Default for TtaEnsembler {
    fn default() -> Self {
        Self {
            augmentations: TTA_AUGMENTATIONS.to_vec(),
        }
    }
}

impl TtaEnsembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of forward passes in a full ensemble, base included
    pub fn passes(&self) -> usize {
        self.augmentations.len() + 1
    }

    /// `base + Σ model(view(images))` over the five views
    pub fn augment_predict<B, M>(&self, base: Tensor<B, 2>, images: Tensor<B, 4>, model: &M) -> Tensor<B, 2>
    where
        B: Backend,
        M: GradeModel<B>,
    {
        self.augmentations
            .iter()
            .fold(base, |acc, aug| acc + model.logits(aug.apply(images.clone())))
    }

    /// Six-pass ensemble including the unaugmented prediction
    pub fn predict<B, M>(&self, images: Tensor<B, 4>, model: &M) -> Tensor<B, 2>
    where
        B: Backend,
        M: GradeModel<B>,
    {
        let base = model.logits(images.clone());
        self.augment_predict(base, images, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    struct ConstantModel(Vec<f32>);

    impl GradeModel<TestBackend> for ConstantModel {
        fn logits(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let batch = images.dims()[0];
            let classes = self.0.len();
            let data: Vec<f32> = (0..batch).flat_map(|_| self.0.iter().copied()).collect();
            Tensor::from_floats(TensorData::new(data, [batch, classes]), &images.device())
        }
    }

    /// Sum of the top-left pixel of every image
    struct CornerModel;

    impl GradeModel<TestBackend> for CornerModel {
        fn logits(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let [batch, _, _, _] = images.dims();
            images
                .slice([0..batch, 0..1, 0..1, 0..1])
                .reshape([batch, 1])
        }
    }

    fn plane(values: Vec<f32>, h: usize, w: usize) -> Tensor<TestBackend, 4> {
        Tensor::from_floats(TensorData::new(values, [1, 1, h, w]), &Default::default())
    }

    fn host(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_constant_model_sums_six_passes() {
        let model = ConstantModel(vec![0.5, -1.0, 2.0]);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &Default::default());
        let ensembler = TtaEnsembler::new();

        let base = model.logits(images.clone());
        let summed: Vec<f32> = ensembler
            .augment_predict(base, images, &model)
            .into_data()
            .iter::<f32>()
            .collect();

        assert_eq!(ensembler.passes(), 6);
        assert_eq!(summed, vec![3.0, -6.0, 12.0, 3.0, -6.0, 12.0]);
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let values: Vec<f32> = (0..20).map(|v| v as f32).collect();
        let rotated = rotate(plane(values.clone(), 4, 5), 0.0);
        assert_eq!(host(rotated), values);
    }

    #[test]
    fn test_half_turn_reverses_plane() {
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let rotated = rotate(plane(values.clone(), 3, 4), 180.0);
        let reversed: Vec<f32> = values.into_iter().rev().collect();
        assert_eq!(host(rotated), reversed);
    }

    #[test]
    fn test_positive_angle_is_counter_clockwise() {
        // top-right corner moves to the top-left
        let values: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let rotated = host(rotate(plane(values, 3, 3), 90.0));
        assert_eq!(rotated, vec![3.0, 6.0, 9.0, 2.0, 5.0, 8.0, 1.0, 4.0, 7.0]);
    }

    #[test]
    fn test_corners_outside_source_are_zero_filled() {
        let (_, mask) = rotation_map(4, 4, 45.0);
        assert_eq!(mask[0], 0.0);
        assert_eq!(mask[5], 1.0);

        let rotated = host(rotate(plane(vec![1.0; 16], 4, 4), 45.0));
        assert_eq!(rotated[0], 0.0);
        assert_eq!(rotated[5], 1.0);
    }

    #[test]
    fn test_hflip_mirrors_width() {
        let flipped = host(hflip(plane(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3)));
        assert_eq!(flipped, vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]);
    }

    #[test]
    fn test_views_reach_the_model() {
        // top-left pixel of each view: original 1, rot+10 1, rot-10 1, flip 3, flip∘rot 3, 3
        let images = plane(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 3, 3);
        let out: Vec<f32> = TtaEnsembler::new()
            .predict(images, &CornerModel)
            .into_data()
            .iter::<f32>()
            .collect();
        assert_eq!(out, vec![12.0]);
    }
}
