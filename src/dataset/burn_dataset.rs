//! Burn batching for the Semixup streams
//!
//! Loader threads produce backend-free [`SampleItem`]s; [`SemixupBatcher`]
//! stacks them into tensors on whatever backend the consumer needs (the
//! autodiff backend while training, the inner backend while validating).

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::loader::SampleId;
use crate::utils::error::{Result, SemixupError};

/// One preprocessed sample
#[derive(Clone, Debug)]
pub struct SampleItem {
    pub id: SampleId,
    /// `None` for samples served by an unlabeled stream
    pub label: Option<usize>,
    /// One flattened `[1, H, W]` buffer per requested view
    pub views: Vec<Vec<f32>>,
}

/// A stacked batch
#[derive(Clone, Debug)]
pub struct SemixupBatch<B: Backend> {
    pub ids: Vec<SampleId>,
    /// First view, shape `[batch, 1, H, W]`
    pub images: Tensor<B, 4>,
    /// Second, independently augmented view (unlabeled streams)
    pub images_aug: Option<Tensor<B, 4>>,
    pub labels: Vec<Option<usize>>,
    /// Present only when every sample in the batch is labeled
    pub targets: Option<Tensor<B, 1, Int>>,
}

impl<B: Backend> SemixupBatch<B> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Build the `select` index for a permutation
pub fn permutation_tensor<B: Backend>(permutation: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = permutation.iter().map(|&i| i as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(data, [permutation.len()]), device)
}

pub(crate) fn check_permutation(permutation: &[usize], len: usize) -> Result<()> {
    let mut seen = vec![false; len];
    if permutation.len() != len {
        return Err(SemixupError::Dataset(format!(
            "rearrange produced {} indices for a batch of {}",
            permutation.len(),
            len
        )));
    }
    for &i in permutation {
        if i >= len || std::mem::replace(&mut seen[i], true) {
            return Err(SemixupError::Dataset(format!("rearrange index {i} is not a permutation entry")));
        }
    }
    Ok(())
}

/// Produces the sample order used to pair a batch with itself for mixup
pub trait Rearrange: Send + Sync {
    fn permutation(&self, len: usize, rng: &mut ChaCha8Rng) -> Vec<usize>;
}

/// Uniformly random permutation
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomRearrange;

impl Rearrange for RandomRearrange {
    fn permutation(&self, len: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(rng);
        order
    }
}

/// Stacks [`SampleItem`]s into a [`SemixupBatch`]
#[derive(Clone, Debug)]
pub struct SemixupBatcher {
    image_size: usize,
}

impl SemixupBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }

    fn stack<B: Backend>(&self, items: &[SampleItem], view: usize, device: &B::Device) -> Tensor<B, 4> {
        let data: Vec<f32> = items.iter().flat_map(|item| item.views[view].iter().copied()).collect();
        Tensor::<B, 4>::from_floats(
            TensorData::new(data, [items.len(), 1, self.image_size, self.image_size]),
            device,
        )
    }
}

impl<B: Backend> Batcher<B, SampleItem, SemixupBatch<B>> for SemixupBatcher {
    fn batch(&self, items: Vec<SampleItem>, device: &B::Device) -> SemixupBatch<B> {
        let images = self.stack::<B>(&items, 0, device);
        let images_aug = if !items.is_empty() && items.iter().all(|item| item.views.len() > 1) {
            Some(self.stack::<B>(&items, 1, device))
        } else {
            None
        };

        let labels: Vec<Option<usize>> = items.iter().map(|item| item.label).collect();
        let targets = if !labels.is_empty() && labels.iter().all(Option::is_some) {
            let data: Vec<i64> = labels.iter().flatten().map(|&l| l as i64).collect();
            Some(Tensor::<B, 1, Int>::from_data(
                TensorData::new(data, [labels.len()]),
                device,
            ))
        } else {
            None
        };

        SemixupBatch {
            ids: items.iter().map(|item| item.id).collect(),
            images,
            images_aug,
            labels,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    fn item(id: usize, label: Option<usize>, fill: f32, views: usize) -> SampleItem {
        SampleItem {
            id: SampleId(id),
            label,
            views: (0..views).map(|v| vec![fill + v as f32 * 100.0; 4]).collect(),
        }
    }

    fn first_pixels(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        let [n, ..] = t.dims();
        t.reshape([n, 4])
            .slice([0..n, 0..1])
            .reshape([n])
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn test_labeled_batch_has_targets() {
        let device = Default::default();
        let batch: SemixupBatch<TestBackend> = SemixupBatcher::new(2).batch(
            vec![item(0, Some(1), 0.0, 1), item(1, Some(3), 1.0, 1)],
            &device,
        );

        assert_eq!(batch.images.dims(), [2, 1, 2, 2]);
        assert!(batch.images_aug.is_none());
        let targets = batch.targets.unwrap().into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![1, 3]);
    }

    #[test]
    fn test_unlabeled_batch_has_two_views_and_no_targets() {
        let device = Default::default();
        let batch: SemixupBatch<TestBackend> = SemixupBatcher::new(2).batch(
            vec![item(0, None, 0.0, 2), item(1, None, 1.0, 2)],
            &device,
        );

        assert!(batch.targets.is_none());
        assert_eq!(first_pixels(batch.images_aug.unwrap()), vec![100.0, 101.0]);
    }

    #[test]
    fn test_check_permutation_rejects_bad_orders() {
        assert!(check_permutation(&[2, 0, 1], 3).is_ok());
        assert!(check_permutation(&[0, 0], 2).is_err());
        assert!(check_permutation(&[0], 2).is_err());
        assert!(check_permutation(&[0, 2], 2).is_err());
    }

    #[test]
    fn test_random_rearrange_is_permutation() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut perm = RandomRearrange.permutation(10, &mut rng);
        perm.sort();
        assert_eq!(perm, (0..10).collect::<Vec<_>>());
    }
}
