//! Batch construction for the instance encoder
//!
//! During warmup every image of a positive study is trained on with the
//! study label, although most of them are probably negative. The balanced
//! sampler keeps those unconfident examples from dominating a batch: each
//! batch mixes a random number of them with confident examples.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::dataset::instance_view::InstanceView;
use crate::utils::error::{MilError, Result};

/// A batch of indices into an [`InstanceView`]
pub type IndexBatch = Vec<usize>;

/// Sampler mixing unconfident-origin and confident-origin examples
#[derive(Debug, Clone)]
pub struct BalancedBatchSampler {
    confident: Vec<usize>,
    unconfident: Vec<usize>,
    batch_size: usize,
    num_batches: usize,
}

impl BalancedBatchSampler {
    /// Create a sampler over `view`
    ///
    /// Fails with a configuration error if `batch_size < 2` or if either
    /// origin pool is empty: a balanced batch cannot be formed then.
    pub fn new(view: &InstanceView, batch_size: usize) -> Result<Self> {
        if batch_size < 2 {
            return Err(MilError::Config(format!(
                "balanced batches need batch_size >= 2, got {}",
                batch_size
            )));
        }

        let confident = view.confident_indices();
        let unconfident = view.unconfident_indices();

        if confident.is_empty() || unconfident.is_empty() {
            return Err(MilError::Config(format!(
                "cannot balance batches: {} confident and {} unconfident examples",
                confident.len(),
                unconfident.len()
            )));
        }

        Ok(Self {
            confident,
            unconfident,
            batch_size,
            num_batches: view.len() / batch_size,
        })
    }

    /// Number of batches produced per call to [`sample_batches`](Self::sample_batches)
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// Size of the confident pool
    pub fn confident_len(&self) -> usize {
        self.confident.len()
    }

    /// Size of the unconfident pool
    pub fn unconfident_len(&self) -> usize {
        self.unconfident.len()
    }

    /// Draw one round's batches
    pub fn sample_batches(&self, rng: &mut ChaCha8Rng) -> Vec<IndexBatch> {
        (0..self.num_batches).map(|_| self.sample_batch(rng)).collect()
    }

    fn sample_batch(&self, rng: &mut ChaCha8Rng) -> IndexBatch {
        let max_unconfident = self.unconfident.len().min(self.batch_size - 1);
        let k = rng.gen_range(1..=max_unconfident);
        let fill = self.batch_size - k;

        let mut batch: IndexBatch = self.unconfident.choose_multiple(rng, k).copied().collect();

        // Small confident pools are drawn with replacement
        if self.confident.len() >= fill {
            batch.extend(self.confident.choose_multiple(rng, fill).copied());
        } else {
            for _ in 0..fill {
                batch.push(self.confident[rng.gen_range(0..self.confident.len())]);
            }
        }

        batch.shuffle(rng);
        batch
    }
}

/// Balanced batches for one round
pub fn sample_batches(view: &InstanceView, batch_size: usize, rng: &mut ChaCha8Rng) -> Result<Vec<IndexBatch>> {
    let sampler = BalancedBatchSampler::new(view, batch_size)?;
    debug!(
        "Balanced sampler: {} confident / {} unconfident, {} batches of {}",
        sampler.confident_len(),
        sampler.unconfident_len(),
        sampler.num_batches(),
        batch_size
    );
    Ok(sampler.sample_batches(rng))
}

/// Plain shuffled batches over `0..len`, dropping the final partial batch
pub fn shuffled_batches(len: usize, batch_size: usize, rng: &mut ChaCha8Rng) -> Result<Vec<IndexBatch>> {
    if batch_size == 0 {
        return Err(MilError::Config("batch_size must be positive".to_string()));
    }

    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);

    Ok(indices
        .chunks_exact(batch_size)
        .map(<[usize]>::to_vec)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::bag::{Bag, BagStore, Instance};
    use crate::dataset::instance_view::build_instance_view;
    use crate::training::selection::SelectionMask;
    use crate::training::state::Phase;
    use rand::SeedableRng;

    fn warmup_view(negative_bags: usize, positive_bags: usize, per_bag: usize) -> InstanceView {
        let mut bags = Vec::new();
        for i in 0..negative_bags + positive_bags {
            let label = if i < negative_bags { 0 } else { 1 };
            let instances = (0..per_bag)
                .map(|j| Instance::unlabeled(format!("{}_{}.png", i, j)))
                .collect();
            bags.push(Bag::new(i as i64, instances, vec![label]));
        }
        let store = BagStore::from_bags(bags).unwrap();
        build_instance_view(&store, &SelectionMask::default(), Phase::Warmup)
    }

    #[test]
    fn test_every_batch_mixes_both_pools() {
        let view = warmup_view(3, 2, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let batches = sample_batches(&view, 4, &mut rng).unwrap();

        assert_eq!(batches.len(), 25 / 4);
        for batch in &batches {
            assert_eq!(batch.len(), 4);
            let unconfident = batch
                .iter()
                .filter(|&&i| !view.get(i).unwrap().origin.is_confident())
                .count();
            assert!((1..=3).contains(&unconfident), "k = {}", unconfident);
        }
    }

    #[test]
    fn test_k_bounded_by_unconfident_pool() {
        // one positive bag with a single image: k must be exactly 1
        let view = warmup_view(4, 1, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let batches = sample_batches(&view, 3, &mut rng).unwrap();
        assert_eq!(batches.len(), 1);
        let unconfident = batches[0]
            .iter()
            .filter(|&&i| !view.get(i).unwrap().origin.is_confident())
            .count();
        assert_eq!(unconfident, 1);
    }

    #[test]
    fn test_small_confident_pool_is_reused() {
        let view = warmup_view(1, 3, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let batches = sample_batches(&view, 8, &mut rng).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 8);
    }

    #[test]
    fn test_empty_pool_is_config_error() {
        let only_negative = warmup_view(2, 0, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = sample_batches(&only_negative, 2, &mut rng).unwrap_err();
        assert!(err.is_config());

        let only_positive = warmup_view(0, 2, 3);
        assert!(sample_batches(&only_positive, 2, &mut rng).unwrap_err().is_config());
    }

    #[test]
    fn test_batch_size_one_is_rejected() {
        let view = warmup_view(1, 1, 2);
        assert!(BalancedBatchSampler::new(&view, 1).unwrap_err().is_config());
    }

    #[test]
    fn test_sampling_is_seeded() {
        let view = warmup_view(3, 3, 4);
        let a = sample_batches(&view, 4, &mut ChaCha8Rng::seed_from_u64(11)).unwrap();
        let b = sample_batches(&view, 4, &mut ChaCha8Rng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_shuffled_batches_drop_partial() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let batches = shuffled_batches(10, 3, &mut rng).unwrap();
        assert_eq!(batches.len(), 3);

        let mut seen: Vec<usize> = batches.concat();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 9);

        assert!(shuffled_batches(10, 0, &mut rng).is_err());
        assert!(shuffled_batches(2, 3, &mut rng).unwrap().is_empty());
    }
}
