//! Named batch streams over fold partitions
//!
//! A [`DataProvider`] owns the read-only pieces every loader thread needs
//! (population, image source, transform) and a set of named
//! [`StreamSpec`]s. Each call to [`DataProvider::stream`] starts an
//! independent pass over one stream, so streams are restartable and never
//! share iteration state.
//!
//! Sample order and augmentation randomness are pure functions of
//! `(seed, stream, epoch, pass, sample id)`; results do not depend on how
//! the rayon pool schedules work.
//!
//! [`DataProvider::prefetch`] runs a stream on its own producer thread that
//! hands finished batches to the training loop through a bounded queue.

use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

use super::augmentation::SampleTransform;
use super::burn_dataset::SampleItem;
use super::loader::{Population, SampleId};
use super::source::SampleSource;
use crate::utils::error::{Result, SemixupError};

/// How one named stream serves its partition
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    ids: Vec<SampleId>,
    pub shuffle: bool,
    pub augment: bool,
    /// Number of transformed views produced per sample (1 or 2)
    pub views: usize,
    /// Serve samples without their labels
    pub hide_labels: bool,
}

impl StreamSpec {
    /// Shuffled, augmented, labeled
    pub fn labeled<I: IntoIterator<Item = SampleId>>(ids: I) -> Self {
        Self::with_ids(ids, true, true, 1, false)
    }

    /// Shuffled, two augmented views, labels hidden
    pub fn unlabeled<I: IntoIterator<Item = SampleId>>(ids: I) -> Self {
        Self::with_ids(ids, true, true, 2, true)
    }

    /// Stable order, no augmentation, labeled
    pub fn validation<I: IntoIterator<Item = SampleId>>(ids: I) -> Self {
        Self::with_ids(ids, false, false, 1, false)
    }

    fn with_ids<I: IntoIterator<Item = SampleId>>(
        ids: I,
        shuffle: bool,
        augment: bool,
        views: usize,
        hide_labels: bool,
    ) -> Self {
        let mut ids: Vec<SampleId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self {
            ids,
            shuffle,
            augment,
            views,
            hide_labels,
        }
    }

    pub fn ids(&self) -> &[SampleId] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Exposes named, restartable batch streams
pub struct DataProvider {
    population: Arc<Population>,
    source: Arc<dyn SampleSource>,
    transform: Arc<dyn SampleTransform>,
    batch_size: usize,
    seed: u64,
    pool: rayon::ThreadPool,
    prefetch_depth: usize,
    streams: BTreeMap<String, StreamSpec>,
}

/// Finished batches a producer may queue ahead of the consumer
pub const DEFAULT_PREFETCH_DEPTH: usize = 2;

impl DataProvider {
    pub fn new(
        population: Arc<Population>,
        source: Arc<dyn SampleSource>,
        transform: Arc<dyn SampleTransform>,
        batch_size: usize,
        num_threads: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(SemixupError::Config("batch size must be positive".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("semixup-loader-{i}"))
            .build()
            .map_err(|e| SemixupError::Config(format!("failed to build loader pool: {e}")))?;

        Ok(Self {
            population,
            source,
            transform,
            batch_size,
            seed,
            pool,
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            streams: BTreeMap::new(),
        })
    }

    /// Side length of the views the transform produces
    pub fn image_size(&self) -> usize {
        self.transform.image_size()
    }

    /// Capacity of the hand-off queue used by [`DataProvider::prefetch`]
    pub fn with_prefetch_depth(mut self, depth: usize) -> Self {
        self.prefetch_depth = depth.max(1);
        self
    }

    /// Register (or replace) a named stream
    pub fn add_stream(&mut self, name: impl Into<String>, spec: StreamSpec) -> Result<()> {
        let name = name.into();
        if !(1..=2).contains(&spec.views) {
            return Err(SemixupError::Config(format!(
                "stream '{}' requests {} views; 1 or 2 are supported",
                name, spec.views
            )));
        }
        for id in spec.ids() {
            self.population.get(*id)?;
        }
        debug!("Stream '{}': {} samples, {} batches", name, spec.ids.len(), self.batches_for(spec.ids.len()));
        self.streams.insert(name, spec);
        Ok(())
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn spec(&self, name: &str) -> Result<&StreamSpec> {
        self.streams
            .get(name)
            .ok_or_else(|| SemixupError::MissingStream(name.to_string()))
    }

    /// Batches per epoch: `ceil(partition size / batch size)`
    pub fn len(&self, name: &str) -> Result<usize> {
        Ok(self.batches_for(self.spec(name)?.ids.len()))
    }

    /// One pass over `name` for `epoch`
    pub fn stream(&self, name: &str, epoch: usize) -> Result<BatchStream<'_>> {
        self.open(name, epoch, false)
    }

    /// Endless stream over `name`; every pass is reshuffled
    pub fn cycling_stream(&self, name: &str, epoch: usize) -> Result<BatchStream<'_>> {
        self.open(name, epoch, true)
    }

    /// Produce the batches of `name` on a background thread.
    ///
    /// Batches match those of [`DataProvider::stream`] (or
    /// [`DataProvider::cycling_stream`] with `cycle`) one for one.
    pub fn prefetch(self: &Arc<Self>, name: &str, epoch: usize, cycle: bool) -> Result<PrefetchStream> {
        self.spec(name)?;

        let (sender, receiver) = sync_channel(self.prefetch_depth);
        let provider = Arc::clone(self);
        let stream_name = name.to_string();
        let producer = std::thread::Builder::new()
            .name(format!("semixup-prefetch-{name}"))
            .spawn(move || {
                let opened = if cycle {
                    provider.cycling_stream(&stream_name, epoch)
                } else {
                    provider.stream(&stream_name, epoch)
                };
                let stream = match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = sender.send(Err(e));
                        return;
                    }
                };
                for batch in stream {
                    let failed = batch.is_err();
                    // a closed queue means the consumer is gone
                    if sender.send(batch).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(PrefetchStream {
            receiver: Some(receiver),
            producer: Some(producer),
        })
    }

    fn open(&self, name: &str, epoch: usize, cycle: bool) -> Result<BatchStream<'_>> {
        let (name, spec) = self
            .streams
            .get_key_value(name)
            .ok_or_else(|| SemixupError::MissingStream(name.to_string()))?;
        let key = stream_key(name);
        Ok(BatchStream {
            provider: self,
            spec,
            key,
            epoch: epoch as u64,
            pass: 0,
            order: self.order(spec, key, epoch as u64, 0),
            cursor: 0,
            cycle,
        })
    }

    fn batches_for(&self, n: usize) -> usize {
        n.div_ceil(self.batch_size)
    }

    fn order(&self, spec: &StreamSpec, key: u64, epoch: u64, pass: u64) -> Vec<SampleId> {
        let mut order = spec.ids.clone();
        if spec.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.seed, &[key, epoch, pass]));
            order.shuffle(&mut rng);
        }
        order
    }

    fn load_batch(&self, spec: &StreamSpec, ids: &[SampleId], key: u64, epoch: u64, pass: u64) -> Result<Vec<SampleItem>> {
        self.pool.install(|| {
            ids.par_iter()
                .map(|&id| -> Result<SampleItem> {
                    let record = self.population.get(id)?;
                    let image = self.source.load(record)?;
                    let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.seed, &[key, epoch, pass, id.0 as u64]));

                    let views = (0..spec.views)
                        .map(|_| {
                            if spec.augment {
                                self.transform.apply(&image, Some(&mut rng))
                            } else {
                                self.transform.apply(&image, None)
                            }
                        })
                        .collect();

                    Ok(SampleItem {
                        id,
                        label: if spec.hide_labels { None } else { Some(record.target) },
                        views,
                    })
                })
                .collect()
        })
    }
}

/// Iterator over the batches of one stream pass (or of endless passes when cycling)
pub struct BatchStream<'a> {
    provider: &'a DataProvider,
    spec: &'a StreamSpec,
    key: u64,
    epoch: u64,
    pass: u64,
    order: Vec<SampleId>,
    cursor: usize,
    cycle: bool,
}

impl Iterator for BatchStream<'_> {
    type Item = Result<Vec<SampleItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            if !self.cycle {
                return None;
            }
            self.pass += 1;
            self.order = self.provider.order(self.spec, self.key, self.epoch, self.pass);
            self.cursor = 0;
        }

        let end = (self.cursor + self.provider.batch_size).min(self.order.len());
        let ids = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.provider.load_batch(self.spec, ids, self.key, self.epoch, self.pass))
    }
}

/// Batches of one stream, produced ahead of the consumer.
///
/// At most the provider's prefetch depth of finished batches wait in the
/// queue. Dropping the stream closes the queue and joins the producer.
pub struct PrefetchStream {
    receiver: Option<Receiver<Result<Vec<SampleItem>>>>,
    producer: Option<JoinHandle<()>>,
}

impl Iterator for PrefetchStream {
    type Item = Result<Vec<SampleItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for PrefetchStream {
    fn drop(&mut self) {
        drop(self.receiver.take());
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                warn!("Prefetch thread panicked");
            }
        }
    }
}

/// Stable 64-bit key for a stream name (FNV-1a)
fn stream_key(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Fold `parts` into `seed` with the splitmix64 finalizer
pub(crate) fn mix_seed(seed: u64, parts: &[u64]) -> u64 {
    parts.iter().fold(seed, |acc, &part| {
        let mut z = acc ^ part.wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::Augmenter;
    use crate::dataset::source::MemorySource;
    use image::{GrayImage, Luma};

    const SIZE: u32 = 8;

    fn provider(n: usize, batch_size: usize) -> DataProvider {
        let population = Population::from_entries(
            (0..n).map(|i| (i % 5, None, None)),
            (0..5).map(|g| format!("KL{g}")).collect(),
        )
        .unwrap();
        let source: MemorySource = (0..n)
            .map(|i| (SampleId(i), GrayImage::from_pixel(SIZE, SIZE, Luma([(i * 10 % 256) as u8]))))
            .collect();

        DataProvider::new(
            Arc::new(population),
            Arc::new(source),
            Arc::new(Augmenter::with_defaults(SIZE)),
            batch_size,
            2,
            42,
        )
        .unwrap()
    }

    fn ids(batches: &[Vec<SampleItem>]) -> Vec<SampleId> {
        batches.iter().flatten().map(|item| item.id).collect()
    }

    fn collect(stream: BatchStream<'_>) -> Vec<Vec<SampleItem>> {
        stream.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_len_is_ceiling() {
        let mut provider = provider(20, 4);
        provider.add_stream("a", StreamSpec::labeled((0..10).map(SampleId))).unwrap();
        provider.add_stream("b", StreamSpec::labeled((0..12).map(SampleId))).unwrap();
        assert_eq!(provider.len("a").unwrap(), 3);
        assert_eq!(provider.len("b").unwrap(), 3);

        let batches = collect(provider.stream("a", 0).unwrap());
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn test_validation_order_is_stable() {
        let mut provider = provider(10, 3);
        provider.add_stream("val_labeled", StreamSpec::validation([SampleId(7), SampleId(2), SampleId(5)])).unwrap();

        let first = ids(&collect(provider.stream("val_labeled", 0).unwrap()));
        let later = ids(&collect(provider.stream("val_labeled", 9).unwrap()));
        assert_eq!(first, vec![SampleId(2), SampleId(5), SampleId(7)]);
        assert_eq!(first, later);
    }

    #[test]
    fn test_training_shuffle_depends_on_epoch_only() {
        let mut provider = provider(30, 5);
        provider.add_stream("labeled", StreamSpec::labeled((0..30).map(SampleId))).unwrap();

        let a = ids(&collect(provider.stream("labeled", 1).unwrap()));
        let b = ids(&collect(provider.stream("labeled", 1).unwrap()));
        let c = ids(&collect(provider.stream("labeled", 2).unwrap()));

        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..30).map(SampleId).collect::<Vec<_>>());
    }

    #[test]
    fn test_unlabeled_stream_hides_labels_and_has_two_views() {
        let mut provider = provider(6, 3);
        provider.add_stream("unlabeled", StreamSpec::unlabeled((0..6).map(SampleId))).unwrap();

        for item in collect(provider.stream("unlabeled", 0).unwrap()).into_iter().flatten() {
            assert!(item.label.is_none());
            assert_eq!(item.views.len(), 2);
            assert_eq!(item.views[0].len(), (SIZE * SIZE) as usize);
        }
    }

    #[test]
    fn test_labeled_stream_exposes_targets() {
        let mut provider = provider(6, 6);
        provider.add_stream("labeled", StreamSpec::labeled((0..6).map(SampleId))).unwrap();

        let batch = provider.stream("labeled", 0).unwrap().next().unwrap().unwrap();
        for item in batch {
            assert_eq!(item.label, Some(item.id.0 % 5));
        }
    }

    #[test]
    fn test_empty_stream_yields_nothing() {
        let mut provider = provider(4, 2);
        provider.add_stream("unlabeled", StreamSpec::unlabeled(Vec::new())).unwrap();

        assert_eq!(provider.len("unlabeled").unwrap(), 0);
        assert!(provider.stream("unlabeled", 0).unwrap().next().is_none());
        assert!(provider.cycling_stream("unlabeled", 0).unwrap().next().is_none());
    }

    #[test]
    fn test_cycling_stream_wraps_with_new_order() {
        let mut provider = provider(12, 4);
        provider.add_stream("labeled", StreamSpec::labeled((0..4).map(SampleId))).unwrap();

        let batches: Vec<_> = provider
            .cycling_stream("labeled", 0)
            .unwrap()
            .take(5)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_augmentation_is_reproducible_across_runs() {
        let mut provider = provider(8, 4);
        provider.add_stream("unlabeled", StreamSpec::unlabeled((0..8).map(SampleId))).unwrap();

        let a = collect(provider.stream("unlabeled", 3).unwrap());
        let b = collect(provider.stream("unlabeled", 3).unwrap());
        for (x, y) in a.iter().flatten().zip(b.iter().flatten()) {
            assert_eq!(x.views, y.views);
        }
    }

    #[test]
    fn test_prefetch_matches_direct_stream() {
        let mut provider = provider(14, 4);
        provider.add_stream("unlabeled", StreamSpec::unlabeled((0..14).map(SampleId))).unwrap();
        let provider = Arc::new(provider.with_prefetch_depth(1));

        let direct = collect(provider.stream("unlabeled", 2).unwrap());
        let prefetched = provider
            .prefetch("unlabeled", 2, false)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(ids(&prefetched), ids(&direct));
        for (x, y) in prefetched.iter().flatten().zip(direct.iter().flatten()) {
            assert_eq!(x.views, y.views);
        }
    }

    #[test]
    fn test_dropping_cycling_prefetch_stops_producer() {
        let mut provider = provider(8, 2);
        provider.add_stream("labeled", StreamSpec::labeled((0..8).map(SampleId))).unwrap();
        let provider = Arc::new(provider);

        let mut stream = provider.prefetch("labeled", 0, true).unwrap();
        let taken: Vec<_> = stream.by_ref().take(7).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(taken.len(), 7);
        drop(stream);

        // the producer released its handle on the provider
        assert_eq!(Arc::strong_count(&provider), 1);
    }

    #[test]
    fn test_prefetch_unknown_stream_fails_immediately() {
        let provider = Arc::new(provider(4, 2));
        assert!(matches!(provider.prefetch("nope", 0, false), Err(SemixupError::MissingStream(_))));
    }

    #[test]
    fn test_unknown_stream() {
        let provider = provider(4, 2);
        assert!(matches!(provider.len("nope"), Err(SemixupError::MissingStream(_))));
        assert!(provider.stream("nope", 0).is_err());
    }

    #[test]
    fn test_rejects_ids_outside_population() {
        let mut provider = provider(4, 2);
        assert!(provider.add_stream("labeled", StreamSpec::labeled([SampleId(10)])).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = DataProvider::new(
            Arc::new(Population::default()),
            Arc::new(MemorySource::new()),
            Arc::new(Augmenter::with_defaults(SIZE)),
            0,
            1,
            0,
        );
        assert!(result.is_err());
    }
}
