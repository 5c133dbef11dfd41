//! Background pipeline coordinator
//!
//! Reader threads decode their share of the corpus, trim and cut it and push
//! examples onto a bounded queue; a feeder thread groups examples into
//! batches on a second bounded queue that the training loop drains. Every
//! thread blocks on its queue for at most `POLL_INTERVAL` at a time and
//! checks the shared stop signal between waits, so `request_stop` followed by
//! `join` always terminates.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use train_core::{Error, Result, RunConfiguration};

use crate::audio::{cut_pieces, trim_silence, LcFeatures};
use crate::corpus::{AudioItem, ItemSource};

/// Longest a worker blocks on a queue before rechecking the stop signal
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of reader threads
    pub num_readers: usize,

    /// Capacity of the example queue
    pub queue_capacity: usize,

    pub batch_size: usize,

    /// Zero samples prefixed to every utterance
    pub receptive_field: usize,

    /// Samples per piece beyond the receptive field; `None` keeps whole utterances
    pub sample_size: Option<usize>,

    /// RMS threshold for silence trimming; `None` disables trimming
    pub silence_threshold: Option<f32>,

    /// Base seed of the per-epoch shuffle
    pub seed: u64,
}

impl PipelineConfig {
    pub fn from_run(config: &RunConfiguration, receptive_field: usize) -> Self {
        Self {
            num_readers: config.pipeline.num_readers,
            queue_capacity: config.pipeline.queue_capacity,
            batch_size: config.batch_size,
            receptive_field,
            sample_size: config.sample_size,
            silence_threshold: config.silence_threshold,
            seed: config.pipeline.seed,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_readers: 1,
            queue_capacity: 32,
            batch_size: 1,
            receptive_field: 0,
            sample_size: None,
            silence_threshold: None,
            seed: 0,
        }
    }
}

/// One training example: a piece of audio prefixed with receptive-field context
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub audio: Vec<f32>,
    pub gc_id: Option<u32>,
    pub lc: Option<LcFeatures>,
}

/// A group of `batch_size` examples
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub examples: Vec<Example>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Stop request visible to every worker
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// First error reported by any worker
type FailureSlot = Arc<Mutex<Option<Error>>>;

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

/// Supervises the reader threads and the batch feeder
pub struct PipelineCoordinator {
    stop: StopSignal,
    batches: Receiver<Batch>,
    failure: FailureSlot,
    workers: Vec<Worker>,
}

impl PipelineCoordinator {
    /// Launch every worker thread
    pub fn start(source: Arc<dyn ItemSource>, config: PipelineConfig) -> Result<Self> {
        if config.num_readers == 0 || config.batch_size == 0 || config.queue_capacity == 0 {
            return Err(Error::Internal {
                message: "pipeline needs at least one reader, a batch size and a queue capacity"
                    .to_string(),
            });
        }
        if source.is_empty() {
            return Err(Error::Corpus {
                message: "cannot start a pipeline over an empty corpus".to_string(),
            });
        }

        let stop = StopSignal::new();
        let failure: FailureSlot = Arc::new(Mutex::new(None));
        let (example_tx, example_rx) = bounded::<Example>(config.queue_capacity);
        let batch_capacity = config.queue_capacity.div_ceil(config.batch_size).max(1);
        let (batch_tx, batch_rx) = bounded::<Batch>(batch_capacity);
        let tally = Arc::new(PassTally::new(config.num_readers.min(source.len())));

        let mut coordinator = Self {
            stop: stop.clone(),
            batches: batch_rx,
            failure: failure.clone(),
            workers: Vec::with_capacity(config.num_readers + 1),
        };

        for rank in 0..config.num_readers {
            let name = format!("audio-reader-{}", rank);
            let reader = Reader {
                rank,
                source: source.clone(),
                config: config.clone(),
                tx: example_tx.clone(),
                stop: stop.clone(),
                tally: tally.clone(),
            };
            coordinator.spawn(name, failure.clone(), move || reader.run())?;
        }
        // Feeder sees the queue close once every reader has exited
        drop(example_tx);

        let feeder_stop = stop.clone();
        let batch_size = config.batch_size;
        coordinator.spawn("batch-feeder".to_string(), failure, move || {
            feed_batches(example_rx, batch_tx, batch_size, &feeder_stop)
        })?;

        info!(
            readers = config.num_readers,
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            items = source.len(),
            "Pipeline started"
        );
        Ok(coordinator)
    }

    fn spawn<F>(&mut self, name: String, failure: FailureSlot, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let stop = self.stop.clone();
        let worker_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = body() {
                    error!(worker = %worker_name, error = %e, "Pipeline worker failed");
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    drop(slot);
                    stop.request_stop();
                } else {
                    debug!(worker = %worker_name, "Pipeline worker exited");
                }
            });

        match handle {
            Ok(handle) => {
                self.workers.push(Worker { name, handle });
                Ok(())
            }
            Err(e) => {
                self.shutdown();
                Err(Error::Worker {
                    worker: name,
                    message: format!("failed to spawn thread: {}", e),
                })
            }
        }
    }

    /// Block until the next batch is available.
    ///
    /// Fails with the first worker error, or with `ChannelClosed` once the
    /// pipeline has stopped.
    pub fn next_batch(&mut self) -> Result<Batch> {
        match self.batches.recv() {
            Ok(batch) => Ok(batch),
            Err(_) => Err(self.failure.lock().take().unwrap_or(Error::ChannelClosed {
                channel: "batch queue".to_string(),
            })),
        }
    }

    /// Handle to the shared stop signal
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask every worker to exit at its next check
    pub fn request_stop(&self) {
        if !self.stop.is_stopped() {
            info!("Requesting pipeline stop");
        }
        self.stop.request_stop();
    }

    /// Number of live worker handles, readers plus feeder
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop and wait for every worker to exit.
    ///
    /// Returns an error if a worker thread panicked.
    pub fn join(mut self) -> Result<()> {
        self.request_stop();
        let workers = std::mem::take(&mut self.workers);
        let mut panicked = Vec::new();

        for worker in workers {
            if worker.handle.join().is_err() {
                panicked.push(worker.name);
            }
        }

        if panicked.is_empty() {
            info!("Pipeline workers joined");
            Ok(())
        } else {
            Err(Error::Worker {
                worker: panicked.join(", "),
                message: "worker thread panicked".to_string(),
            })
        }
    }

    fn shutdown(&mut self) {
        self.stop.request_stop();
        for worker in std::mem::take(&mut self.workers) {
            if worker.handle.join().is_err() {
                warn!(worker = %worker.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

/// Shared record of what the readers produced.
///
/// Silent utterances are skipped, so a reader's share may legitimately yield
/// nothing. The corpus only counts as unusable once every reader has finished
/// its first pass and none of them produced an example.
struct PassTally {
    readers: usize,
    produced: AtomicUsize,
    first_pass_done: AtomicUsize,
}

impl PassTally {
    fn new(readers: usize) -> Self {
        Self {
            readers,
            produced: AtomicUsize::new(0),
            first_pass_done: AtomicUsize::new(0),
        }
    }

    fn record(&self, examples: usize) {
        self.produced.fetch_add(examples, Ordering::SeqCst);
    }

    /// Mark one reader's first pass complete. Returns `true` when this was
    /// the last reader to finish and the whole corpus yielded nothing.
    fn finish_first_pass(&self) -> bool {
        let done = self.first_pass_done.fetch_add(1, Ordering::SeqCst) + 1;
        done == self.readers && self.produced.load(Ordering::SeqCst) == 0
    }
}

struct Reader {
    rank: usize,
    source: Arc<dyn ItemSource>,
    config: PipelineConfig,
    tx: Sender<Example>,
    stop: StopSignal,
    tally: Arc<PassTally>,
}

impl Reader {
    fn run(self) -> Result<()> {
        let worker = format!("audio-reader-{}", self.rank);
        let total = self.source.len();
        if self.rank >= total {
            warn!(worker = %worker, items = total, "Reader has no items assigned");
            return Ok(());
        }

        let mut epoch = 0u64;
        loop {
            let order = epoch_order(self.config.seed, epoch, total);
            let mut produced = 0usize;

            for index in order
                .into_iter()
                .skip(self.rank)
                .step_by(self.config.num_readers)
            {
                if self.stop.is_stopped() {
                    return Ok(());
                }

                let item = self.source.load(index)?;
                for example in prepare_examples(item, &self.config) {
                    if !send_until_stopped(&self.tx, example, &self.stop) {
                        return Ok(());
                    }
                    produced += 1;
                    self.tally.record(1);
                }
            }

            if epoch == 0 && self.tally.finish_first_pass() {
                return Err(Error::Worker {
                    worker,
                    message: "no usable audio in a full pass over the corpus".to_string(),
                });
            }

            if produced == 0 {
                debug!(worker = %worker, epoch, "Reader share was entirely silent this epoch");
            } else {
                debug!(worker = %worker, epoch, examples = produced, "Reader finished epoch");
            }
            epoch += 1;
        }
    }
}

/// Deterministic visiting order of `len` items for `epoch`
pub fn epoch_order(seed: u64, epoch: u64, len: usize) -> Vec<usize> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    epoch.hash(&mut hasher);

    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());
    order.shuffle(&mut rng);
    order
}

/// Trim, pad and cut one utterance into examples
pub fn prepare_examples(item: AudioItem, config: &PipelineConfig) -> Vec<Example> {
    let total = item.samples.len();
    let kept = match config.silence_threshold {
        Some(threshold) => match trim_silence(&item.samples, threshold) {
            Some(range) => range,
            None => {
                warn!(
                    file = %item.name,
                    "Dropped utterance: entirely silent. Consider lowering the silence threshold"
                );
                return Vec::new();
            }
        },
        None => 0..total,
    };

    let rf = config.receptive_field;
    let mut padded = vec![0.0f32; rf];
    padded.extend_from_slice(&item.samples[kept.clone()]);

    cut_pieces(padded.len(), rf, config.sample_size)
        .into_iter()
        .map(|piece| {
            // Map the piece back onto the unpadded utterance for LC slicing
            let audio_start = kept.start + piece.start.saturating_sub(rf);
            let audio_end = kept.start + piece.end.saturating_sub(rf);
            Example {
                audio: padded[piece].to_vec(),
                gc_id: item.gc_id,
                lc: item
                    .lc
                    .as_ref()
                    .map(|lc| lc.slice_for(audio_start..audio_end, total)),
            }
        })
        .collect()
}

/// Push `item` onto a bounded queue, blocking while it is full.
/// Returns `false` when stopped or when the receiver is gone.
fn send_until_stopped<T>(tx: &Sender<T>, item: T, stop: &StopSignal) -> bool {
    let mut item = item;
    loop {
        if stop.is_stopped() {
            return false;
        }
        match tx.send_timeout(item, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn feed_batches(
    rx: Receiver<Example>,
    tx: Sender<Batch>,
    batch_size: usize,
    stop: &StopSignal,
) -> Result<()> {
    let mut pending = Vec::with_capacity(batch_size);

    while !stop.is_stopped() {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(example) => {
                pending.push(example);
                if pending.len() == batch_size {
                    let batch = Batch {
                        examples: std::mem::replace(&mut pending, Vec::with_capacity(batch_size)),
                    };
                    if !send_until_stopped(&tx, batch, stop) {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// In-memory source of constant-valued utterances
    struct FixedSource {
        lengths: Vec<usize>,
        loads: AtomicUsize,
    }

    impl FixedSource {
        fn new(lengths: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                lengths,
                loads: AtomicUsize::new(0),
            })
        }
    }

    impl ItemSource for FixedSource {
        fn len(&self) -> usize {
            self.lengths.len()
        }

        fn load(&self, index: usize) -> Result<AudioItem> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(AudioItem {
                name: format!("item-{}", index),
                samples: vec![(index + 1) as f32; self.lengths[index]],
                gc_id: Some(index as u32),
                lc: None,
            })
        }
    }

    struct FailingSource;

    impl ItemSource for FailingSource {
        fn len(&self) -> usize {
            1
        }

        fn load(&self, _index: usize) -> Result<AudioItem> {
            Err(Error::Audio {
                path: "broken.wav".to_string(),
                message: "failed to read WAV".to_string(),
            })
        }
    }

    /// Constant-amplitude utterances, one per level
    struct LevelSource {
        levels: Vec<f32>,
    }

    impl ItemSource for LevelSource {
        fn len(&self) -> usize {
            self.levels.len()
        }

        fn load(&self, index: usize) -> Result<AudioItem> {
            Ok(AudioItem {
                name: format!("level-{}", index),
                samples: vec![self.levels[index]; 4096],
                gc_id: Some(index as u32),
                lc: None,
            })
        }
    }

    fn config(num_readers: usize, batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            num_readers,
            queue_capacity: 4,
            batch_size,
            receptive_field: 2,
            sample_size: Some(4),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_examples_pads_and_cuts() {
        let item = AudioItem {
            name: "a".to_string(),
            samples: vec![1.0; 10],
            gc_id: Some(3),
            lc: None,
        };
        let examples = prepare_examples(item, &config(1, 1));

        // 12 padded samples: [0..6], [4..10], [8..12]
        assert_eq!(examples.len(), 3);
        assert_eq!(examples[0].audio, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(examples[2].audio.len(), 4);
        assert!(examples.iter().all(|e| e.gc_id == Some(3)));
    }

    #[test]
    fn test_prepare_examples_drops_silence() {
        let item = AudioItem {
            name: "quiet".to_string(),
            samples: vec![0.0; 4096],
            gc_id: None,
            lc: None,
        };
        let cfg = PipelineConfig {
            silence_threshold: Some(0.3),
            ..config(1, 1)
        };
        assert!(prepare_examples(item, &cfg).is_empty());
    }

    #[test]
    fn test_prepare_examples_slices_lc() {
        let lc = LcFeatures::new(1, vec![10.0, 20.0, 30.0, 40.0, 50.0]).unwrap();
        let item = AudioItem {
            name: "lc".to_string(),
            samples: vec![1.0; 10],
            gc_id: None,
            lc: Some(lc),
        };
        let examples = prepare_examples(item, &config(1, 1));

        // First piece covers utterance samples 0..4 -> frames 0..2
        assert_eq!(examples[0].lc.as_ref().unwrap().values, vec![10.0, 20.0]);
        // Last piece covers utterance samples 6..10 -> frames 3..5
        assert_eq!(examples[2].lc.as_ref().unwrap().values, vec![40.0, 50.0]);
    }

    #[test]
    fn test_epoch_order_is_deterministic_permutation() {
        let a = epoch_order(42, 0, 20);
        let b = epoch_order(42, 0, 20);
        let c = epoch_order(42, 1, 20);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_have_batch_size() {
        let source = FixedSource::new(vec![10, 12, 6]);
        let mut pipeline = PipelineCoordinator::start(source, config(2, 3)).unwrap();
        assert_eq!(pipeline.worker_count(), 3);

        for _ in 0..5 {
            let batch = pipeline.next_batch().unwrap();
            assert_eq!(batch.len(), 3);
            for example in &batch.examples {
                assert!(example.audio.len() > 2 && example.audio.len() <= 6);
            }
        }

        pipeline.join().unwrap();
    }

    #[test]
    fn test_every_item_is_visited() {
        let source = FixedSource::new(vec![6; 5]);
        let mut pipeline = PipelineCoordinator::start(source.clone(), config(3, 1)).unwrap();

        let mut seen = std::collections::HashSet::new();
        while seen.len() < 5 {
            let batch = pipeline.next_batch().unwrap();
            seen.extend(batch.examples.iter().filter_map(|e| e.gc_id));
        }
        pipeline.join().unwrap();

        assert!(source.loads.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn test_stop_and_join_with_full_queues() {
        let source = FixedSource::new(vec![100; 4]);
        let pipeline = PipelineCoordinator::start(source, config(4, 1)).unwrap();

        // Let producers fill both queues and block on them
        thread::sleep(Duration::from_millis(50));

        let stop = pipeline.stop_signal();
        pipeline.request_stop();
        assert!(stop.is_stopped());
        pipeline.join().unwrap();
    }

    #[test]
    fn test_drop_joins_workers() {
        let source = FixedSource::new(vec![100; 2]);
        let pipeline = PipelineCoordinator::start(source.clone(), config(2, 1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(pipeline);

        // Every worker has exited, so loads no longer advance
        let loads = source.loads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(source.loads.load(Ordering::SeqCst), loads);
    }

    #[test]
    fn test_worker_failure_surfaces_on_next_batch() {
        let mut pipeline = PipelineCoordinator::start(Arc::new(FailingSource), config(1, 1)).unwrap();

        let err = pipeline.next_batch().unwrap_err();
        assert!(matches!(err, Error::Audio { .. }));
        pipeline.join().unwrap();
    }

    #[test]
    fn test_more_readers_than_items() {
        let source = FixedSource::new(vec![6]);
        let mut pipeline = PipelineCoordinator::start(source, config(3, 2)).unwrap();
        assert_eq!(pipeline.next_batch().unwrap().len(), 2);
        pipeline.join().unwrap();
    }

    #[test]
    fn test_empty_source_rejected() {
        let source = FixedSource::new(vec![]);
        assert!(PipelineCoordinator::start(source, config(1, 1)).is_err());
    }

    #[test]
    fn test_silent_item_is_skipped_with_two_readers() {
        let source = Arc::new(LevelSource {
            levels: vec![0.0, 0.5],
        });
        let cfg = PipelineConfig {
            silence_threshold: Some(0.3),
            ..config(2, 1)
        };
        let mut pipeline = PipelineCoordinator::start(source, cfg).unwrap();

        for _ in 0..50 {
            let batch = pipeline.next_batch().unwrap();
            assert!(batch.examples.iter().all(|e| e.gc_id == Some(1)));
        }
        pipeline.join().unwrap();
    }

    #[test]
    fn test_entirely_silent_corpus_fails() {
        let source = Arc::new(LevelSource {
            levels: vec![0.0, 0.0, 0.0],
        });
        let cfg = PipelineConfig {
            silence_threshold: Some(0.3),
            ..config(2, 1)
        };
        let mut pipeline = PipelineCoordinator::start(source, cfg).unwrap();

        let err = pipeline.next_batch().unwrap_err();
        assert!(matches!(err, Error::Worker { .. }));
        pipeline.join().unwrap();
    }

    #[test]
    fn test_pass_tally_waits_for_every_reader() {
        let tally = PassTally::new(2);
        assert!(!tally.finish_first_pass());
        assert!(tally.finish_first_pass());

        let tally = PassTally::new(2);
        tally.record(3);
        assert!(!tally.finish_first_pass());
        assert!(!tally.finish_first_pass());
    }
}
