use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::vision::MnistItem;
use burn::data::dataset::Dataset;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use burn::train::TrainStep;
use log::{debug, error, info};
use serde::Deserialize;

use digitrain_core::error::{TrainError, TrainResult};
use digitrain_core::settings::ComponentSettings;

use crate::models::ai::aggregate::ParameterAverager;
use crate::models::ai::network::Network;
use crate::models::data::dataset::SampleBatcher;
use crate::models::data::iterator::BatchIterator;

type GroupQueue = Arc<Mutex<Receiver<TrainResult<Vec<MnistItem>>>>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub num_epochs: usize,
    pub workers: usize,
    pub prefetch_buffer: usize,
    pub averaging_frequency: usize,
    pub report_score_after_averaging: bool,
    pub score_interval: Option<usize>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            workers: 2,
            prefetch_buffer: 24,
            averaging_frequency: 3,
            report_score_after_averaging: true,
            score_interval: Some(100),
        }
    }
}

impl ComponentSettings for TrainingSettings {}

impl TrainingSettings {
    pub fn validate(&self) -> TrainResult<()> {
        let counts = [
            ("num_epochs", self.num_epochs),
            ("workers", self.workers),
            ("prefetch_buffer", self.prefetch_buffer),
            ("averaging_frequency", self.averaging_frequency),
            ("score_interval", self.score_interval.unwrap_or(1)),
        ];
        match counts.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(TrainError::config(format!("{} must be positive", name))),
            None => Ok(()),
        }
    }
}

/// What happened during one pass over the training data.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub averaging_rounds: usize,
    pub losses: Vec<f64>,
    pub duration: Duration,
}

impl EpochSummary {
    pub fn mean_loss(&self) -> Option<f64> {
        match self.losses.is_empty() {
            true => None,
            false => Some(self.losses.iter().sum::<f64>() / self.losses.len() as f64),
        }
    }
}

/// Sent by a worker when it reaches the averaging barrier.
enum RoundReport<B: AutodiffBackend> {
    Trained {
        worker: usize,
        network: Network<B>,
        losses: Vec<f64>,
        exhausted: bool,
    },
    Failed {
        worker: usize,
        error: TrainError,
    },
}

/// The coordinator's answer to a [`RoundReport`].
enum Release<B: AutodiffBackend> {
    Continue(Network<B>),
    Finish(Network<B>),
    Abort,
}

#[derive(Default)]
struct RoundTotals {
    batches: usize,
    rounds: usize,
    losses: Vec<f64>,
}

/// Values every worker reads during an epoch.
struct WorkerContext<'a> {
    learning_rate: f64,
    averaging_frequency: usize,
    score_interval: Option<usize>,
    iteration: &'a AtomicUsize,
}

impl WorkerContext<'_> {
    fn log_score(&self, loss: f64) {
        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst);
        if let Some(interval) = self.score_interval {
            if iteration % interval == 0 {
                info!("Score at iteration {} is {}", iteration, loss);
            }
        }
    }
}

struct Worker<B: AutodiffBackend> {
    id: usize,
    batcher: SampleBatcher<B>,
    groups: GroupQueue,
    reports: Sender<RoundReport<B>>,
    replies: Receiver<Release<B>>,
}

impl<B: AutodiffBackend> Worker<B> {
    /// Trains until the queue runs dry, meeting the coordinator every `averaging_frequency`
    /// batches. Returns the final replica and optimizer unless the epoch was aborted.
    fn run<O>(
        self,
        context: &WorkerContext,
        mut network: Network<B>,
        mut optim: O,
    ) -> Option<(Network<B>, O)>
    where
        O: Optimizer<Network<B>, B>,
    {
        loop {
            let mut losses = Vec::with_capacity(context.averaging_frequency);
            let mut exhausted = false;

            while losses.len() < context.averaging_frequency {
                let items = match self.next_group() {
                    Ok(Some(items)) => items,
                    Ok(None) => {
                        exhausted = true;
                        break;
                    }
                    Err(error) => return self.fail(error),
                };
                match self.train_batch(context, network, &mut optim, items) {
                    Ok((updated, loss)) => {
                        network = updated;
                        losses.push(loss);
                    }
                    Err(error) => return self.fail(error),
                }
            }

            let report = RoundReport::Trained {
                worker: self.id,
                network,
                losses,
                exhausted,
            };
            if self.reports.send(report).is_err() {
                return None;
            }
            match self.replies.recv() {
                Ok(Release::Continue(averaged)) => network = averaged,
                Ok(Release::Finish(averaged)) => return Some((averaged, optim)),
                Ok(Release::Abort) | Err(_) => return None,
            }
        }
    }

    fn next_group(&self) -> TrainResult<Option<Vec<MnistItem>>> {
        let queue = self
            .groups
            .lock()
            .map_err(|_| TrainError::Computation("the batch queue lock is poisoned".to_string()))?;
        match queue.recv() {
            Ok(Ok(items)) => Ok(Some(items)),
            Ok(Err(error)) => Err(error),
            Err(_) => Ok(None),
        }
    }

    fn train_batch<O>(
        &self,
        context: &WorkerContext,
        network: Network<B>,
        optim: &mut O,
        items: Vec<MnistItem>,
    ) -> TrainResult<(Network<B>, f64)>
    where
        O: Optimizer<Network<B>, B>,
    {
        let batcher = &self.batcher;
        let (network, loss) = catch_unwind(AssertUnwindSafe(move || {
            let batch = batcher.batch(items);
            let output = TrainStep::step(&network, batch);
            let loss = output.item.loss.into_scalar().elem::<f64>();
            (optim.step(context.learning_rate, network, output.grads), loss)
        }))
        .map_err(|_| {
            TrainError::Computation(format!("worker {} panicked while training a batch", self.id))
        })?;

        if !loss.is_finite() {
            return Err(TrainError::Computation(format!(
                "worker {} produced a non-finite loss",
                self.id
            )));
        }
        context.log_score(loss);
        Ok((network, loss))
    }

    fn fail<T>(&self, error: TrainError) -> Option<T> {
        let _ = self.reports.send(RoundReport::Failed {
            worker: self.id,
            error,
        });
        None
    }
}

/// Data-parallel training over one replica per worker. Replicas train independently and are
/// replaced by their average every `averaging_frequency` batches.
pub(crate) struct ParallelTrainer<B: AutodiffBackend, O> {
    settings: TrainingSettings,
    learning_rate: f64,
    devices: Vec<B::Device>,
    averager: ParameterAverager<B>,
    replicas: Vec<Network<B>>,
    optimizers: Vec<O>,
    iteration: usize,
}

impl<B, O> ParallelTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Network<B>, B>,
{
    pub(crate) fn new(
        settings: &TrainingSettings,
        learning_rate: f64,
        network: Network<B>,
        devices: Vec<B::Device>,
        averager: ParameterAverager<B>,
        make_optim: impl Fn() -> O,
    ) -> TrainResult<Self> {
        settings.validate()?;
        if devices.len() != settings.workers {
            return Err(TrainError::config(format!(
                "{} workers need {} devices, found {}",
                settings.workers,
                settings.workers,
                devices.len()
            )));
        }
        let replicas = averager.broadcast(&network, &devices);
        let optimizers = devices.iter().map(|_| make_optim()).collect();

        Ok(Self {
            settings: settings.clone(),
            learning_rate,
            devices,
            averager,
            replicas,
            optimizers,
            iteration: 0,
        })
    }

    pub(crate) fn iterations(&self) -> usize {
        self.iteration
    }

    /// The averaged network. Every replica holds the same parameters between epochs.
    pub(crate) fn model(&self) -> TrainResult<Network<B>> {
        self.replicas.first().cloned().ok_or_else(|| {
            TrainError::Computation("no trained replica is available".to_string())
        })
    }

    pub(crate) fn fit<D: Dataset<MnistItem>>(
        &mut self,
        iterator: &mut BatchIterator<D>,
    ) -> TrainResult<Vec<EpochSummary>> {
        let start = Instant::now();
        let seed = iterator.seed();
        let mut summaries = Vec::with_capacity(self.settings.num_epochs);

        for epoch in 0..self.settings.num_epochs {
            iterator.reshuffle(seed.wrapping_add(epoch as u64));
            let summary = self.fit_epoch(epoch, iterator)?;
            info!(
                "*** Completed epoch {}, time: {} ***",
                summary.epoch,
                summary.duration.as_millis()
            );
            summaries.push(summary);
        }
        iterator.reshuffle(seed);

        info!(
            "*** Training complete, time: {} ***",
            start.elapsed().as_millis()
        );
        Ok(summaries)
    }

    pub(crate) fn fit_epoch<D: Dataset<MnistItem>>(
        &mut self,
        epoch: usize,
        iterator: &mut BatchIterator<D>,
    ) -> TrainResult<EpochSummary> {
        let start = Instant::now();
        let workers = self.settings.workers;
        let replicas = std::mem::take(&mut self.replicas);
        let optimizers = std::mem::take(&mut self.optimizers);
        if replicas.len() != workers || optimizers.len() != workers {
            return Err(TrainError::Computation(
                "replicas were lost in an earlier failed epoch".to_string(),
            ));
        }

        let iteration = AtomicUsize::new(self.iteration);
        let context = WorkerContext {
            learning_rate: self.learning_rate,
            averaging_frequency: self.settings.averaging_frequency,
            score_interval: self.settings.score_interval,
            iteration: &iteration,
        };
        let this = &*self;

        let (totals, finished, failure) = thread::scope(|scope| {
            let (group_tx, group_rx) = mpsc::sync_channel(this.settings.prefetch_buffer);
            let groups: GroupQueue = Arc::new(Mutex::new(group_rx));
            let (report_tx, report_rx) = mpsc::channel();

            let producer = scope.spawn(move || {
                for group in iterator {
                    if group_tx.send(group).is_err() {
                        break;
                    }
                }
            });

            let mut replies = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            let slots = replicas.into_iter().zip(optimizers);
            for (id, (network, optim)) in slots.enumerate() {
                let (reply_tx, reply_rx) = mpsc::channel();
                replies.push(reply_tx);
                let worker = Worker {
                    id,
                    batcher: SampleBatcher::new(this.devices[id].clone()),
                    groups: Arc::clone(&groups),
                    reports: report_tx.clone(),
                    replies: reply_rx,
                };
                let context = &context;
                handles.push(scope.spawn(move || worker.run(context, network, optim)));
            }
            drop(report_tx);
            drop(groups);

            let totals = this.coordinate(epoch, &report_rx, &replies);
            drop(replies);
            drop(report_rx);

            let mut failure = None;
            let mut finished = Vec::with_capacity(workers);
            for handle in handles {
                match handle.join() {
                    Ok(Some(slot)) => finished.push(slot),
                    Ok(None) => {}
                    Err(_) => {
                        failure.get_or_insert_with(|| {
                            TrainError::Computation("a worker thread panicked".to_string())
                        });
                    }
                }
            }
            if producer.join().is_err() {
                failure.get_or_insert_with(|| {
                    TrainError::Computation("the data producer panicked".to_string())
                });
            }
            (totals, finished, failure)
        });

        let totals = totals?;
        if let Some(error) = failure {
            return Err(error);
        }
        if finished.len() != workers {
            return Err(TrainError::Computation(format!(
                "{} of {} workers finished the epoch",
                finished.len(),
                workers
            )));
        }
        (self.replicas, self.optimizers) = finished.into_iter().unzip();
        self.iteration = iteration.into_inner();

        Ok(EpochSummary {
            epoch,
            batches: totals.batches,
            averaging_rounds: totals.rounds,
            losses: totals.losses,
            duration: start.elapsed(),
        })
    }

    /// Runs the averaging barrier until the data is exhausted or a worker fails.
    fn coordinate(
        &self,
        epoch: usize,
        reports: &Receiver<RoundReport<B>>,
        replies: &[Sender<Release<B>>],
    ) -> TrainResult<RoundTotals> {
        let mut totals = RoundTotals::default();

        loop {
            let mut trained = Vec::with_capacity(replies.len());
            let mut idle = Vec::new();
            let mut round_losses = Vec::new();
            let mut exhausted = false;

            for _ in 0..replies.len() {
                match reports.recv() {
                    Ok(RoundReport::Trained {
                        worker,
                        network,
                        losses,
                        exhausted: done,
                    }) => {
                        debug!("Worker {} reached the barrier after {} batches", worker, losses.len());
                        exhausted |= done;
                        match losses.is_empty() {
                            true => idle.push(network),
                            false => {
                                round_losses.extend(losses);
                                trained.push(network);
                            }
                        }
                    }
                    Ok(RoundReport::Failed { worker, error }) => {
                        error!("Worker {} failed in epoch {}: {}", worker, epoch, error);
                        Self::abort(replies);
                        return Err(error);
                    }
                    Err(_) => {
                        Self::abort(replies);
                        return Err(TrainError::Computation(
                            "workers stopped before reaching the barrier".to_string(),
                        ));
                    }
                }
            }

            let averaged = match trained.is_empty() {
                true => idle.into_iter().next().ok_or_else(|| {
                    TrainError::Computation("no replica reached the barrier".to_string())
                }),
                false => self.averager.average(trained),
            };
            let averaged = match averaged {
                Ok(averaged) => averaged,
                Err(error) => {
                    Self::abort(replies);
                    return Err(error);
                }
            };

            if !round_losses.is_empty() {
                totals.rounds += 1;
                totals.batches += round_losses.len();
                if self.settings.report_score_after_averaging {
                    let score = round_losses.iter().sum::<f64>() / round_losses.len() as f64;
                    info!("Averaged score after round {} is {}", totals.rounds, score);
                }
                totals.losses.extend(round_losses);
            }

            let copies = self.averager.broadcast(&averaged, &self.devices);
            for (reply, copy) in replies.iter().zip(copies) {
                let release = match exhausted {
                    true => Release::Finish(copy),
                    false => Release::Continue(copy),
                };
                let _ = reply.send(release);
            }
            if exhausted {
                return Ok(totals);
            }
        }
    }

    fn abort(replies: &[Sender<Release<B>>]) {
        for reply in replies {
            let _ = reply.send(Release::Abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::optim::SgdConfig;

    use crate::models::ai::aggregate::Transfer;
    use crate::models::ai::layers::{NetworkPlan, NetworkSettings};
    use crate::models::data::dataset::Remainder;
    use crate::models::data::iterator::IteratorSettings;
    use crate::models::data::mnist::tests::{backend_lock, init_logger, synthetic_items, TestBackend};
    use crate::models::data::mnist::MnistSplit;

    use super::*;

    fn settings(workers: usize, averaging_frequency: usize, num_epochs: usize) -> TrainingSettings {
        TrainingSettings {
            num_epochs,
            workers,
            prefetch_buffer: 4,
            averaging_frequency,
            report_score_after_averaging: true,
            score_interval: Some(1),
        }
    }

    fn iterator(items: Vec<MnistItem>, batch_size: usize) -> BatchIterator<MnistSplit> {
        let settings = IteratorSettings {
            batch_size,
            shuffle: true,
            seed: 12345,
            remainder: Remainder::Drop,
        };
        BatchIterator::new(MnistSplit::with_images(items), settings).unwrap()
    }

    fn trainer(
        settings: &TrainingSettings,
        learning_rate: f64,
    ) -> ParallelTrainer<TestBackend, impl Optimizer<Network<TestBackend>, TestBackend>> {
        let plan = NetworkPlan::validate(&NetworkSettings::default()).unwrap();
        let network = Network::new(&plan, &Default::default());
        let devices = vec![Default::default(); settings.workers];
        let averager = ParameterAverager::new(Default::default(), Transfer::Direct);
        ParallelTrainer::new(settings, learning_rate, network, devices, averager, || {
            SgdConfig::new().init()
        })
        .unwrap()
    }

    fn conv_weights(network: &Network<TestBackend>) -> Vec<f32> {
        let conv = network.layers[2].conv.as_ref().unwrap();
        conv.weight.val().into_data().iter().collect()
    }

    #[test]
    fn test_single_worker_is_deterministic() {
        let _guard = backend_lock();
        init_logger();
        let run = || {
            let mut trainer = trainer(&settings(1, 1, 1), 0.01);
            let mut iterator = iterator(synthetic_items(48), 8);
            trainer.fit(&mut iterator).unwrap().remove(0)
        };
        let first = run();
        let second = run();
        assert_eq!(first.batches, 6);
        assert_eq!(first.averaging_rounds, 6);
        assert_eq!(first.losses, second.losses);
    }

    #[test]
    fn test_averaging_barrier() {
        let _guard = backend_lock();
        init_logger();
        let mut trainer = trainer(&settings(2, 2, 1), 0.01);
        let mut iterator = iterator(synthetic_items(64), 8);

        let summary = trainer.fit_epoch(0, &mut iterator).unwrap();
        assert_eq!(summary.batches, 8);
        assert_eq!(summary.averaging_rounds, 2);
        assert_eq!(summary.losses.len(), 8);
        assert_eq!(trainer.iterations(), 8);

        assert_eq!(trainer.replicas.len(), 2);
        assert_eq!(
            conv_weights(&trainer.replicas[0]),
            conv_weights(&trainer.replicas[1])
        );
    }

    fn seeded_network(seed: u64) -> Network<TestBackend> {
        let settings = NetworkSettings {
            seed,
            ..Default::default()
        };
        Network::new(&NetworkPlan::validate(&settings).unwrap(), &Default::default())
    }

    fn released(reply: &Receiver<Release<TestBackend>>, last: bool) -> Network<TestBackend> {
        match (reply.recv().unwrap(), last) {
            (Release::Continue(network), false) | (Release::Finish(network), true) => network,
            _ => panic!("unexpected release from the coordinator"),
        }
    }

    #[test]
    fn test_every_round_releases_identical_replicas() {
        let _guard = backend_lock();
        init_logger();
        let trainer = trainer(&settings(2, 1, 1), 0.01);
        let rounds = [(seeded_network(1), seeded_network(2)), (seeded_network(3), seeded_network(4))];

        let (report_tx, report_rx) = mpsc::channel();
        for (round, (first, second)) in rounds.iter().enumerate() {
            for (worker, network) in [first, second].into_iter().enumerate() {
                let report = RoundReport::Trained {
                    worker,
                    network: network.clone(),
                    losses: vec![1.0],
                    exhausted: round == 1,
                };
                report_tx.send(report).unwrap();
            }
        }
        let (reply_txs, reply_rxs): (Vec<Sender<Release<TestBackend>>>, Vec<_>) = (0..2).map(|_| mpsc::channel()).unzip();

        let totals = trainer.coordinate(0, &report_rx, &reply_txs).unwrap();
        assert_eq!(totals.rounds, 2);
        assert_eq!(totals.batches, 4);

        for (round, (first, second)) in rounds.iter().enumerate() {
            let copies: Vec<_> = reply_rxs
                .iter()
                .map(|reply| conv_weights(&released(reply, round == 1)))
                .collect();
            assert_eq!(copies[0], copies[1]);

            let expected: Vec<f32> = conv_weights(first)
                .iter()
                .zip(conv_weights(second))
                .map(|(a, b)| (a + b) / 2.0)
                .collect();
            for (actual, expected) in copies[0].iter().zip(expected) {
                assert!((actual - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_loss_decreases() {
        let _guard = backend_lock();
        init_logger();
        let mut trainer = trainer(&settings(2, 3, 3), 0.05);
        let mut iterator = iterator(synthetic_items(240), 12);

        let summaries = trainer.fit(&mut iterator).unwrap();
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|summary| summary.batches == 20));
        let first = summaries[0].mean_loss().unwrap();
        let last = summaries[2].mean_loss().unwrap();
        assert!(last < first, "loss went from {} to {}", first, last);
        assert!(trainer.model().is_ok());
    }

    #[test]
    fn test_bad_batch_aborts_the_epoch() {
        let _guard = backend_lock();
        init_logger();
        let mut items = synthetic_items(64);
        items[10].label = 42;
        let mut trainer = trainer(&settings(2, 2, 1), 0.01);
        let mut iterator = iterator(items, 8);

        let result = trainer.fit(&mut iterator);
        assert!(matches!(result, Err(TrainError::DataUnavailable(_))));
        assert!(trainer.model().is_err());
    }

    #[test]
    fn test_invalid_training_settings() {
        let _guard = backend_lock();
        let plan = NetworkPlan::validate(&NetworkSettings::default()).unwrap();
        let network = Network::<TestBackend>::new(&plan, &Default::default());
        let averager = ParameterAverager::new(Default::default(), Transfer::Direct);

        let result = ParallelTrainer::new(
            &settings(2, 3, 1),
            0.01,
            network.clone(),
            vec![Default::default()],
            averager.clone(),
            || SgdConfig::new().init(),
        );
        assert!(matches!(result.err(), Some(TrainError::Configuration(_))));

        let result = ParallelTrainer::new(
            &settings(1, 0, 1),
            0.01,
            network,
            vec![Default::default()],
            averager,
            || SgdConfig::new().init(),
        );
        assert!(matches!(result.err(), Some(TrainError::Configuration(_))));
    }
}
