use std::path::{Path, PathBuf};

use burn::data::dataset::vision::MnistItem;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use log::info;

use digitrain_core::accelerator::{replica_bytes, AcceleratorSettings, Precision};
use digitrain_core::error::{TrainError, TrainResult};
use digitrain_core::eval::Evaluation;
use digitrain_output::logger::initiate_logger;

use crate::models::ai::aggregate::ParameterAverager;
use crate::models::ai::evaluate::Evaluator;
use crate::models::ai::layers::NetworkPlan;
use crate::models::ai::network::Network;
use crate::models::ai::optim::Updater;
use crate::models::ai::trainer::ParallelTrainer;
use crate::models::data::dataset::DatasetSplit;
use crate::models::data::iterator::BatchIterator;
use crate::models::data::mnist::MnistSplit;
use crate::pipeline::config::{BaseConfig, ConfigReader};
use crate::pipeline::environment::Environment;

/// Owns the validated configuration and drives the run from data loading to the final report.
pub struct RunBuilder {
    base_config: BaseConfig,
    config_path: PathBuf,
    plan: NetworkPlan,
}

impl RunBuilder {
    /// Without a file the built-in LeNet/MNIST configuration is used.
    pub fn new(base_config_file: Option<&str>) -> TrainResult<Self> {
        match base_config_file {
            Some(file) => {
                if !Path::new(file).exists() {
                    return Err(TrainError::config(format!(
                        "configuration file {} is not found",
                        file
                    )));
                }
                let config_path = Path::new(file)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                let base_config = ConfigReader::new(file).parse()?;
                Self::with_config(base_config, config_path)
            }
            None => Self::with_config(BaseConfig::default(), PathBuf::from(".")),
        }
    }

    /// Every setting is checked here, before any data is loaded or tensor allocated.
    pub(crate) fn with_config(base_config: BaseConfig, config_path: PathBuf) -> TrainResult<Self> {
        base_config.training.validate()?;
        if base_config.data_settings.batch_size == 0 {
            return Err(TrainError::config("batch size must be positive"));
        }
        let plan = NetworkPlan::validate(&base_config.network)?;
        Ok(Self {
            base_config,
            config_path,
            plan,
        })
    }

    pub fn init_logging(&self) -> TrainResult<()> {
        initiate_logger(&self.config_path, &self.base_config.log_settings)
    }

    pub fn precision(&self) -> Precision {
        self.base_config.accelerator.precision
    }

    pub fn accelerator(&self) -> &AcceleratorSettings {
        &self.base_config.accelerator
    }

    pub fn run<B: AutodiffBackend>(&self, devices: Vec<B::Device>) -> TrainResult<Evaluation> {
        let environment = self.build_environment::<B>(devices)?;
        info!("Load data....");
        let train_data = MnistSplit::load(DatasetSplit::Train)?;
        let test_data = MnistSplit::load(DatasetSplit::Test)?;
        self.run_with(&environment, train_data, test_data)
    }

    fn build_environment<B: AutodiffBackend>(
        &self,
        devices: Vec<B::Device>,
    ) -> TrainResult<Environment<B>> {
        Environment::new(
            &self.base_config.accelerator,
            devices,
            self.base_config.training.workers,
            replica_bytes(self.plan.param_count(), self.precision()),
        )
    }

    pub(crate) fn run_with<B, D>(
        &self,
        environment: &Environment<B>,
        train_data: D,
        test_data: D,
    ) -> TrainResult<Evaluation>
    where
        B: AutodiffBackend,
        D: Dataset<MnistItem>,
    {
        let data_settings = &self.base_config.data_settings;
        let mut train_iter =
            BatchIterator::new(train_data, data_settings.iterator_settings(DatasetSplit::Train))?;
        let mut test_iter =
            BatchIterator::new(test_data, data_settings.iterator_settings(DatasetSplit::Test))?;
        info!(
            "Loaded {} training examples in {} batches and {} test examples, {:?} precision",
            train_iter.num_items(),
            train_iter.batches_per_epoch(),
            test_iter.num_items(),
            environment.precision()
        );

        info!("Build model....");
        let network = Network::<B>::new(&self.plan, &environment.main_device());
        for line in self.plan.summary() {
            info!("{}", line);
        }
        info!("Total parameters: {}", self.plan.param_count());

        info!("Train model....");
        let updater = self.plan.updater()?;
        info!(
            "Updater {} with learning rate {}",
            updater.name(),
            self.plan.learning_rate()
        );
        let trained = match updater {
            Updater::Sgd(config) => {
                self.train(environment, network, &mut train_iter, || config.init())?
            }
            Updater::Adam(config) => {
                self.train(environment, network, &mut train_iter, || config.init())?
            }
        };

        info!("Evaluate model....");
        let evaluator = Evaluator::new(environment.main_device());
        let evaluation = evaluator.evaluate(&trained.valid(), &mut test_iter)?;
        info!("{}", evaluation.stats());
        info!("****************Example finished********************");
        Ok(evaluation)
    }

    fn train<B, D, O>(
        &self,
        environment: &Environment<B>,
        network: Network<B>,
        iterator: &mut BatchIterator<D>,
        make_optim: impl Fn() -> O,
    ) -> TrainResult<Network<B>>
    where
        B: AutodiffBackend,
        D: Dataset<MnistItem>,
        O: Optimizer<Network<B>, B>,
    {
        let averager = ParameterAverager::new(environment.main_device(), environment.transfer());
        let mut trainer = ParallelTrainer::new(
            &self.base_config.training,
            self.plan.learning_rate(),
            network,
            environment.worker_devices(),
            averager,
            make_optim,
        )?;
        trainer.fit(iterator)?;
        info!("{} iterations over all workers", trainer.iterations());
        trainer.model()
    }
}

#[cfg(test)]
mod tests {
    use crate::models::ai::layers::{DenseSpec, LayerSpec};
    use crate::models::ai::trainer::TrainingSettings;
    use crate::models::data::mnist::tests::{backend_lock, capture_logs, synthetic_split, TestBackend};

    use super::*;

    fn small_config() -> BaseConfig {
        let mut base_config = BaseConfig::default();
        base_config.data_settings.batch_size = 16;
        base_config.training = TrainingSettings {
            num_epochs: 2,
            workers: 2,
            prefetch_buffer: 4,
            averaging_frequency: 3,
            report_score_after_averaging: true,
            score_interval: Some(5),
        };
        base_config.network.updater.learning_rate = 0.05;
        base_config
    }

    #[test]
    fn test_end_to_end_on_synthetic_digits() {
        let _guard = backend_lock();
        let builder = RunBuilder::with_config(small_config(), PathBuf::from(".")).unwrap();
        let environment = builder
            .build_environment::<TestBackend>(vec![Default::default()])
            .unwrap();

        let (evaluation, lines) = capture_logs(|| {
            builder.run_with(&environment, synthetic_split(320), synthetic_split(100))
        });
        let evaluation = evaluation.unwrap();
        assert_eq!(evaluation.total(), 100);
        assert!(evaluation.accuracy() > 0.10);

        let position = |needle: &str| {
            lines
                .iter()
                .enumerate()
                .filter(|(_, line)| line.contains(needle))
                .map(|(index, _)| index)
                .collect::<Vec<_>>()
        };
        let epochs = position("Completed epoch");
        let stats = position("Evaluation Metrics");
        let finished = position("Example finished");
        assert_eq!(epochs.len(), 2);
        assert!(lines[epochs[0]].contains("Completed epoch 0,"));
        assert!(lines[epochs[1]].contains("Completed epoch 1,"));
        assert_eq!(stats.len(), 1);
        assert_eq!(finished.len(), 1);
        assert!(epochs[1] < stats[0] && stats[0] < finished[0]);
    }

    #[test]
    fn test_impossible_chain_rejected_before_training() {
        let mut base_config = small_config();
        base_config.network.layers[4] = LayerSpec::Dense(DenseSpec {
            n_in: Some(123),
            n_out: 500,
            activation: Default::default(),
        });
        let result = RunBuilder::with_config(base_config, PathBuf::from("."));
        assert!(matches!(result, Err(TrainError::Configuration(_))));
    }

    #[test]
    fn test_missing_config_file() {
        let result = RunBuilder::new(Some("/nonexistent/digitrain.toml"));
        assert!(matches!(result, Err(TrainError::Configuration(_))));
    }

    #[test]
    fn test_default_run_settings() {
        let builder = RunBuilder::new(None).unwrap();
        assert_eq!(builder.precision(), Precision::Single);
        assert!(builder.accelerator().multi_device);
        assert_eq!(builder.plan.param_count(), 431_080);
    }
}
