use std::path::PathBuf;

use serde::Deserialize;

use digitrain_core::accelerator::AcceleratorSettings;
use digitrain_core::error::{TrainError, TrainResult};
use digitrain_output::logger::LogSettings;

use crate::models::ai::layers::NetworkSettings;
use crate::models::ai::trainer::TrainingSettings;
use crate::models::data::iterator::DataSettings;

/// Every section is optional. A missing section falls back to the LeNet/MNIST defaults.
#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct BaseConfig {
    #[serde(default)]
    pub(crate) log_settings: LogSettings,
    #[serde(default)]
    pub(crate) accelerator: AcceleratorSettings,
    #[serde(default)]
    pub(crate) data_settings: DataSettings,
    #[serde(default)]
    pub(crate) network: NetworkSettings,
    #[serde(default)]
    pub(crate) training: TrainingSettings,
}

impl BaseConfig {
    pub(crate) fn from_toml(contents: &str) -> TrainResult<Self> {
        toml::from_str(contents).map_err(|e| TrainError::config(e.to_string()))
    }
}

pub struct ConfigReader {
    file_path: PathBuf,
}

impl ConfigReader {
    pub fn new(file_name: &str) -> Self {
        let file_path = PathBuf::from(file_name);
        Self { file_path }
    }

    pub(crate) fn parse(&self) -> TrainResult<BaseConfig> {
        let contents = std::fs::read_to_string(&self.file_path).map_err(|e| {
            TrainError::config(format!("cannot read {}: {}", self.file_path.display(), e))
        })?;
        BaseConfig::from_toml(&contents)
    }
}
