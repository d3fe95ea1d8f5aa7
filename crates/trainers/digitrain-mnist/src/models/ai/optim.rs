use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, SgdConfig};
use serde::Deserialize;

use digitrain_core::error::{TrainError, TrainResult};
use digitrain_core::settings::ComponentSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdaterSettings {
    pub variant: String,
    pub learning_rate: f64,
    pub momentum: Option<f64>,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            variant: "nesterovs".to_string(),
            learning_rate: 0.01,
            momentum: Some(0.9),
        }
    }
}

impl ComponentSettings for UpdaterSettings {}

impl UpdaterSettings {
    pub(crate) fn validate(&self) -> TrainResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainError::config(format!(
                "learning rate must be positive, found {}",
                self.learning_rate
            )));
        }
        if let Some(momentum) = self.momentum {
            if !(0.0..1.0).contains(&momentum) {
                return Err(TrainError::config(format!(
                    "momentum must lie in [0, 1), found {}",
                    momentum
                )));
            }
        }
        match self.variant.to_lowercase().as_str() {
            "nesterovs" | "sgd" | "adam" => Ok(()),
            other => Err(TrainError::config(format!(
                "unknown updater {}, expected one of nesterovs, sgd or adam",
                other
            ))),
        }
    }
}

/// Optimizer configuration resolved from the settings. The L2 coefficient is applied as
/// weight decay on every parameter.
#[derive(Clone)]
pub enum Updater {
    Sgd(SgdConfig),
    Adam(AdamConfig),
}

impl Updater {
    pub fn new(settings: &UpdaterSettings, l2: f64) -> TrainResult<Self> {
        settings.validate()?;
        let weight_decay = match l2 > 0.0 {
            true => Some(WeightDecayConfig::new(l2 as f32)),
            false => None,
        };
        let momentum = settings.momentum.unwrap_or(0.9);

        let updater = match settings.variant.to_lowercase().as_str() {
            "nesterovs" => Updater::Sgd(
                SgdConfig::new()
                    .with_momentum(Some(
                        MomentumConfig::new()
                            .with_momentum(momentum)
                            .with_dampening(0.0)
                            .with_nesterov(true),
                    ))
                    .with_weight_decay(weight_decay),
            ),
            "sgd" => Updater::Sgd(
                SgdConfig::new()
                    .with_momentum(settings.momentum.map(|momentum| {
                        MomentumConfig::new()
                            .with_momentum(momentum)
                            .with_dampening(0.0)
                    }))
                    .with_weight_decay(weight_decay),
            ),
            _ => Updater::Adam(AdamConfig::new().with_weight_decay(weight_decay)),
        };
        Ok(updater)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Updater::Sgd(_) => "sgd",
            Updater::Adam(_) => "adam",
        }
    }
}
