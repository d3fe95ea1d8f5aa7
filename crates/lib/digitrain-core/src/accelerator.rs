use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::{TrainError, TrainResult};
use crate::settings::ComponentSettings;

/// Weights, their gradients and one optimizer slot are held per replica.
const REPLICA_STATE_FACTOR: u64 = 3;

/// Storage precision of floating point tensors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    #[default]
    Single,
}

impl Precision {
    pub fn bytes_per_element(&self) -> u64 {
        match self {
            Precision::Half => 2,
            Precision::Single => 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct AcceleratorSettings {
    #[serde(default)]
    #[builder(default)]
    pub precision: Precision,
    pub multi_device: bool,
    pub max_device_cache_bytes: u64,
    pub cross_device_access: bool,
    #[serde(default = "default_device_count")]
    #[builder(default = 1)]
    pub device_count: usize,
}

fn default_device_count() -> usize {
    1
}

impl Default for AcceleratorSettings {
    fn default() -> Self {
        Self {
            precision: Precision::Single,
            multi_device: true,
            max_device_cache_bytes: 2 * 1024 * 1024 * 1024,
            cross_device_access: true,
            device_count: 1,
        }
    }
}

impl ComponentSettings for AcceleratorSettings {}

/// Memory needed to hold one training replica of a network with `param_count` parameters.
pub fn replica_bytes(param_count: usize, precision: Precision) -> u64 {
    param_count as u64 * precision.bytes_per_element() * REPLICA_STATE_FACTOR
}

/// Placement of training workers on the available devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    pub device_count: usize,
    pub assignments: Vec<usize>,
    pub bytes_per_device: u64,
    pub cross_device_access: bool,
}

impl DeviceLayout {
    /// Spreads `workers` over the devices allowed by the settings, round robin, and checks
    /// that the replicas placed on the busiest device fit under the cache ceiling.
    pub fn plan(
        settings: &AcceleratorSettings,
        workers: usize,
        replica_bytes: u64,
    ) -> TrainResult<Self> {
        if workers == 0 {
            return Err(TrainError::config("at least one training worker is required"));
        }
        if settings.device_count == 0 {
            return Err(TrainError::ResourceExhaustion(
                "no accelerator device is available".to_string(),
            ));
        }

        let device_count = match settings.multi_device {
            true => settings.device_count.min(workers),
            false => 1,
        };
        let assignments: Vec<usize> = (0..workers).map(|worker| worker % device_count).collect();
        let busiest = workers.div_ceil(device_count) as u64;
        let bytes_per_device = busiest * replica_bytes;

        if bytes_per_device > settings.max_device_cache_bytes {
            return Err(TrainError::ResourceExhaustion(format!(
                "{} replicas need {} bytes on one device, cache ceiling is {} bytes",
                busiest, bytes_per_device, settings.max_device_cache_bytes
            )));
        }

        Ok(Self {
            device_count,
            assignments,
            bytes_per_device,
            cross_device_access: settings.cross_device_access && device_count > 1,
        })
    }

    pub fn device_of(&self, worker: usize) -> usize {
        self.assignments[worker % self.assignments.len()]
    }
}
