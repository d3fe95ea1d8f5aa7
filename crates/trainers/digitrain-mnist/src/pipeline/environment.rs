use burn::prelude::Backend;
use log::info;

use digitrain_core::accelerator::{AcceleratorSettings, DeviceLayout, Precision};
use digitrain_core::error::{TrainError, TrainResult};

use crate::models::ai::aggregate::Transfer;

/// Precision and device placement for one run. Created once and handed to the trainer.
#[derive(Debug, Clone)]
pub(crate) struct Environment<B: Backend> {
    precision: Precision,
    devices: Vec<B::Device>,
    layout: DeviceLayout,
}

impl<B: Backend> Environment<B> {
    /// `devices` are the accelerators the backend exposes, in preference order.
    pub(crate) fn new(
        settings: &AcceleratorSettings,
        devices: Vec<B::Device>,
        workers: usize,
        replica_bytes: u64,
    ) -> TrainResult<Self> {
        if devices.is_empty() {
            return Err(TrainError::ResourceExhaustion(
                "the backend exposes no device".to_string(),
            ));
        }
        let available = AcceleratorSettings {
            device_count: settings.device_count.min(devices.len()),
            ..settings.clone()
        };
        let layout = DeviceLayout::plan(&available, workers, replica_bytes)?;
        info!(
            "Precision {:?}, {} device(s) for {} worker(s), {} bytes per device",
            settings.precision, layout.device_count, workers, layout.bytes_per_device
        );

        Ok(Self {
            precision: settings.precision,
            devices,
            layout,
        })
    }

    pub(crate) fn precision(&self) -> Precision {
        self.precision
    }

    /// Averaging and evaluation happen here.
    pub(crate) fn main_device(&self) -> B::Device {
        self.devices[0].clone()
    }

    pub(crate) fn worker_devices(&self) -> Vec<B::Device> {
        (0..self.layout.assignments.len())
            .map(|worker| self.devices[self.layout.device_of(worker)].clone())
            .collect()
    }

    pub(crate) fn transfer(&self) -> Transfer {
        Transfer::new(self.layout.cross_device_access)
    }
}
