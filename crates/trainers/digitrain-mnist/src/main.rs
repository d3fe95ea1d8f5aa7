use std::time::Instant;

use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::tensor::f16;
use clap::Parser;
use log::error;

use digitrain_core::accelerator::{AcceleratorSettings, Precision};
use digitrain_core::error::TrainResult;

use crate::pipeline::builder::RunBuilder;

mod models;
mod pipeline;

pub type SingleBackend = Autodiff<Wgpu<f32, i32>>;
pub type HalfBackend = Autodiff<Wgpu<f16, i32>>;

#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
struct CliArgs {
    #[arg(short = 'c', long, value_name = "CONFIG_FILE")]
    config: Option<String>,
}

fn wgpu_devices(settings: &AcceleratorSettings) -> Vec<WgpuDevice> {
    match settings.multi_device && settings.device_count > 1 {
        true => (0..settings.device_count).map(WgpuDevice::DiscreteGpu).collect(),
        false => vec![WgpuDevice::BestAvailable],
    }
}

fn run(args: &CliArgs) -> TrainResult<()> {
    let builder = RunBuilder::new(args.config.as_deref())?;
    builder.init_logging()?;
    let devices = wgpu_devices(builder.accelerator());
    match builder.precision() {
        Precision::Half => builder.run::<HalfBackend>(devices)?,
        Precision::Single => builder.run::<SingleBackend>(devices)?,
    };
    Ok(())
}

fn main() {
    let args = CliArgs::parse();
    let start = Instant::now();
    if let Err(e) = run(&args) {
        error!("Run failed: {}", e);
        eprintln!("Run failed: {}", e);
        std::process::exit(1);
    }
    println!("Run finished in {} ms.", start.elapsed().as_millis());
}
