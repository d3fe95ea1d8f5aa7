use std::panic;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::vision::{MnistDataset, MnistItem};
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, Int, Tensor, TensorData};
use log::debug;

use digitrain_core::error::{TrainError, TrainResult};

use crate::models::data::dataset::{DatasetSplit, SampleBatcher};

pub(crate) const MNIST_CLASSES: usize = 10;
pub(crate) const MNIST_SIDE: usize = 28;
const MNIST_MEAN: f64 = 0.1307;
const MNIST_STD: f64 = 0.3081;

#[derive(Default, Clone, Debug)]
pub struct MnistSplit {
    pub images: Vec<MnistItem>,
}

impl MnistSplit {
    /// Fetches one split of MNIST through the burn dataset cache. The download panics inside
    /// burn when the files cannot be fetched or decoded, which is reported as unavailable data.
    pub fn load(split: DatasetSplit) -> TrainResult<Self> {
        let dataset = panic::catch_unwind(|| match split {
            DatasetSplit::Train => MnistDataset::train(),
            DatasetSplit::Test => MnistDataset::test(),
        })
        .map_err(|cause| {
            let reason = cause
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| cause.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown failure".to_string());
            TrainError::data(format!("unable to load the MNIST {} split: {}", split, reason))
        })?;

        let images: Vec<MnistItem> = dataset.iter().collect();
        if images.is_empty() {
            return Err(TrainError::data(format!("the MNIST {} split is empty", split)));
        }
        debug!("Loaded {} MNIST {} images", images.len(), split);
        Ok(Self { images })
    }

    pub fn with_images(images: Vec<MnistItem>) -> Self {
        Self { images }
    }
}

impl Dataset<MnistItem> for MnistSplit {
    fn get(&self, index: usize) -> Option<MnistItem> {
        self.images.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// Images are `[batch, 1, 28, 28]`, labels are one-hot `[batch, 10]` and targets hold the
/// class indices used by the loss.
#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<MnistItem, MnistBatch<B>> for SampleBatcher<B> {
    fn batch(&self, items: Vec<MnistItem>) -> MnistBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image))
            .map(|data| Tensor::<B, 2>::from_data(data.convert::<B::FloatElem>(), &self.device))
            .map(|tensor| tensor.reshape([1, 1, MNIST_SIDE, MNIST_SIDE]))
            .map(|tensor| ((tensor / 255) - MNIST_MEAN) / MNIST_STD)
            .collect();

        let mut one_hot = vec![0.0f32; items.len() * MNIST_CLASSES];
        items
            .iter()
            .enumerate()
            .for_each(|(row, item)| one_hot[row * MNIST_CLASSES + item.label as usize] = 1.0);
        let labels = Tensor::<B, 2>::from_data(
            TensorData::new(one_hot, [items.len(), MNIST_CLASSES]).convert::<B::FloatElem>(),
            &self.device,
        );

        let classes: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(classes, [items.len()]).convert::<B::IntElem>(),
            &self.device,
        );

        let images = Tensor::cat(images, 0);

        MnistBatch {
            images,
            labels,
            targets,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::sync::{Mutex, MutexGuard, Once};

    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataloader::batcher::Batcher;
    use burn::data::dataset::vision::MnistItem;
    use log::{LevelFilter, Log, Metadata, Record};

    use super::*;

    pub(crate) type TestBackend = Autodiff<NdArray<f32>>;

    static BACKEND_LOCK: Mutex<()> = Mutex::new(());

    /// Tests that seed the backend share one global generator and must not interleave.
    pub(crate) fn backend_lock() -> MutexGuard<'static, ()> {
        BACKEND_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    thread_local! {
        static CAPTURED: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
    }

    /// Forwards to env_logger and keeps the info lines of threads inside [`capture_logs`].
    struct CaptureLogger {
        inner: env_logger::Logger,
    }

    impl Log for CaptureLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= LevelFilter::Info || self.inner.enabled(metadata)
        }

        fn log(&self, record: &Record) {
            if self.inner.matches(record) {
                self.inner.log(record);
            }
            if record.level() <= LevelFilter::Info {
                let _ = CAPTURED.try_with(|captured| {
                    if let Some(lines) = captured.borrow_mut().as_mut() {
                        lines.push(record.args().to_string());
                    }
                });
            }
        }

        fn flush(&self) {
            self.inner.flush();
        }
    }

    static LOGGER: Once = Once::new();

    pub(crate) fn init_logger() {
        LOGGER.call_once(|| {
            let inner = env_logger::Builder::from_env(env_logger::Env::default())
                .is_test(true)
                .build();
            let max_level = inner.filter().max(LevelFilter::Info);
            let logger: &'static CaptureLogger = Box::leak(Box::new(CaptureLogger { inner }));
            if log::set_logger(logger).is_ok() {
                log::set_max_level(max_level);
            }
        });
    }

    /// Runs `body` and returns it with every info line the current thread logged meanwhile.
    pub(crate) fn capture_logs<T>(body: impl FnOnce() -> T) -> (T, Vec<String>) {
        init_logger();
        CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
        let result = body();
        let lines = CAPTURED.with(|captured| captured.borrow_mut().take().unwrap_or_default());
        (result, lines)
    }

    /// Each digit is a bright horizontal bar whose row depends on the label.
    pub(crate) fn synthetic_items(count: usize) -> Vec<MnistItem> {
        (0..count)
            .map(|index| {
                let label = (index % MNIST_CLASSES) as u8;
                let mut image = [[0.0f32; 28]; 28];
                let row = 2 * label as usize + 3;
                let shift = index % 4;
                for column in (4 + shift)..(20 + shift) {
                    image[row][column] = 255.0;
                    image[row + 1][column] = 200.0;
                }
                MnistItem { image, label }
            })
            .collect()
    }

    pub(crate) fn synthetic_split(count: usize) -> MnistSplit {
        MnistSplit::with_images(synthetic_items(count))
    }

    #[test]
    fn test_batch_shapes() {
        let batcher = SampleBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(synthetic_items(6));
        assert_eq!(batch.images.dims(), [6, 1, 28, 28]);
        assert_eq!(batch.labels.dims(), [6, 10]);
        assert_eq!(batch.targets.dims(), [6]);
    }

    #[test]
    fn test_labels_are_one_hot() {
        let batcher = SampleBatcher::<TestBackend>::new(Default::default());
        let items = synthetic_items(12);
        let batch = batcher.batch(items.clone());

        let row_sums: Vec<f32> = batch.labels.clone().sum_dim(1).into_data().iter().collect();
        assert!(row_sums.iter().all(|sum| *sum == 1.0));

        let labels: Vec<f32> = batch.labels.into_data().iter().collect();
        for (row, item) in items.iter().enumerate() {
            assert_eq!(labels[row * MNIST_CLASSES + item.label as usize], 1.0);
        }
        let targets: Vec<i64> = batch.targets.into_data().iter().collect();
        let expected: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_images_are_normalised() {
        let batcher = SampleBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(synthetic_items(1));
        let pixels: Vec<f32> = batch.images.into_data().iter().collect();
        let background = ((0.0 - MNIST_MEAN) / MNIST_STD) as f32;
        let bright = ((1.0 - MNIST_MEAN) / MNIST_STD) as f32;
        assert!((pixels[0] - background).abs() < 1e-5);
        assert!((pixels[3 * 28 + 4] - bright).abs() < 1e-5);
    }

    #[test]
    fn test_split_as_dataset() {
        let split = synthetic_split(5);
        assert_eq!(split.len(), 5);
        assert_eq!(split.get(3).map(|item| item.label), Some(3));
        assert!(split.get(5).is_none());
    }
}
