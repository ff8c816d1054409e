//! Prefetching batch loader.
//!
//! One producer thread per epoch walks the planned batches, decodes and
//! augments each batch on a bounded rayon pool and hands finished host
//! buffers over a bounded channel. Tensors are built on the consumer side.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};
use crossbeam_channel::{bounded, Receiver};
use dataset::{ImageTensor, MaskDataset, Subset};
use rand::{rngs::StdRng, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::TrainingError;

use super::{DataBatch, Result};

#[derive(Debug)]
struct HostBatch {
    images: Vec<f32>,
    height: usize,
    width: usize,
    labels: Vec<u32>,
}

pub struct BatchLoader {
    dataset: Arc<MaskDataset>,
    pool: Arc<ThreadPool>,
    device: Device,
    prefetch: usize,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<MaskDataset>,
        num_workers: usize,
        prefetch: usize,
        device: Device,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|idx| format!("loader-{idx}"))
            .build()
            .map_err(|err| {
                TrainingError::initialization(format!("failed to build loader pool: {err}"))
            })?;
        Ok(Self {
            dataset,
            pool: Arc::new(pool),
            device,
            prefetch: prefetch.max(1),
        })
    }

    /// Streams `batches` of subset positions. Random augmentation runs only
    /// when `train` is set; `seed` fixes it per batch slot, so an index drawn
    /// twice still gets independent augmentation.
    pub fn stream(
        &self,
        subset: &Subset,
        batches: Vec<Vec<usize>>,
        train: bool,
        seed: u64,
    ) -> Result<BatchStream> {
        let members = subset.indices();
        let mut planned = Vec::with_capacity(batches.len());
        for batch in batches {
            let indices = batch
                .into_iter()
                .map(|pos| {
                    members.get(pos).copied().ok_or_else(|| {
                        TrainingError::runtime(format!(
                            "sampler produced position {pos} outside subset of {}",
                            members.len()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            planned.push(indices);
        }

        let total = planned.len();
        let (sender, receiver) = bounded(self.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let pool = Arc::clone(&self.pool);
        let handle = thread::Builder::new()
            .name("batch-producer".into())
            .spawn(move || {
                for (batch_no, indices) in planned.into_iter().enumerate() {
                    let batch = pool.install(|| {
                        load_host_batch(&dataset, &indices, train, batch_seed(seed, batch_no))
                    });
                    let failed = batch.is_err();
                    if sender.send(batch).is_err() || failed {
                        break;
                    }
                }
            })
            .map_err(|err| {
                TrainingError::runtime(format!("failed to spawn batch producer: {err}"))
            })?;

        Ok(BatchStream {
            receiver: Some(receiver),
            handle: Some(handle),
            device: self.device.clone(),
            remaining: total,
            total,
        })
    }

    /// Sequential, unshuffled batches over the whole subset.
    pub fn sequential(&self, subset: &Subset, batch_size: usize, seed: u64) -> Result<BatchStream> {
        let batches = (0..subset.len())
            .collect::<Vec<_>>()
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        self.stream(subset, batches, false, seed)
    }
}

pub struct BatchStream {
    receiver: Option<Receiver<Result<HostBatch>>>,
    handle: Option<JoinHandle<()>>,
    device: Device,
    remaining: usize,
    total: usize,
}

impl BatchStream {
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl Iterator for BatchStream {
    type Item = Result<DataBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let receiver = self.receiver.as_ref()?;
        let host = match receiver.recv() {
            Ok(host) => host,
            Err(_) => {
                self.remaining = 0;
                return Some(Err(TrainingError::runtime(
                    "batch producer stopped before the epoch finished",
                )));
            }
        };
        self.remaining -= 1;
        Some(host.and_then(|host| to_device_batch(host, &self.device)))
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Disconnect first so a producer blocked on a full channel exits.
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("batch producer thread panicked");
            }
        }
    }
}

fn load_host_batch(
    dataset: &MaskDataset,
    indices: &[usize],
    train: bool,
    seed: u64,
) -> Result<HostBatch> {
    let samples: Vec<(ImageTensor, u32)> = indices
        .par_iter()
        .enumerate()
        .map(|(slot, &idx)| {
            let mut rng = StdRng::seed_from_u64(sample_seed(seed, slot, idx));
            dataset.get(idx, train, &mut rng)
        })
        .collect::<dataset::DatasetResult<_>>()?;

    let Some((first, _)) = samples.first() else {
        return Err(TrainingError::runtime("planned batch is empty"));
    };
    let (height, width) = (first.height, first.width);
    let num_classes = dataset.num_classes() as u32;

    let mut images = Vec::with_capacity(samples.len() * first.data.len());
    let mut labels = Vec::with_capacity(samples.len());
    for ((tensor, label), idx) in samples.into_iter().zip(indices) {
        if (tensor.height, tensor.width) != (height, width) {
            return Err(TrainingError::runtime(format!(
                "malformed batch: sample {idx} is {}x{} but batch is {height}x{width}",
                tensor.height, tensor.width
            )));
        }
        if label >= num_classes {
            return Err(TrainingError::runtime(format!(
                "malformed batch: sample {idx} has label {label} outside 0..{num_classes}"
            )));
        }
        images.extend_from_slice(&tensor.data);
        labels.push(label);
    }

    Ok(HostBatch {
        images,
        height: height as usize,
        width: width as usize,
        labels,
    })
}

fn to_device_batch(host: HostBatch, device: &Device) -> Result<DataBatch> {
    let n = host.labels.len();
    let images = Tensor::from_vec(host.images, (n, 3, host.height, host.width), device)
        .map_err(to_runtime_error)?;
    let labels = Tensor::from_vec(host.labels.clone(), n, device).map_err(to_runtime_error)?;
    Ok(DataBatch {
        images,
        labels,
        label_ids: host.labels,
    })
}

fn batch_seed(seed: u64, batch_no: usize) -> u64 {
    mix64(seed ^ (batch_no as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn sample_seed(base: u64, slot: usize, index: usize) -> u64 {
    mix64(mix64(base ^ slot as u64) ^ (index as u64).rotate_left(32))
}

// splitmix64 finalizer.
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
