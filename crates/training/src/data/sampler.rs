//! Per-epoch iteration orders over a training subset.
//!
//! Samplers work on subset-local positions (`0..labels.len()`); the loader
//! maps them back to dataset indices.

use std::{collections::BTreeMap, fmt, str::FromStr};

use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    seq::SliceRandom,
    SeedableRng,
};

use crate::{config::UnknownName, TrainingError};

use super::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    UniformShuffle,
    InverseFrequencyWeighted,
    DynamicBalance,
    PairedBalance,
}

impl FromStr for SamplerKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "uniform-shuffle" | "uniform" | "none" | "" => Ok(Self::UniformShuffle),
            "inverse-frequency-weighted" | "weighted" | "imbalanced" => {
                Ok(Self::InverseFrequencyWeighted)
            }
            "dynamic-balance" | "dynamic" => Ok(Self::DynamicBalance),
            "paired-balance" | "balance" => Ok(Self::PairedBalance),
            _ => Err(UnknownName::new(
                "sampler",
                s,
                "uniform-shuffle, inverse-frequency-weighted, dynamic-balance, paired-balance",
            )),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplerKind::UniformShuffle => "uniform-shuffle",
            SamplerKind::InverseFrequencyWeighted => "inverse-frequency-weighted",
            SamplerKind::DynamicBalance => "dynamic-balance",
            SamplerKind::PairedBalance => "paired-balance",
        };
        f.write_str(name)
    }
}

/// Parameters shared by every sampler.
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub batch_size: usize,
    pub seed: u64,
    pub dynamic_lambda: f64,
    pub classes_per_batch: usize,
    pub samples_per_class: usize,
}

pub trait BatchSampler: Send {
    /// Batches of subset positions for `epoch`; identical for identical
    /// seed and epoch.
    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>>;

    /// Number of batches `epoch_batches` yields.
    fn batches_per_epoch(&self) -> usize;

    fn kind(&self) -> SamplerKind;
}

pub fn build_sampler(
    kind: SamplerKind,
    labels: &[u32],
    options: &SamplerOptions,
) -> Result<Box<dyn BatchSampler>> {
    if labels.is_empty() {
        return Err(TrainingError::initialization(
            "training subset is empty; nothing to sample",
        ));
    }
    if options.batch_size == 0 {
        return Err(TrainingError::initialization(
            "sampler batch size must be greater than zero",
        ));
    }
    let sampler: Box<dyn BatchSampler> = match kind {
        SamplerKind::UniformShuffle => Box::new(UniformShuffle {
            len: labels.len(),
            batch_size: options.batch_size,
            seed: options.seed,
        }),
        SamplerKind::InverseFrequencyWeighted => {
            Box::new(InverseFrequency::new(labels, options.batch_size, options.seed)?)
        }
        SamplerKind::DynamicBalance => Box::new(DynamicBalance::new(
            labels,
            options.dynamic_lambda,
            options.batch_size,
            options.seed,
        )),
        SamplerKind::PairedBalance => Box::new(PairedBalance::new(
            labels,
            options.classes_per_batch,
            options.samples_per_class,
            options.seed,
        )?),
    };
    Ok(sampler)
}

fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(epoch as u64))
}

fn chunk(order: Vec<usize>, batch_size: usize) -> Vec<Vec<usize>> {
    order.chunks(batch_size).map(|c| c.to_vec()).collect()
}

fn group_by_class(labels: &[u32]) -> BTreeMap<u32, Vec<usize>> {
    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (pos, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(pos);
    }
    groups
}

struct UniformShuffle {
    len: usize,
    batch_size: usize,
    seed: u64,
}

impl BatchSampler for UniformShuffle {
    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len).collect();
        order.shuffle(&mut epoch_rng(self.seed, epoch));
        chunk(order, self.batch_size)
    }

    fn batches_per_epoch(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    fn kind(&self) -> SamplerKind {
        SamplerKind::UniformShuffle
    }
}

/// `N` draws with replacement, each example weighted by `total / class_count`.
struct InverseFrequency {
    weights: WeightedIndex<f64>,
    len: usize,
    batch_size: usize,
    seed: u64,
}

impl InverseFrequency {
    fn new(labels: &[u32], batch_size: usize, seed: u64) -> Result<Self> {
        let groups = group_by_class(labels);
        let total = labels.len() as f64;
        let weights: Vec<f64> = labels
            .iter()
            .map(|label| {
                let count = groups.get(label).map_or(1, Vec::len) as f64;
                total / count
            })
            .collect();
        let weights = WeightedIndex::new(weights).map_err(|err| {
            TrainingError::initialization(format!("invalid sampling weights: {err}"))
        })?;
        Ok(Self {
            weights,
            len: labels.len(),
            batch_size,
            seed,
        })
    }
}

impl BatchSampler for InverseFrequency {
    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = epoch_rng(self.seed, epoch);
        let order: Vec<usize> = (0..self.len)
            .map(|_| self.weights.sample(&mut rng))
            .collect();
        chunk(order, self.batch_size)
    }

    fn batches_per_epoch(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    fn kind(&self) -> SamplerKind {
        SamplerKind::InverseFrequencyWeighted
    }
}

/// Class quotas shrink from the natural distribution towards the smallest
/// class as epochs advance.
struct DynamicBalance {
    groups: BTreeMap<u32, Vec<usize>>,
    min_count: usize,
    lambda: f64,
    batch_size: usize,
    seed: u64,
}

impl DynamicBalance {
    fn new(labels: &[u32], lambda: f64, batch_size: usize, seed: u64) -> Self {
        let groups = group_by_class(labels);
        let min_count = groups.values().map(Vec::len).min().unwrap_or(0);
        Self {
            groups,
            min_count,
            lambda,
            batch_size,
            seed,
        }
    }

    fn quota(&self, count: usize, epoch: usize) -> usize {
        if self.min_count == 0 {
            return 0;
        }
        let min = self.min_count as f64;
        let ratio = count as f64 / min;
        let exponent = self.lambda.powi(epoch as i32);
        (min * ratio.powf(exponent)).floor() as usize
    }

    fn epoch_len(&self, epoch: usize) -> usize {
        self.groups
            .values()
            .map(|members| self.quota(members.len(), epoch))
            .sum()
    }
}

impl BatchSampler for DynamicBalance {
    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = epoch_rng(self.seed, epoch);
        let mut order = Vec::with_capacity(self.epoch_len(epoch));
        for members in self.groups.values() {
            let quota = self.quota(members.len(), epoch);
            if quota > members.len() {
                order.extend((0..quota).filter_map(|_| members.choose(&mut rng).copied()));
            } else {
                order.extend(members.choose_multiple(&mut rng, quota).copied());
            }
        }
        order.shuffle(&mut rng);
        chunk(order, self.batch_size)
    }

    fn batches_per_epoch(&self) -> usize {
        self.epoch_len(0).div_ceil(self.batch_size)
    }

    fn kind(&self) -> SamplerKind {
        SamplerKind::DynamicBalance
    }
}

/// Every class once per epoch, `p` distinct classes of `k` examples per batch.
/// The last batch holds the leftover classes.
struct PairedBalance {
    groups: BTreeMap<u32, Vec<usize>>,
    p: usize,
    k: usize,
    seed: u64,
}

impl PairedBalance {
    fn new(labels: &[u32], p: usize, k: usize, seed: u64) -> Result<Self> {
        let groups = group_by_class(labels);
        if p <= 1 || p > groups.len() {
            return Err(TrainingError::initialization(format!(
                "paired-balance needs 1 < classes_per_batch <= {} distinct classes, got {}",
                groups.len(),
                p
            )));
        }
        if k <= 1 {
            return Err(TrainingError::initialization(format!(
                "paired-balance needs samples_per_class > 1, got {k}"
            )));
        }
        Ok(Self { groups, p, k, seed })
    }
}

impl BatchSampler for PairedBalance {
    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = epoch_rng(self.seed, epoch);
        let mut classes: Vec<&Vec<usize>> = self.groups.values().collect();
        classes.shuffle(&mut rng);
        classes
            .chunks(self.p)
            .map(|picked| {
                let mut batch = Vec::with_capacity(picked.len() * self.k);
                for members in picked {
                    batch.extend(members.choose_multiple(&mut rng, self.k).copied());
                    // Small classes give every member, then top up with repeats.
                    let missing = self.k.saturating_sub(members.len());
                    batch.extend((0..missing).filter_map(|_| members.choose(&mut rng).copied()));
                }
                batch
            })
            .collect()
    }

    fn batches_per_epoch(&self) -> usize {
        self.groups.len().div_ceil(self.p)
    }

    fn kind(&self) -> SamplerKind {
        SamplerKind::PairedBalance
    }
}
