//! Mask image folder dataset.
//!
//! Layout: one directory per person named `{id}_{gender}_{race}_{age}`, each
//! holding seven photos (`mask1`..`mask5`, `incorrect_mask`, `normal`).

use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use image::RgbImage;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    augmentation::{Augmentation, ImageTensor, Normalize},
    DatasetError, DatasetResult,
};

pub const NUM_CLASSES: usize = 18;
pub const DEFAULT_MEAN: [f32; 3] = [0.548, 0.504, 0.479];
pub const DEFAULT_STD: [f32; 3] = [0.237, 0.247, 0.246];

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskLabel {
    Mask = 0,
    Incorrect = 1,
    Normal = 2,
}

impl MaskLabel {
    fn from_file_stem(stem: &str) -> Option<Self> {
        match stem {
            "incorrect_mask" => Some(Self::Incorrect),
            "normal" => Some(Self::Normal),
            s if s.starts_with("mask") => Some(Self::Mask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenderLabel {
    Male = 0,
    Female = 1,
}

impl FromStr for GenderLabel {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            other => Err(DatasetError::Other(format!(
                "gender must be male or female, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeLabel {
    Young = 0,
    Middle = 1,
    Old = 2,
}

impl AgeLabel {
    /// With `age_filter`, ages 58 and 59 already count as old.
    pub fn from_age(age: u32, age_filter: bool) -> Self {
        let old_from = if age_filter { 58 } else { 60 };
        if age < 30 {
            Self::Young
        } else if age < old_from {
            Self::Middle
        } else {
            Self::Old
        }
    }
}

pub fn encode_multi_class(mask: MaskLabel, gender: GenderLabel, age: AgeLabel) -> u32 {
    mask as u32 * 6 + gender as u32 * 3 + age as u32
}

pub fn decode_multi_class(label: u32) -> Option<(MaskLabel, GenderLabel, AgeLabel)> {
    if label as usize >= NUM_CLASSES {
        return None;
    }
    let mask = match label / 6 {
        0 => MaskLabel::Mask,
        1 => MaskLabel::Incorrect,
        _ => MaskLabel::Normal,
    };
    let gender = if (label / 3) % 2 == 0 {
        GenderLabel::Male
    } else {
        GenderLabel::Female
    };
    let age = match label % 3 {
        0 => AgeLabel::Young,
        1 => AgeLabel::Middle,
        _ => AgeLabel::Old,
    };
    Some((mask, gender, age))
}

/// Registry of dataset variants; they differ only in how the held-out split
/// is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Random split over individual images.
    MaskBaseDataset,
    /// Split over people, so nobody appears in both subsets.
    MaskSplitByProfileDataset,
}

impl FromStr for DatasetKind {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maskbasedataset" | "base" => Ok(Self::MaskBaseDataset),
            "masksplitbyprofiledataset" | "profile" => Ok(Self::MaskSplitByProfileDataset),
            other => Err(DatasetError::Other(format!(
                "unknown dataset '{other}' (expected MaskBaseDataset or MaskSplitByProfileDataset)"
            ))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::MaskBaseDataset => f.write_str("MaskBaseDataset"),
            DatasetKind::MaskSplitByProfileDataset => f.write_str("MaskSplitByProfileDataset"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaskDatasetConfig {
    pub data_dir: PathBuf,
    pub kind: DatasetKind,
    pub val_ratio: f32,
    pub age_filter: bool,
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct SampleRecord {
    path: PathBuf,
    profile: usize,
    label: u32,
}

/// Ordered view over a subset of dataset indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subset {
    indices: Vec<usize>,
}

impl Subset {
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Labels of the subset members, in subset order.
    pub fn labels(&self, dataset: &MaskDataset) -> Vec<u32> {
        self.indices.iter().map(|&idx| dataset.label(idx)).collect()
    }
}

pub struct MaskDataset {
    root: PathBuf,
    kind: DatasetKind,
    val_ratio: f32,
    seed: u64,
    profiles: Vec<String>,
    samples: Vec<SampleRecord>,
    normalize: Normalize,
    transform: Option<Arc<dyn Augmentation>>,
}

impl fmt::Debug for MaskDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskDataset")
            .field("root", &self.root)
            .field("kind", &self.kind)
            .field("profiles", &self.profiles.len())
            .field("samples", &self.samples.len())
            .field("normalize", &self.normalize)
            .finish()
    }
}

impl MaskDataset {
    pub fn open(config: MaskDatasetConfig) -> DatasetResult<Self> {
        if !(0.0..1.0).contains(&config.val_ratio) {
            return Err(DatasetError::Other(format!(
                "val_ratio must be in [0, 1), got {}",
                config.val_ratio
            )));
        }

        let mut profile_dirs = Vec::new();
        let entries =
            fs::read_dir(&config.data_dir).map_err(|err| DatasetError::io(&config.data_dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| DatasetError::io(&config.data_dir, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            profile_dirs.push((name, entry.path()));
        }
        profile_dirs.sort();

        let mut profiles = Vec::with_capacity(profile_dirs.len());
        let mut samples = Vec::new();
        for (name, dir) in profile_dirs {
            let (gender, age) = parse_profile_name(&name, &dir, config.age_filter)?;
            let profile = profiles.len();
            profiles.push(name);

            let mut files = Vec::new();
            for entry in fs::read_dir(&dir).map_err(|err| DatasetError::io(&dir, err))? {
                let entry = entry.map_err(|err| DatasetError::io(&dir, err))?;
                files.push(entry.path());
            }
            files.sort();

            for path in files {
                let Some(mask) = mask_label_for(&path) else {
                    continue;
                };
                samples.push(SampleRecord {
                    path,
                    profile,
                    label: encode_multi_class(mask, gender, age),
                });
            }
        }

        if samples.is_empty() {
            return Err(DatasetError::layout(
                &config.data_dir,
                "no labelled images found",
            ));
        }

        log::info!(
            "{} indexed {} images across {} profiles in {}",
            config.kind,
            samples.len(),
            profiles.len(),
            config.data_dir.display()
        );

        Ok(Self {
            root: config.data_dir,
            kind: config.kind,
            val_ratio: config.val_ratio,
            seed: config.seed,
            profiles,
            samples,
            normalize: Normalize::new(DEFAULT_MEAN, DEFAULT_STD)?,
            transform: None,
        })
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn num_classes(&self) -> usize {
        NUM_CLASSES
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> [f32; 3] {
        self.normalize.mean
    }

    pub fn std(&self) -> [f32; 3] {
        self.normalize.std
    }

    pub fn normalize(&self) -> Normalize {
        self.normalize
    }

    pub fn label(&self, index: usize) -> u32 {
        self.samples[index].label
    }

    pub fn get_all_labels(&self) -> Vec<u32> {
        self.samples.iter().map(|s| s.label).collect()
    }

    pub fn set_transform(&mut self, transform: Arc<dyn Augmentation>) {
        log::debug!("dataset transform set to {}", transform.describe());
        self.transform = Some(transform);
    }

    pub fn load_image(&self, index: usize) -> DatasetResult<RgbImage> {
        let record = self.samples.get(index).ok_or_else(|| {
            DatasetError::Other(format!(
                "sample index {index} out of range ({} samples)",
                self.samples.len()
            ))
        })?;
        let image = image::open(&record.path).map_err(|source| DatasetError::Image {
            path: record.path.clone(),
            source,
        })?;
        Ok(image.to_rgb8())
    }

    /// Loads sample `index` through the configured transform.
    pub fn get(
        &self,
        index: usize,
        train: bool,
        rng: &mut StdRng,
    ) -> DatasetResult<(ImageTensor, u32)> {
        let transform = self.transform.as_ref().ok_or_else(|| {
            DatasetError::Other("dataset transform must be set before loading samples".into())
        })?;
        let image = self.load_image(index)?;
        let tensor = transform.apply(&image, train, rng)?;
        Ok((tensor, self.samples[index].label))
    }

    /// Splits into (train, validation) subsets according to the dataset kind.
    pub fn split_dataset(&self) -> (Subset, Subset) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let (mut train, mut val) = match self.kind {
            DatasetKind::MaskBaseDataset => {
                let mut order: Vec<usize> = (0..self.samples.len()).collect();
                order.shuffle(&mut rng);
                let n_val = (order.len() as f64 * self.val_ratio as f64) as usize;
                let train = order.split_off(n_val);
                (train, order)
            }
            DatasetKind::MaskSplitByProfileDataset => {
                let mut profiles: Vec<usize> = (0..self.profiles.len()).collect();
                profiles.shuffle(&mut rng);
                let n_val = (profiles.len() as f64 * self.val_ratio as f64) as usize;
                let val_profiles: BTreeSet<usize> = profiles[..n_val].iter().copied().collect();
                self.samples
                    .iter()
                    .enumerate()
                    .map(|(idx, sample)| (idx, val_profiles.contains(&sample.profile)))
                    .fold((Vec::new(), Vec::new()), |(mut train, mut val), (idx, is_val)| {
                        if is_val {
                            val.push(idx);
                        } else {
                            train.push(idx);
                        }
                        (train, val)
                    })
            }
        };
        train.sort_unstable();
        val.sort_unstable();
        (Subset::new(train), Subset::new(val))
    }

    /// Estimates per-channel mean/std from up to `max_samples` images and
    /// adopts them as the dataset's normalization constants.
    pub fn compute_statistics(&mut self, max_samples: usize) -> DatasetResult<Normalize> {
        let take = max_samples.min(self.samples.len());
        let this = &*self;
        let moments: Vec<([f64; 3], [f64; 3])> = (0..take)
            .into_par_iter()
            .map(|idx| this.load_image(idx).map(|image| channel_moments(&image)))
            .collect::<DatasetResult<_>>()?;
        if moments.is_empty() {
            return Ok(self.normalize);
        }

        let count = moments.len() as f64;
        let mut mean = [0f32; 3];
        let mut std = [0f32; 3];
        for c in 0..3 {
            let m = moments.iter().map(|(m, _)| m[c]).sum::<f64>() / count;
            let sq = moments.iter().map(|(_, s)| s[c]).sum::<f64>() / count;
            mean[c] = (m / 255.0) as f32;
            std[c] = ((sq - m * m).max(0.0).sqrt() / 255.0) as f32;
        }
        // A constant channel has zero spread; keep it usable as a divisor.
        for s in std.iter_mut() {
            *s = s.max(MIN_STATISTICS_STD);
        }
        self.normalize = Normalize::new(mean, std)?;
        log::info!("dataset statistics: mean={:?} std={:?}", mean, std);
        Ok(self.normalize)
    }
}

const MIN_STATISTICS_STD: f32 = 1e-6;

fn channel_moments(image: &RgbImage) -> ([f64; 3], [f64; 3]) {
    let pixels = (image.width() as f64 * image.height() as f64).max(1.0);
    let mut sums = [0f64; 3];
    let mut squares = [0f64; 3];
    for pixel in image.pixels() {
        for c in 0..3 {
            let v = pixel[c] as f64;
            sums[c] += v;
            squares[c] += v * v;
        }
    }
    (
        sums.map(|s| s / pixels),
        squares.map(|s| s / pixels),
    )
}

fn parse_profile_name(
    name: &str,
    dir: &Path,
    age_filter: bool,
) -> DatasetResult<(GenderLabel, AgeLabel)> {
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() < 4 {
        return Err(DatasetError::layout(
            dir,
            "profile directory must be named {id}_{gender}_{race}_{age}",
        ));
    }
    let gender = parts[1]
        .parse::<GenderLabel>()
        .map_err(|err| DatasetError::layout(dir, err.to_string()))?;
    let age = parts[parts.len() - 1]
        .parse::<u32>()
        .map_err(|err| DatasetError::layout(dir, format!("invalid age: {err}")))?;
    Ok((gender, AgeLabel::from_age(age, age_filter)))
}

fn mask_label_for(path: &Path) -> Option<MaskLabel> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    MaskLabel::from_file_stem(path.file_stem()?.to_str()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_class_round_trips_every_label() {
        for label in 0..NUM_CLASSES as u32 {
            let (mask, gender, age) = decode_multi_class(label).unwrap();
            assert_eq!(encode_multi_class(mask, gender, age), label);
        }
        assert!(decode_multi_class(18).is_none());
    }

    #[test]
    fn age_filter_moves_boundary() {
        assert_eq!(AgeLabel::from_age(29, true), AgeLabel::Young);
        assert_eq!(AgeLabel::from_age(58, false), AgeLabel::Middle);
        assert_eq!(AgeLabel::from_age(58, true), AgeLabel::Old);
        assert_eq!(AgeLabel::from_age(60, false), AgeLabel::Old);
    }

    #[test]
    fn mask_label_from_file_names() {
        assert_eq!(
            mask_label_for(Path::new("a/mask3.jpg")),
            Some(MaskLabel::Mask)
        );
        assert_eq!(
            mask_label_for(Path::new("a/incorrect_mask.png")),
            Some(MaskLabel::Incorrect)
        );
        assert_eq!(
            mask_label_for(Path::new("a/normal.jpeg")),
            Some(MaskLabel::Normal)
        );
        assert_eq!(mask_label_for(Path::new("a/._mask1.jpg")), None);
        assert_eq!(mask_label_for(Path::new("a/notes.txt")), None);
    }

    #[test]
    fn parses_profile_directory() {
        let (gender, age) =
            parse_profile_name("000001_female_Asian_45", Path::new("x"), true).unwrap();
        assert_eq!(gender, GenderLabel::Female);
        assert_eq!(age, AgeLabel::Middle);
        assert!(parse_profile_name("broken", Path::new("x"), true).is_err());
    }
}
