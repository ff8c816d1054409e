//! Face-mask image dataset: folder indexing, 18-way labels, train/val splits
//! and the image transforms applied before batching.

pub mod augmentation;
mod error;
pub mod mask;

pub use augmentation::{
    denormalize_image, Augmentation, AugmentationKind, BaseAugmentation, CustomAugmentation,
    ImageTensor, Normalize,
};
pub use error::{DatasetError, DatasetResult};
pub use mask::{
    decode_multi_class, encode_multi_class, AgeLabel, DatasetKind, GenderLabel, MaskDataset,
    MaskDatasetConfig, MaskLabel, Subset, NUM_CLASSES,
};
