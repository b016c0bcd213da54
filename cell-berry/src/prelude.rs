//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{CellError, CellResult, Idx2d, LabelMap};

pub use crate::annotation::{AnnotationStore, InstanceMasks, InstanceSource};
pub use crate::augment::{normalize99, pad_image_nd, random_rotate_and_resize, reshape_and_normalize, PadInfo};
pub use crate::config::TrainSpec;
pub use crate::encode::{natural_encode, LabelArray};
pub use crate::flow::{CentroidFlows, FlowFieldGenerator, FlowTarget};
pub use crate::target::TargetBuilder;

pub use crate::dataset::{self, home_dataset_dir_with, CellDataset, Sample};
pub use crate::dataset::{get_image_files, get_label_files, load_train_test_data};

pub use crate::seg::{
    masks_flows_to_seg, masks_flows_to_seg_batch, save_masks, save_masks_batch, ChannelChoice, ModelFlows,
    SaveOptions, SegRecord, SessionState,
};
