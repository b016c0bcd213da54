//! 训练与推理的可调参数.

use crate::consts::{suffix, DEFAULT_CHANNELS, DEFAULT_DIVISOR, DEFAULT_SCALE_RANGE};
use crate::{CellError, CellResult};
use serde::{Deserialize, Serialize};

/// 覆盖默认数据集目录的环境变量.
pub const DATA_DIR_ENV: &str = "CELL_DATA_DIR";

/// 数据集加载参数.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSpec {
    /// 通道选择 `[细胞质, 细胞核]`, 0 代表灰度.
    pub channels: [usize; 2],

    /// 随机缩放幅度 `r`, 缩放因子取自 `[1 - r/2, 1 + r/2]`.
    pub scale_range: f32,

    /// 推理补零的尺寸因子.
    pub divisor: usize,

    /// 标签文件后缀.
    pub mask_filter: String,

    /// 图像文件后缀.
    pub image_filter: Option<String>,

    /// 重采样所用随机数生成器的种子.
    pub seed: u64,
}

impl Default for TrainSpec {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            scale_range: DEFAULT_SCALE_RANGE,
            divisor: DEFAULT_DIVISOR,
            mask_filter: suffix::DEFAULT_MASK_FILTER.to_owned(),
            image_filter: None,
            seed: 0,
        }
    }
}

impl TrainSpec {
    /// 以给定通道选择, 缩放幅度和种子构建, 其余取默认值.
    pub fn new(channels: [usize; 2], scale_range: f32, seed: u64) -> CellResult<Self> {
        let spec = Self {
            channels,
            scale_range,
            seed,
            ..Self::default()
        };
        spec.validate()?;
        Ok(spec)
    }

    /// 检查取值范围.
    ///
    /// 1. 通道编号不超过 3 (RGB);
    /// 2. `0 <= scale_range < 2`, 保证缩放因子为正;
    /// 3. `divisor` 为正偶数.
    pub fn validate(&self) -> CellResult<()> {
        if self.channels.iter().any(|&c| c > 3) {
            return Err(CellError::InvalidConfig(format!(
                "channels must be in 0..=3, got {:?}",
                self.channels
            )));
        }
        if !(0.0..2.0).contains(&self.scale_range) {
            return Err(CellError::InvalidConfig(format!(
                "scale_range must be in [0, 2), got {}",
                self.scale_range
            )));
        }
        if self.divisor == 0 || self.divisor % 2 != 0 {
            return Err(CellError::InvalidConfig(format!(
                "divisor must be a positive even number, got {}",
                self.divisor
            )));
        }
        Ok(())
    }

    /// 设置 `mask_filter`.
    pub fn with_mask_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.mask_filter = filter.into();
        self
    }

    /// 设置 `image_filter`.
    pub fn with_image_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.image_filter = Some(filter.into());
        self
    }
}
