//! 运行时错误.

use std::path::PathBuf;
use thiserror::Error;

/// 本 crate 所有操作的错误类型.
///
/// 其中 [`CellError::AnnotationNotFound`] 和 [`CellError::TargetUnavailable`]
/// 可由数据集在本地重新采样恢复 (见 [`CellError::is_resamplable`]),
/// 其余错误均直接返回给调用者.
#[derive(Debug, Error)]
pub enum CellError {
    /// 标注数据库中不存在该图像 id.
    #[error("annotation database has no image with id {id}")]
    AnnotationNotFound {
        /// 图像 id.
        id: u64,
    },

    /// 图像存在, 但没有任何实例标注, 无法构建训练目标.
    #[error("image {id} has no instance annotations")]
    TargetUnavailable {
        /// 图像 id.
        id: u64,
    },

    /// 目录中没有可用的图像文件.
    #[error("no images in folder {}", dir.display())]
    NoImagesFound {
        /// 被搜索的目录.
        dir: PathBuf,
    },

    /// 标签文件缺失或命名不符合 `mask_filter` 约定.
    #[error("labels missing at {}: {reason}", path.display())]
    LabelsMissing {
        /// 第一个缺失的标签路径 (不含扩展名时为基础路径).
        path: PathBuf,

        /// 具体原因.
        reason: &'static str,
    },

    /// 不支持的输出格式, 例如以 PNG 保存 3D 掩码.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// 两个本应空间对齐的数组形状不一致.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// 期望形状.
        expected: Vec<usize>,

        /// 实际形状.
        found: Vec<usize>,
    },

    /// 配置取值非法.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// 标注文件解析失败.
    #[error("failed to parse annotation file {}: {source}", path.display())]
    Json {
        /// 标注文件路径.
        path: PathBuf,

        /// 底层错误.
        #[source]
        source: serde_json::Error,
    },

    /// 底层 I/O 错误.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// PNG/JPEG 编解码错误.
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    /// TIFF 编解码错误.
    #[error("tiff codec error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// 读取 npz 归档错误.
    #[error("failed to read npz archive: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    /// 写入 npz 归档错误.
    #[error("failed to write npz archive: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),
}

impl CellError {
    /// 该错误是否允许数据集换一个样本重试.
    #[inline]
    pub fn is_resamplable(&self) -> bool {
        matches!(
            self,
            Self::AnnotationNotFound { .. } | Self::TargetUnavailable { .. }
        )
    }

    /// 便捷构建 [`CellError::ShapeMismatch`].
    #[inline]
    pub(crate) fn shape_mismatch(expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

/// 本 crate 操作的运行时结果.
pub type CellResult<T> = Result<T, CellError>;
