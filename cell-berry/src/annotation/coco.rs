//! 标注文件 (COCO JSON) 的模式定义.
//!
//! 只建模构建训练目标所需的字段; 其余字段 (licenses, info 等) 在解析时被忽略.

use serde::Deserialize;

/// 顶层结构.
#[derive(Debug, Deserialize)]
pub(crate) struct CocoFile {
    pub(crate) images: Vec<ImageRecord>,

    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,

    #[serde(default)]
    pub(crate) categories: Vec<Category>,
}

/// 图像记录.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageRecord {
    /// 图像 id.
    pub id: u64,

    /// 图像宽度 (像素).
    pub width: u32,

    /// 图像高度 (像素).
    pub height: u32,

    /// 相对于图像目录的文件名.
    pub file_name: String,
}

impl ImageRecord {
    /// 标签图形状 (高, 宽).
    #[inline]
    pub fn shape(&self) -> crate::Idx2d {
        (self.height as usize, self.width as usize)
    }
}

/// 类别记录.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Category {
    pub(crate) id: u64,
    pub(crate) name: String,
}

/// 单个实例的标注.
#[derive(Debug, Clone, Deserialize)]
pub struct Annotation {
    /// 标注 id.
    pub id: u64,

    /// 所属图像 id.
    pub image_id: u64,

    /// 原生类别 id.
    pub category_id: u64,

    /// 实例形状. 缺失时视为空掩码.
    #[serde(default)]
    pub segmentation: Option<Segmentation>,
}

/// 实例形状: 多边形列表或游程编码 (RLE).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    /// 一个或多个多边形, 每个为 `[x0, y0, x1, y1, ...]`. 多个多边形取并集.
    Polygons(Vec<Vec<f64>>),

    /// 列优先游程编码. `size` 为 `[高, 宽]`.
    Rle {
        /// 游程计数.
        counts: RleCounts,

        /// `[高, 宽]`.
        size: [u32; 2],
    },
}

/// RLE 计数的两种存储形式.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    /// 未压缩, 直接给出每段长度 (通常出现在 `iscrowd = 1` 的标注中).
    Raw(Vec<u32>),

    /// COCO 压缩字符串.
    Compressed(String),
}
