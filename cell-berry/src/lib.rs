#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供细胞实例分割数据的训练目标构建与分割结果持久化.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 标注以 COCO 格式的 JSON 文件给出 (多边形或 RLE). 其他格式可以通过实现
//!   [`annotation::InstanceSource`] 接入.
//! 2. 真正的流场算法不在本 crate 内, 通过 [`flow::FlowFieldGenerator`] 接入.
//!   附带的 [`flow::CentroidFlows`] 只是一个简单的参考实现.
//!
//! # 开发计划
//!
//! ### 标注数据库与多边形栅格化 ✅
//!
//! 多边形按像素中心的奇偶规则填充, 同时支持未压缩与压缩 RLE.
//!
//! 实现位于 `cell-berry/src/annotation`.
//!
//! ### 实例掩码的 natural encoding ✅
//!
//! 第 `i` 个实例编号为 `i`, 重叠处后者覆盖前者.
//! 另有 16 / 32 位标签的自动选择.
//!
//! 实现位于 `cell-berry/src/encode.rs`.
//!
//! ### 训练目标构建与重采样 ✅
//!
//! 标注 -> 掩码 -> 标签图 -> 4 通道流场目标. 没有实例的图像由数据集换样重试.
//!
//! 实现位于 `cell-berry/src/target.rs` 和 `cell-berry/src/dataset`.
//!
//! ### 数据增强 ✅
//!
//! 1. 1% / 99% 分位数规范化, 通道选择. ✅
//! 2. 训练时随机旋转, 缩放, 翻转, 流场向量同步旋转. ✅
//! 3. 推理时补零到 16 的整数倍, 可精确还原. ✅
//!
//! 实现位于 `cell-berry/src/augment`.
//!
//! ### 图像 / 标签 / 流场缓存文件配对 ✅
//!
//! 实现位于 `cell-berry/src/dataset/files.rs`.
//!
//! ### 分割结果持久化 ✅
//!
//! `_seg.npz` 归档, 掩码 png / tif, 轮廓文本, 三联可视化图片, 交互会话导出.
//!
//! 实现位于 `cell-berry/src/seg`.
//!
//! ### 真正的流场生成算法 ⌛️
//!
//! 基于热扩散的梯度场. 目前通过 trait 由外部提供.

/// 二维索引 `(高, 宽)`.
pub type Idx2d = (usize, usize);

/// 标签图: 0 为背景, `k` 为第 `k` 个实例.
pub type LabelMap = ndarray::Array2<u32>;

pub mod annotation;
pub mod augment;
pub mod config;
pub mod consts;
pub mod dataset;
pub mod encode;
mod error;
pub mod flow;
pub mod io;
pub mod prelude;
pub mod seg;
pub mod target;

pub use error::{CellError, CellResult};
