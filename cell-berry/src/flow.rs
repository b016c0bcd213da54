//! 训练目标 (flow target) 与流场生成器接口.
//!
//! 真正的流场算法 (例如基于热扩散的梯度场) 不属于本 crate, 只通过
//! [`FlowFieldGenerator`] 接入. 这里附带一个简单的质心流场
//! [`CentroidFlows`], 供测试和没有外部生成器时使用.

use crate::consts::{channel, TARGET_CHANNELS};
use crate::{CellError, CellResult, Idx2d, LabelMap};
use ndarray::{s, Array3, ArrayView2, ArrayView3, Axis};
use std::path::Path;

/// 4 通道训练目标: 标签图, 细胞概率, 流场 (行, 列).
///
/// 创建后不可变.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowTarget {
    data: Array3<f32>,
}

impl FlowTarget {
    /// 从 `4 x Ly x Lx` 数组构建. 通道数不为 4 时返回 [`CellError::ShapeMismatch`].
    pub fn new(data: Array3<f32>) -> CellResult<Self> {
        let (c, h, w) = data.dim();
        if c != TARGET_CHANNELS {
            return Err(CellError::shape_mismatch(&[TARGET_CHANNELS, h, w], &[c, h, w]));
        }
        Ok(Self { data })
    }

    /// 空间形状 (高, 宽).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        let (_, h, w) = self.data.dim();
        (h, w)
    }

    /// 标签通道.
    #[inline]
    pub fn labels(&self) -> ArrayView2<f32> {
        self.data.index_axis(Axis(0), channel::LABEL)
    }

    /// 细胞概率通道.
    #[inline]
    pub fn cell_prob(&self) -> ArrayView2<f32> {
        self.data.index_axis(Axis(0), channel::CELL_PROB)
    }

    /// 流场 `2 x Ly x Lx`, 依次为行分量和列分量.
    #[inline]
    pub fn flows(&self) -> ArrayView3<f32> {
        self.data.slice(s![channel::FLOW_Y..=channel::FLOW_X, .., ..])
    }

    /// 完整的 `4 x Ly x Lx` 视图.
    #[inline]
    pub fn view(&self) -> ArrayView3<f32> {
        self.data.view()
    }

    /// 去掉标签通道后的 `3 x Ly x Lx` 数组 (训练损失只需要概率和流场).
    pub fn without_labels(&self) -> Array3<f32> {
        self.data.slice(s![channel::CELL_PROB.., .., ..]).to_owned()
    }

    /// 直接获得底层数据.
    #[inline]
    pub fn into_raw(self) -> Array3<f32> {
        self.data
    }

    /// 以多页 f32 TIFF (每通道一页) 保存为流场缓存, 通常命名为 `{stem}_flows.tif`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CellResult<()> {
        crate::io::write_f32_stack(path, self.data.view())
    }
}

/// 流场生成器: 一批标签图到同样数量的 [`FlowTarget`].
pub trait FlowFieldGenerator {
    /// 为 `labels` 中每张标签图生成训练目标, 顺序一致.
    fn labels_to_flows(&self, labels: &[LabelMap]) -> CellResult<Vec<FlowTarget>>;
}

/// 质心流场: 每个前景像素指向其实例质心的单位向量.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidFlows;

impl CentroidFlows {
    fn one(labels: &LabelMap) -> CellResult<FlowTarget> {
        let (h_len, w_len) = labels.dim();
        let n = labels.iter().copied().max().unwrap_or(0) as usize;

        // (sum_h, sum_w, count), 下标为标签值
        let mut acc = vec![(0f64, 0f64, 0usize); n + 1];
        for ((h, w), &l) in labels.indexed_iter() {
            if l != 0 {
                let a = &mut acc[l as usize];
                a.0 += h as f64;
                a.1 += w as f64;
                a.2 += 1;
            }
        }
        let centres: Vec<(f64, f64)> = acc
            .iter()
            .map(|&(sh, sw, c)| match c {
                0 => (0.0, 0.0),
                c => (sh / c as f64, sw / c as f64),
            })
            .collect();

        let mut data = Array3::<f32>::zeros((TARGET_CHANNELS, h_len, w_len));
        for ((h, w), &l) in labels.indexed_iter() {
            data[(channel::LABEL, h, w)] = l as f32;
            if l == 0 {
                continue;
            }
            data[(channel::CELL_PROB, h, w)] = 1.0;
            let (ch, cw) = centres[l as usize];
            let (dy, dx) = (ch - h as f64, cw - w as f64);
            let norm = (dy * dy + dx * dx).sqrt();
            if norm > 1e-12 {
                data[(channel::FLOW_Y, h, w)] = (dy / norm) as f32;
                data[(channel::FLOW_X, h, w)] = (dx / norm) as f32;
            }
        }
        FlowTarget::new(data)
    }
}

impl FlowFieldGenerator for CentroidFlows {
    fn labels_to_flows(&self, labels: &[LabelMap]) -> CellResult<Vec<FlowTarget>> {
        labels.iter().map(Self::one).collect()
    }
}
