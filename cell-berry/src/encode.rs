//! 实例掩码的 natural encoding 与标签数组的位宽规范化.

use crate::consts::U16_LABEL_LIMIT;
use crate::{CellError, CellResult, Idx2d, LabelMap};
use ndarray::{Array2, ArrayD, ArrayViewD, Zip};
use std::collections::{BTreeSet, HashMap};

/// 将 `masks` 合并为一张标签图.
///
/// 第 `i` 个 (1 起始) 掩码乘以 `i`, 再逐像素取最大值. 因此实例编号完全由位置决定,
/// 重叠像素归属于序列中靠后的实例. 这是有损编码: 重叠的实例无法被完整恢复.
///
/// 没有掩码时得到全零标签图, 调用者应将其视为 "没有实例" 而不是错误.
/// 任一掩码形状不等于 `shape` 时返回 [`CellError::ShapeMismatch`].
pub fn natural_encode(shape: Idx2d, masks: &[Array2<u8>]) -> CellResult<LabelMap> {
    let mut labels = LabelMap::zeros(shape);
    for (i, mask) in masks.iter().enumerate() {
        if mask.dim() != shape {
            let (h, w) = mask.dim();
            return Err(CellError::shape_mismatch(&[shape.0, shape.1], &[h, w]));
        }
        let id = (i + 1) as u32;
        Zip::from(&mut labels).and(mask).for_each(|l, &m| {
            if m != 0 {
                *l = (*l).max(id);
            }
        });
    }
    Ok(labels)
}

/// 标签图中互不相同的非零标签个数.
pub fn instance_count<'a, I: IntoIterator<Item = &'a u32>>(labels: I) -> usize {
    labels
        .into_iter()
        .filter(|&&l| l != 0)
        .collect::<BTreeSet<_>>()
        .len()
}

/// 按升序把出现过的标签值重新编号为 `0, 1, 2, ...`.
///
/// 与背景是否存在无关: 最小的出现值总是映射为 0.
pub fn relabel_consecutive(labels: ArrayViewD<u32>) -> ArrayD<u32> {
    let uniq: BTreeSet<u32> = labels.iter().copied().collect();
    let table: HashMap<u32, u32> = uniq
        .into_iter()
        .enumerate()
        .map(|(i, v)| (v, i as u32))
        .collect();
    labels.mapv(|v| table[&v])
}

/// 标签值 `max` 是否需要 32 位存储.
#[inline]
pub fn needs_u32(max: u32) -> bool {
    u64::from(max) >= U16_LABEL_LIMIT
}

/// 以最小无符号位宽保存的标签数组.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelArray {
    /// 最大值小于 65535.
    U16(ArrayD<u16>),

    /// 最大值达到 65535 及以上.
    U32(ArrayD<u32>),
}

impl LabelArray {
    /// 以 `gate_max` 决定位宽, 将 `labels` 规范化.
    ///
    /// `gate_max` 通常就是 `labels` 自身的最大值, 但调用者也可以用
    /// 另一个数组的最大值来决定 (见 `seg::masks_flows_to_seg`).
    /// `gate_max` 小于 `labels` 实际最大值而选中 16 位时, 超出部分会被截断.
    pub fn narrow_with(labels: ArrayViewD<u32>, gate_max: u32) -> Self {
        if needs_u32(gate_max) {
            Self::U32(labels.to_owned())
        } else {
            Self::U16(labels.mapv(|v| v as u16))
        }
    }

    /// 以自身最大值决定位宽.
    #[inline]
    pub fn narrow(labels: ArrayViewD<u32>) -> Self {
        let max = array_max(labels.iter());
        Self::narrow_with(labels, max)
    }

    /// 是否为 16 位存储.
    #[inline]
    pub fn is_u16(&self) -> bool {
        matches!(self, Self::U16(_))
    }

    /// 形状.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::U16(a) => a.shape(),
            Self::U32(a) => a.shape(),
        }
    }

    /// 维数.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// 最大标签值. 空数组为 0.
    pub fn max(&self) -> u32 {
        match self {
            Self::U16(a) => u32::from(a.iter().copied().max().unwrap_or(0)),
            Self::U32(a) => array_max(a.iter()),
        }
    }

    /// 统一展开为 32 位.
    pub fn to_u32(&self) -> ArrayD<u32> {
        match self {
            Self::U16(a) => a.mapv(u32::from),
            Self::U32(a) => a.clone(),
        }
    }
}

/// 迭代器最大值, 空时为 0.
#[inline]
pub(crate) fn array_max<'a, I: IntoIterator<Item = &'a u32>>(it: I) -> u32 {
    it.into_iter().copied().max().unwrap_or(0)
}
