//! 分割结果的持久化: 归档, 掩码文件, 轮廓文本, 可视化图片, 交互会话.

mod bundle;
mod outline;
mod save;
mod session;

pub use bundle::{FlowPart, SegRecord};
pub use outline::{masks_to_outlines, outline_labels, outlines_list, outlines_to_text, save_outlines};
pub use save::{save_masks, save_masks_batch, SaveOptions};
pub use session::SessionState;

use crate::augment::normalize99;
use crate::consts::suffix;
use crate::encode::{array_max, LabelArray};
use crate::{CellError, CellResult};
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};
use std::path::{Path, PathBuf};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 模型对一张图像的流场输出.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFlows {
    /// 流场的 RGB 可视化. 2D 图像为 `Ly x Lx x 3`, 3D 图像为 `Z x Ly x Lx x 3`.
    pub rgb: ArrayD<u8>,

    /// 原始流场. 2D 图像为 `2 x Ly x Lx`, 3D 图像为 `3 x Z x Ly x Lx`.
    pub dp: ArrayD<f32>,

    /// 细胞概率 (logit), 与掩码同形.
    pub cellprob: ArrayD<f32>,

    /// 可选的附加输出 (例如风格向量).
    pub heading: Option<ArrayD<f32>>,
}

impl ModelFlows {
    /// 输入是否来自 2D 图像.
    #[inline]
    pub fn is_planar(&self) -> bool {
        self.rgb.ndim() == 3
    }

    /// 归档中的流场导出:
    ///
    /// 1. RGB 可视化 (2D 图像前置一维);
    /// 2. `clip(normalize99(cellprob), 0, 1) * 255` 的 8 位概率图 (2D 图像前置一维);
    /// 3. 2D 图像为全零占位 (与 RGB 同形, 前置一维), 3D 图像为 8 位 Z 分量 `dp[0] / 10 * 127 + 127`;
    /// 4. 有附加输出时, 依次追加附加输出以及 `[dp, cellprob]` 的堆叠.
    pub fn export(&self) -> CellResult<Vec<FlowPart>> {
        let to_u8 = |v: f32| v.clamp(0.0, 255.0) as u8;
        let prob = normalize99(self.cellprob.view()).mapv(|v| to_u8(v.clamp(0.0, 1.0) * 255.0));

        let mut parts = Vec::with_capacity(5);
        if self.is_planar() {
            parts.push(FlowPart::U8(self.rgb.clone().insert_axis(Axis(0))));
            parts.push(FlowPart::U8(prob.insert_axis(Axis(0))));
            parts.push(FlowPart::U8(ArrayD::zeros(self.rgb.shape()).insert_axis(Axis(0))));
        } else {
            if self.dp.ndim() == 0 {
                return Err(CellError::UnsupportedFormat("empty flow field".into()));
            }
            let z = self.dp.index_axis(Axis(0), 0).mapv(|v| to_u8(v / 10.0 * 127.0 + 127.0));
            parts.push(FlowPart::U8(self.rgb.clone()));
            parts.push(FlowPart::U8(prob));
            parts.push(FlowPart::U8(z));
        }
        if let Some(heading) = &self.heading {
            parts.push(FlowPart::F32(heading.clone()));
            let p = self.cellprob.view().insert_axis(Axis(0));
            let stacked = concatenate(Axis(0), &[self.dp.view(), p])
                .map_err(|_| CellError::shape_mismatch(&self.dp.shape()[1..], self.cellprob.shape()))?;
            parts.push(FlowPart::F32(stacked));
        }
        Ok(parts)
    }
}

/// 批量导出时的通道选择.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelChoice {
    /// 所有图像共用.
    Shared([usize; 2]),

    /// 每张图像各自指定.
    PerImage(Vec<[usize; 2]>),
}

impl Default for ChannelChoice {
    fn default() -> Self {
        Self::Shared([0, 0])
    }
}

impl ChannelChoice {
    /// 第 `k` 张图像的通道选择.
    pub fn get(&self, k: usize) -> CellResult<[usize; 2]> {
        match self {
            Self::Shared(c) => Ok(*c),
            Self::PerImage(v) => v
                .get(k)
                .copied()
                .ok_or_else(|| CellError::shape_mismatch(&[k + 1], &[v.len()])),
        }
    }
}

/// `path` 去掉扩展名后追加 `tail`.
pub(crate) fn with_tail(path: &Path, tail: &str) -> PathBuf {
    let mut s = path.with_extension("").into_os_string();
    s.push(tail);
    PathBuf::from(s)
}

/// 由模型输出构建归档记录.
///
/// 标签位宽: 3D 掩码的轮廓和掩码都以 **轮廓** 的最大值决定; 2D 掩码各自以自身最大值决定.
/// 3D 记录包含输入图像, 2D 记录不包含.
pub fn seg_record(
    image: ArrayViewD<f32>,
    masks: ArrayViewD<u32>,
    flows: &ModelFlows,
    diam: f32,
    file_name: &Path,
    channels: [usize; 2],
) -> CellResult<SegRecord> {
    let outlines = outline_labels(masks.view())?;
    let (outlines, masks_arr, img) = if masks.ndim() == 3 {
        let gate = array_max(outlines.iter());
        (
            LabelArray::narrow_with(outlines.view(), gate),
            LabelArray::narrow_with(masks.view(), gate),
            Some(image.to_owned()),
        )
    } else {
        (
            LabelArray::narrow(outlines.view()),
            LabelArray::narrow(masks.view()),
            None,
        )
    };
    let n = array_max(masks.iter()) as usize;
    Ok(SegRecord {
        outlines: Some(outlines),
        masks: Some(masks_arr),
        chan_choose: Some(channels),
        img,
        ismanual: Some(ndarray::Array1::from_elem(n, false)),
        filename: file_name.to_string_lossy().into_owned(),
        flows: flows.export()?,
        est_diam: Some(diam),
        ..Default::default()
    })
}

/// 保存一张图像的分割结果到 `{stem}_seg.npz`, 返回写出的路径.
pub fn masks_flows_to_seg(
    image: ArrayViewD<f32>,
    masks: ArrayViewD<u32>,
    flows: &ModelFlows,
    diam: f32,
    file_name: &Path,
    channels: [usize; 2],
) -> CellResult<PathBuf> {
    let record = seg_record(image, masks, flows, diam, file_name, channels)?;
    let path = with_tail(file_name, &format!("{}.npz", suffix::SEG));
    record.save(&path)?;
    Ok(path)
}

/// 批量版本的 [`masks_flows_to_seg`]. 各序列长度必须一致.
///
/// 启用 `rayon` 特性时各图像并行处理.
pub fn masks_flows_to_seg_batch(
    images: &[ArrayD<f32>],
    masks: &[ArrayD<u32>],
    flows: &[ModelFlows],
    diams: &[f32],
    file_names: &[PathBuf],
    channels: &ChannelChoice,
) -> CellResult<Vec<PathBuf>> {
    let n = images.len();
    for len in [masks.len(), flows.len(), diams.len(), file_names.len()] {
        if len != n {
            return Err(CellError::shape_mismatch(&[n], &[len]));
        }
    }
    let one = |k: usize| {
        masks_flows_to_seg(
            images[k].view(),
            masks[k].view(),
            &flows[k],
            diams[k],
            &file_names[k],
            channels.get(k)?,
        )
    };
    #[cfg(feature = "rayon")]
    let paths: CellResult<Vec<PathBuf>> = (0..n).into_par_iter().map(one).collect();
    #[cfg(not(feature = "rayon"))]
    let paths: CellResult<Vec<PathBuf>> = (0..n).map(one).collect();
    paths
}
