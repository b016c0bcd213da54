//! 数据增强: 强度规范化, 训练时的随机旋转缩放, 推理时的补零.

mod warp;

pub use warp::{random_rotate_and_resize, warp_pair, WarpParams};

use crate::{CellError, CellResult, Idx2d};
use ndarray::{Array3, ArrayD, ArrayView3, ArrayViewD, Axis, Slice};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// 求已排序数据的百分位数 (线性插值, 与 numpy 默认行为一致). `q` 取值 `[0, 100]`.
///
/// `sorted` 为空时返回 0.
pub fn percentile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32)
}

/// 以第 1 和第 99 百分位数将 `x` 线性映射, 使前者为 0, 后者为 1.
///
/// 两个百分位数相同 (常数图像) 时结果全为 0.
pub fn normalize99(x: ArrayViewD<f32>) -> ArrayD<f32> {
    let mut sorted: Vec<f32> = x.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_unstable_by_key(|&v| OrderedFloat(v));
    let lo = percentile(&sorted, 1.0);
    let hi = percentile(&sorted, 99.0);
    let range = hi - lo;
    if range > 0.0 {
        x.mapv(|v| (v - lo) / range)
    } else {
        x.mapv(|v| v - lo)
    }
}

/// 将 2D 或 3D 图像转为 `(高, 宽, 通道)` 形式.
///
/// 3D 图像的最后一维不超过 4 时视为通道维; 否则第一维不超过 4 时视为
/// `(通道, 高, 宽)` 并转置. 都不满足时返回 [`CellError::UnsupportedFormat`].
pub fn to_hwc(img: ArrayViewD<f32>) -> CellResult<Array3<f32>> {
    match *img.shape() {
        [h, w] => Ok(img
            .to_owned()
            .into_shape((h, w, 1))
            .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?),
        [_, _, c] if c <= 4 => Ok(img
            .to_owned()
            .into_dimensionality()
            .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?),
        [c, _, _] if c <= 4 => Ok(img
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?
            .permuted_axes([1, 2, 0])
            .as_standard_layout()
            .into_owned()),
        ref sh => Err(CellError::UnsupportedFormat(format!(
            "cannot locate channel axis of image with shape {sh:?}"
        ))),
    }
}

/// 按通道选择重排图像并规范化, 得到 `2 x Ly x Lx` 的网络输入.
///
/// `channels = [细胞质, 细胞核]`: 0 代表灰度 (通道均值), `k` 代表第 `k` 个通道
/// (1 起始). 细胞核通道为 0 时第二通道全零; 细胞质通道为 0 时同样忽略细胞核通道.
/// `normalize` 为真时对每个非常数通道执行 [`normalize99`].
pub fn reshape_and_normalize(
    img: ArrayViewD<f32>,
    channels: [usize; 2],
    normalize: bool,
) -> CellResult<Array3<f32>> {
    let hwc = to_hwc(img)?;
    let (h, w, nchan) = hwc.dim();
    let pick = |k: usize| -> CellResult<ndarray::Array2<f32>> {
        if k > nchan {
            return Err(CellError::UnsupportedFormat(format!(
                "channel {k} requested from image with {nchan} channels"
            )));
        }
        Ok(hwc.index_axis(Axis(2), k - 1).to_owned())
    };

    let mut out = Array3::<f32>::zeros((2, h, w));
    match channels {
        [0, _] => {
            let gray = hwc.mean_axis(Axis(2)).unwrap_or_else(|| ndarray::Array2::zeros((h, w)));
            out.index_axis_mut(Axis(0), 0).assign(&gray);
        }
        [c0, c1] => {
            out.index_axis_mut(Axis(0), 0).assign(&pick(c0)?);
            if c1 != 0 {
                out.index_axis_mut(Axis(0), 1).assign(&pick(c1)?);
            }
        }
    }

    if normalize {
        for mut chan in out.outer_iter_mut() {
            let (min, max) = chan
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
            if max > min {
                let n = normalize99(chan.view().into_dyn());
                chan.assign(&n.into_dimensionality::<ndarray::Ix2>().map_err(|e| {
                    CellError::UnsupportedFormat(e.to_string())
                })?);
            }
        }
    }
    Ok(out)
}

/// 推理时补零的边信息, 足以把预测裁剪回原始范围.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadInfo {
    /// 原始空间形状 (高, 宽).
    pub shape: Idx2d,

    /// 原图在补零后图像中的行范围.
    pub ysub: Range<usize>,

    /// 原图在补零后图像中的列范围.
    pub xsub: Range<usize>,
}

impl PadInfo {
    /// 补零的逆操作: 取最后两维的 `ysub x xsub` 部分.
    ///
    /// `padded` 的最后两维放不下该范围时返回 [`CellError::ShapeMismatch`].
    pub fn crop(&self, padded: ArrayViewD<f32>) -> CellResult<ArrayD<f32>> {
        let nd = padded.ndim();
        if nd < 2 || padded.shape()[nd - 2] < self.ysub.end || padded.shape()[nd - 1] < self.xsub.end {
            return Err(CellError::shape_mismatch(
                &[self.ysub.end, self.xsub.end],
                padded.shape(),
            ));
        }
        Ok(padded
            .slice_each_axis(|ax| match ax.axis.index() {
                i if i == nd - 2 => Slice::from(self.ysub.clone()),
                i if i == nd - 1 => Slice::from(self.xsub.clone()),
                _ => Slice::from(..),
            })
            .to_owned())
    }
}

/// 把 `img` 的最后两维补零到 `divisor` 的整数倍, 并在每侧额外留出 `divisor / 2`.
///
/// 只扩展画布, 从不缩放内容, 因此 [`PadInfo::crop`] 是精确的逆操作.
/// `img` 少于两维或 `divisor == 0` 时返回 [`CellError::UnsupportedFormat`].
pub fn pad_image_nd(img: ArrayViewD<f32>, divisor: usize) -> CellResult<(ArrayD<f32>, PadInfo)> {
    let nd = img.ndim();
    if nd < 2 || divisor == 0 {
        return Err(CellError::UnsupportedFormat(format!(
            "cannot pad {nd}-D image with divisor {divisor}"
        )));
    }
    let (ly, lx) = (img.shape()[nd - 2], img.shape()[nd - 1]);
    let pads = |l: usize| {
        let lpad = divisor * l.div_ceil(divisor) - l;
        let before = divisor / 2 + lpad / 2;
        let after = divisor / 2 + lpad - lpad / 2;
        (before, after)
    };
    let (top, bottom) = pads(ly);
    let (left, right) = pads(lx);

    let mut shape = img.shape().to_vec();
    shape[nd - 2] = top + ly + bottom;
    shape[nd - 1] = left + lx + right;

    let mut out = ArrayD::<f32>::zeros(shape);
    out.slice_each_axis_mut(|ax| match ax.axis.index() {
        i if i == nd - 2 => Slice::from(top..top + ly),
        i if i == nd - 1 => Slice::from(left..left + lx),
        _ => Slice::from(..),
    })
    .assign(&img);

    let info = PadInfo {
        shape: (ly, lx),
        ysub: top..top + ly,
        xsub: left..left + lx,
    };
    Ok((out, info))
}

/// 确认图像与目标在空间上对齐.
pub(crate) fn check_spatial(img: ArrayView3<f32>, target: ArrayView3<f32>) -> CellResult<()> {
    let (_, ih, iw) = img.dim();
    let (_, th, tw) = target.dim();
    if (ih, iw) != (th, tw) {
        return Err(CellError::shape_mismatch(&[ih, iw], &[th, tw]));
    }
    Ok(())
}
