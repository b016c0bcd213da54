//! 掩码文件, 轮廓文本与三联可视化图片的保存.

use super::outline::{masks_to_outlines, save_outlines};
use super::{with_tail, ModelFlows};
use crate::augment::{normalize99, to_hwc};
use crate::consts::{suffix, OUTLINE_RGB};
use crate::encode::{array_max, needs_u32, LabelArray};
use crate::io::{imsave_labels, write_rgb8};
use crate::{CellError, CellResult};
use ndarray::{s, Array3, ArrayD, ArrayViewD, Axis};
use std::path::{Path, PathBuf};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// [`save_masks`] 的输出选项.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// 保存 16 位 png 掩码.
    pub png: bool,

    /// 保存 tif 掩码.
    pub tif: bool,

    /// 写出 png 时同时保存三联可视化图片.
    pub figure: bool,

    /// 2D 掩码同时保存轮廓文本.
    pub outlines: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            png: true,
            tif: false,
            figure: true,
            outlines: true,
        }
    }
}

/// 按 normalize99 拉伸到 `[0, 255]` 的 RGB 图像. 单通道复制为灰度, 两通道补零.
fn display_rgb(image: ArrayViewD<f32>) -> CellResult<Array3<u8>> {
    let hwc = to_hwc(image)?;
    let (h, w, c) = hwc.dim();
    let mut out = Array3::<u8>::zeros((h, w, 3));
    for k in 0..3 {
        let src = match (c, k) {
            (1, _) => 0,
            (2, 2) => continue,
            (_, k) => k,
        };
        let chan = normalize99(hwc.index_axis(Axis(2), src).into_dyn());
        for ((y, x), v) in chan.into_dimensionality::<ndarray::Ix2>().map_err(|e| CellError::UnsupportedFormat(e.to_string()))?.indexed_iter() {
            out[(y, x, k)] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
    Ok(out)
}

/// 三联图: 原图, 原图叠加轮廓, 流场可视化, 横向拼接.
fn render_figure(image: ArrayViewD<f32>, masks: ArrayViewD<u32>, flows: &ModelFlows) -> CellResult<Array3<u8>> {
    let raw = display_rgb(image)?;
    let (h, w, _) = raw.dim();
    if masks.shape() != [h, w] {
        return Err(CellError::shape_mismatch(&[h, w], masks.shape()));
    }
    if flows.rgb.shape() != [h, w, 3] {
        return Err(CellError::shape_mismatch(&[h, w, 3], flows.rgb.shape()));
    }

    let edges = masks_to_outlines(masks)?;
    let mut overlay = raw.clone();
    for ((y, x, k), v) in overlay.indexed_iter_mut() {
        if edges[[y, x]] {
            *v = OUTLINE_RGB[k];
        }
    }

    let mut fig = Array3::<u8>::zeros((h, 3 * w, 3));
    fig.slice_mut(s![.., 0..w, ..]).assign(&raw);
    fig.slice_mut(s![.., w..2 * w, ..]).assign(&overlay);
    fig.slice_mut(s![.., 2 * w.., ..])
        .assign(&flows.rgb.view().into_dimensionality::<ndarray::Ix3>().map_err(|e| CellError::UnsupportedFormat(e.to_string()))?);
    Ok(fig)
}

/// 保存一张图像的掩码, 返回写出的全部文件.
///
/// 1. 3D 掩码必须启用 tif, 否则返回 [`CellError::UnsupportedFormat`];
/// 2. 3D 掩码或最大编号需要 32 位时, 只写 tif;
/// 3. 掩码写为 `{stem}_cp_masks.{png|tif}`;
/// 4. 写出 png 且图像最小维不超过 3 (即带有通道维) 时, 保存三联图 `{stem}_cp_output.png`;
/// 5. 2D 掩码保存轮廓文本 `{stem}_cp_outlines.txt`.
///
/// # 注意
///
/// 各文件依次写出, 中途失败时已写出的文件不会被删除.
pub fn save_masks(
    image: ArrayViewD<f32>,
    masks: ArrayViewD<u32>,
    flows: &ModelFlows,
    file_name: &Path,
    opts: SaveOptions,
) -> CellResult<Vec<PathBuf>> {
    if masks.ndim() > 2 && !opts.tif {
        return Err(CellError::UnsupportedFormat(
            "cannot save 3D outputs as PNG, use tif option instead".into(),
        ));
    }
    let (mut png, mut tif) = (opts.png, opts.tif);
    let max = array_max(masks.iter());
    if masks.ndim() > 2 || needs_u32(max) {
        if png {
            log::info!("{} saved as tif only (max label {max})", file_name.display());
        }
        png = false;
        tif = true;
    }
    let labels = LabelArray::narrow(masks.view());

    let mut written = Vec::new();
    for (ext, on) in [("png", png), ("tif", tif)] {
        if on {
            let path = with_tail(file_name, &format!("{}.{ext}", suffix::CP_MASKS));
            imsave_labels(&path, &labels)?;
            written.push(path);
        }
    }

    let min_dim = image.shape().iter().copied().min().unwrap_or(0);
    if png && opts.figure && min_dim <= 3 {
        let path = with_tail(file_name, &format!("{}.png", suffix::CP_OUTPUT));
        write_rgb8(&path, &render_figure(image, masks.view(), flows)?)?;
        written.push(path);
    }

    if opts.outlines {
        if masks.ndim() < 3 {
            written.push(save_outlines(file_name.with_extension(""), masks)?);
        } else {
            log::info!("3D outlines of {} not saved", file_name.display());
        }
    }
    Ok(written)
}

/// 批量版本的 [`save_masks`]. 各序列长度必须一致.
///
/// 启用 `rayon` 特性时各图像并行处理.
pub fn save_masks_batch(
    images: &[ArrayD<f32>],
    masks: &[ArrayD<u32>],
    flows: &[ModelFlows],
    file_names: &[PathBuf],
    opts: SaveOptions,
) -> CellResult<Vec<Vec<PathBuf>>> {
    let n = images.len();
    for len in [masks.len(), flows.len(), file_names.len()] {
        if len != n {
            return Err(CellError::shape_mismatch(&[n], &[len]));
        }
    }
    let one = |k: usize| save_masks(images[k].view(), masks[k].view(), &flows[k], &file_names[k], opts);

    #[cfg(feature = "rayon")]
    let written: CellResult<Vec<_>> = (0..n).into_par_iter().map(one).collect();
    #[cfg(not(feature = "rayon"))]
    let written: CellResult<Vec<_>> = (0..n).map(one).collect();
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{imread, read_labels};
    use crate::seg::tests::planar_flows;
    use ndarray::{Array2, IxDyn};

    fn blobs() -> Array2<u32> {
        let mut m = Array2::<u32>::zeros((8, 8));
        m.slice_mut(s![1..4, 1..4]).fill(1);
        m.slice_mut(s![4..7, 4..7]).fill(2);
        m
    }

    #[test]
    fn test_png_mask_figure_and_outlines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.png");
        let image = ArrayD::from_shape_fn(IxDyn(&[8, 8, 3]), |ix| (ix[0] * 8 + ix[1] + ix[2]) as f32);
        let masks = blobs();
        let written = save_masks(image.view(), masks.view().into_dyn(), &planar_flows(8, 8), &file, SaveOptions::default()).unwrap();
        assert_eq!(
            written,
            [
                dir.path().join("a_cp_masks.png"),
                dir.path().join("a_cp_output.png"),
                dir.path().join("a_cp_outlines.txt"),
            ]
        );
        assert_eq!(read_labels(&written[0]).unwrap(), masks.into_dyn());
        assert_eq!(imread(&written[1]).unwrap().shape(), &[8, 24, 3]);
        let text = std::fs::read_to_string(&written[2]).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_volume_requires_tif() {
        let _ = simple_logger::SimpleLogger::new().init();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("v.tif");
        let image = ArrayD::<f32>::zeros(IxDyn(&[2, 8, 8]));
        let vol = ArrayD::<u32>::ones(IxDyn(&[2, 8, 8]));
        let flows = planar_flows(8, 8);
        let err = save_masks(image.view(), vol.view(), &flows, &file, SaveOptions::default()).unwrap_err();
        assert!(matches!(err, CellError::UnsupportedFormat(_)));

        let opts = SaveOptions {
            tif: true,
            ..SaveOptions::default()
        };
        let written = save_masks(image.view(), vol.view(), &flows, &file, opts).unwrap();
        assert_eq!(written, [dir.path().join("v_cp_masks.tif")]);
        assert!(!dir.path().join("v_cp_outlines.txt").exists());
        assert_eq!(read_labels(&written[0]).unwrap().shape(), &[2, 8, 8]);
    }

    #[test]
    fn test_large_labels_force_tif() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.png");
        let image = ArrayD::<f32>::zeros(IxDyn(&[4, 4]));
        let masks = ArrayD::<u32>::from_elem(IxDyn(&[4, 4]), 65_535);
        let opts = SaveOptions {
            outlines: false,
            ..SaveOptions::default()
        };
        let written = save_masks(image.view(), masks.view(), &planar_flows(4, 4), &file, opts).unwrap();
        assert_eq!(written, [dir.path().join("big_cp_masks.tif")]);
        assert_eq!(read_labels(&written[0]).unwrap()[[3, 3]], 65_535);
    }

    #[test]
    fn test_batch() {
        let dir = tempfile::tempdir().unwrap();
        let names = vec![dir.path().join("x.png"), dir.path().join("y.png")];
        let images = vec![ArrayD::<f32>::zeros(IxDyn(&[8, 8])); 2];
        let masks = vec![blobs().into_dyn(); 2];
        let flows = vec![planar_flows(8, 8); 2];
        let opts = SaveOptions {
            figure: false,
            ..SaveOptions::default()
        };
        let written = save_masks_batch(&images, &masks, &flows, &names, opts).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1][0], dir.path().join("y_cp_masks.png"));
        assert!(save_masks_batch(&images, &masks[..1], &flows, &names, opts).is_err());
    }
}
