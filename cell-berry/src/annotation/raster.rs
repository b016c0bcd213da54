//! 实例形状到二值掩码的栅格化.
//!
//! 多边形使用偶奇规则, 以像素中心 `(w + 0.5, h + 0.5)` 采样;
//! RLE 按 COCO 约定为列优先存储.

use super::coco::{RleCounts, Segmentation};
use crate::{CellError, CellResult, Idx2d};
use ndarray::Array2;

/// 将实例形状栅格化为 `shape` 大小的二值掩码 (前景为 1).
///
/// `None` 得到全零掩码. RLE 自带的尺寸与 `shape` 不一致时返回
/// [`CellError::ShapeMismatch`].
pub fn rasterize(seg: Option<&Segmentation>, shape: Idx2d) -> CellResult<Array2<u8>> {
    let mut mask = Array2::<u8>::zeros(shape);
    match seg {
        None => {}
        Some(Segmentation::Polygons(polys)) => {
            for poly in polys.iter() {
                fill_polygon(&mut mask, poly);
            }
        }
        Some(Segmentation::Rle { counts, size }) => {
            let rle_shape = [size[0] as usize, size[1] as usize];
            if rle_shape != [shape.0, shape.1] {
                return Err(CellError::shape_mismatch(&[shape.0, shape.1], &rle_shape));
            }
            let counts = match counts {
                RleCounts::Raw(c) => c.clone(),
                RleCounts::Compressed(s) => decompress_counts(s)?,
            };
            fill_rle(&mut mask, &counts);
        }
    }
    Ok(mask)
}

/// 以偶奇规则将多边形 `xy = [x0, y0, x1, y1, ...]` 填充进 `mask` (取并集).
///
/// 少于 3 个顶点的多边形被忽略.
pub(crate) fn fill_polygon(mask: &mut Array2<u8>, xy: &[f64]) {
    let k = xy.len() / 2;
    if k < 3 {
        return;
    }
    let (height, width) = mask.dim();
    let mut crossings: Vec<f64> = Vec::with_capacity(8);

    for h in 0..height {
        let yc = h as f64 + 0.5;
        crossings.clear();
        for i in 0..k {
            let j = (i + 1) % k;
            let (xi, yi) = (xy[2 * i], xy[2 * i + 1]);
            let (xj, yj) = (xy[2 * j], xy[2 * j + 1]);
            // 半开区间, 避免顶点被重复计数
            if (yi <= yc && yc < yj) || (yj <= yc && yc < yi) {
                crossings.push(xi + (yc - yi) * (xj - xi) / (yj - yi));
            }
        }
        crossings.sort_by(f64::total_cmp);

        for pair in crossings.chunks_exact(2) {
            // 像素中心 w + 0.5 落在 [x0, x1) 中
            let lo = (pair[0] - 0.5).ceil().max(0.0) as usize;
            let hi = ((pair[1] - 0.5).ceil().max(0.0) as usize).min(width);
            for w in lo..hi {
                mask[(h, w)] = 1;
            }
        }
    }
}

/// 按列优先的游程计数填充掩码. 计数从背景段开始.
fn fill_rle(mask: &mut Array2<u8>, counts: &[u32]) {
    let (height, width) = mask.dim();
    let n = height * width;
    let mut idx = 0usize;
    let mut value = 0u8;
    for &c in counts {
        let end = (idx + c as usize).min(n);
        if value == 1 {
            for k in idx..end {
                mask[(k % height, k / height)] = 1;
            }
        }
        idx = end;
        value ^= 1;
    }
}

/// 单个计数最多占用的字符数, 保证 5 bit 分组不溢出 `i64`.
const MAX_GROUP_CHARS: u32 = 12;

/// 解码 COCO 压缩 RLE 字符串 (每 5 bit 一组, 自第四段起为差分存储).
///
/// 单个计数超过 [`MAX_GROUP_CHARS`] 个字符时返回 [`CellError::UnsupportedFormat`].
pub(crate) fn decompress_counts(s: &str) -> CellResult<Vec<u32>> {
    let bytes = s.as_bytes();
    let mut counts: Vec<i64> = Vec::with_capacity(bytes.len());
    let mut p = 0usize;
    while p < bytes.len() {
        let mut x = 0i64;
        let mut k = 0u32;
        let mut more = true;
        while more && p < bytes.len() {
            if k == MAX_GROUP_CHARS {
                return Err(CellError::UnsupportedFormat(format!(
                    "compressed RLE count longer than {MAX_GROUP_CHARS} characters"
                )));
            }
            let c = i64::from(bytes[p]) - 48;
            x |= (c & 0x1f) << (5 * k);
            more = c & 0x20 != 0;
            p += 1;
            k += 1;
            if !more && c & 0x10 != 0 {
                x |= -1i64 << (5 * k);
            }
        }
        if counts.len() > 2 {
            x = x.saturating_add(counts[counts.len() - 2]);
        }
        counts.push(x);
    }
    Ok(counts.into_iter().map(|c| c.clamp(0, i64::from(u32::MAX)) as u32).collect())
}
