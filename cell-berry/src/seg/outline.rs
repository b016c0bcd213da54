//! 实例轮廓: 轮廓像素图, 轮廓点列, 以及 ImageJ 可读的文本导出.

use crate::consts::suffix;
use crate::{CellError, CellResult, Idx2d};
use ndarray::{ArrayD, ArrayView2, ArrayViewD, Zip};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 获得 `(h, w)` 的 4-邻居索引. 不检查越界.
#[inline]
fn neighbour4((h, w): Idx2d) -> [Idx2d; 4] {
    [
        (h.wrapping_sub(1), w),
        (h.saturating_add(1), w),
        (h, w.wrapping_sub(1)),
        (h, w.saturating_add(1)),
    ]
}

/// 顺时针 8 方向 `(dh, dw)`, 从正左开始.
const CLOCKWISE: [(isize, isize); 8] = [(0, -1), (-1, -1), (-1, 0), (-1, 1), (0, 1), (1, 1), (1, 0), (1, -1)];

fn outline_plane(masks: ArrayView2<u32>) -> ndarray::Array2<bool> {
    let (h_len, w_len) = masks.dim();
    let mut out = ndarray::Array2::from_elem((h_len, w_len), false);
    Zip::indexed(&mut out).and(&masks).for_each(|(h, w), o, &l| {
        if l == 0 {
            return;
        }
        *o = neighbour4((h, w))
            .into_iter()
            .any(|(nh, nw)| masks.get((nh, nw)).map_or(true, |&n| n != l));
    });
    out
}

/// 轮廓像素图: 实例像素中至少有一个 4-邻居不属于同一实例 (图像外视为背景).
///
/// 3D 掩码逐平面处理. 其他维数返回 [`CellError::UnsupportedFormat`].
pub fn masks_to_outlines(masks: ArrayViewD<u32>) -> CellResult<ArrayD<bool>> {
    match masks.ndim() {
        2 => {
            let plane = masks
                .into_dimensionality()
                .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?;
            Ok(outline_plane(plane).into_dyn())
        }
        3 => {
            let mut out = ArrayD::from_elem(masks.shape(), false);
            for (mut o, m) in out.outer_iter_mut().zip(masks.outer_iter()) {
                let m = m
                    .into_dimensionality()
                    .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?;
                o.assign(&outline_plane(m).into_dyn());
            }
            Ok(out)
        }
        d => Err(CellError::UnsupportedFormat(format!("cannot outline {d}-D masks"))),
    }
}

/// 带实例编号的轮廓: `masks * masks_to_outlines(masks)`.
pub fn outline_labels(masks: ArrayViewD<u32>) -> CellResult<ArrayD<u32>> {
    let edge = masks_to_outlines(masks.view())?;
    Ok(Zip::from(&masks).and(&edge).map_collect(|&l, &e| if e { l } else { 0 }))
}

/// Moore 邻域追踪 `start` 所在连通域的外轮廓. `start` 必须是光栅序第一个像素.
fn trace(masks: ArrayView2<u32>, label: u32, start: Idx2d) -> Vec<Idx2d> {
    let (h_len, w_len) = masks.dim();
    let step = |(h, w): Idx2d, d: usize| -> Option<Idx2d> {
        let (dh, dw) = CLOCKWISE[d];
        let nh = h.checked_add_signed(dh)?;
        let nw = w.checked_add_signed(dw)?;
        (nh < h_len && nw < w_len && masks[(nh, nw)] == label).then_some((nh, nw))
    };
    let next = |p: Idx2d, back: usize| -> Option<(Idx2d, usize)> {
        (1..=8).find_map(|k| {
            let d = (back + k) % 8;
            step(p, d).map(|q| (q, d))
        })
    };

    let mut contour = vec![start];
    let Some((mut p, first_dir)) = next(start, 0) else {
        return contour;
    };
    let mut dir = first_dir;
    let limit = 4 * h_len * w_len + 8;
    while contour.len() < limit {
        let back = (dir + 6 - dir % 2) % 8;
        let Some((q, d)) = next(p, back) else {
            break;
        };
        if p == start && d == first_dir {
            break;
        }
        contour.push(p);
        p = q;
        dir = d;
    }
    contour
}

/// 每个实例 (按编号升序) 一条外轮廓, 点为 `(x, y)`, 即 `(列, 行)`.
///
/// 只追踪实例中光栅序第一个像素所在的连通域.
pub fn outlines_list(masks: ArrayView2<u32>) -> Vec<Vec<(usize, usize)>> {
    let mut starts: BTreeMap<u32, Idx2d> = BTreeMap::new();
    for (pos, &l) in masks.indexed_iter() {
        if l != 0 {
            starts.entry(l).or_insert(pos);
        }
    }
    starts
        .into_iter()
        .map(|(l, s)| trace(masks, l, s).into_iter().map(|(h, w)| (w, h)).collect())
        .collect()
}

/// 写出 `{base}_cp_outlines.txt`: 每行一个实例, 形如 `x0,y0,x1,y1,...`.
pub fn outlines_to_text<P: AsRef<Path>>(base: P, outlines: &[Vec<(usize, usize)>]) -> CellResult<PathBuf> {
    let mut path = base.as_ref().as_os_str().to_owned();
    path.push(format!("{}.txt", suffix::CP_OUTLINES));
    let path = PathBuf::from(path);

    let mut f = BufWriter::new(File::create(&path)?);
    for o in outlines {
        let line = itertools::join(o.iter().flat_map(|&(x, y)| [x, y]), ",");
        writeln!(f, "{line}")?;
    }
    f.flush()?;
    Ok(path)
}

/// 追踪并写出 2D 掩码的轮廓文本. 3D 掩码返回 [`CellError::UnsupportedFormat`].
pub fn save_outlines<P: AsRef<Path>>(base: P, masks: ArrayViewD<u32>) -> CellResult<PathBuf> {
    if masks.ndim() != 2 {
        return Err(CellError::UnsupportedFormat(format!(
            "cannot save outlines of {}-D masks",
            masks.ndim()
        )));
    }
    let plane = masks
        .into_dimensionality()
        .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?;
    outlines_to_text(base, &outlines_list(plane))
}
