//! 图像文件的读写.
//!
//! png / jpg 通过 `image` crate, tif 通过 `tiff` crate. 读取结果统一为 `ArrayD<f32>`,
//! 像素值按原样保留 (不做 `[0, 1]` 缩放).

mod tif;

pub use tif::{read_stack_f32, read_tiff, write_f32_stack, write_u16, write_u32};

use crate::encode::LabelArray;
use crate::{CellError, CellResult};
use image::{DynamicImage, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array3, ArrayD, ArrayView2, IxDyn};
use std::path::Path;

/// 文件扩展名 (小写). 没有扩展名时为空串.
pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn is_tiff(path: &Path) -> bool {
    matches!(extension_of(path).as_str(), "tif" | "tiff")
}

fn from_samples<T: Copy + Into<f32>>(w: u32, h: u32, c: usize, raw: &[T]) -> CellResult<ArrayD<f32>> {
    let shape: Vec<usize> = match c {
        1 => vec![h as usize, w as usize],
        c => vec![h as usize, w as usize, c],
    };
    ArrayD::from_shape_vec(IxDyn(&shape), raw.iter().map(|&v| v.into()).collect())
        .map_err(|e| CellError::UnsupportedFormat(e.to_string()))
}

/// 读取图像.
///
/// 灰度图为 `(高, 宽)`, 彩色图为 `(高, 宽, 通道)`, 多页 tif 见 [`read_tiff`].
/// 8 位和 16 位样本都按原值转换为 `f32`.
pub fn imread<P: AsRef<Path>>(path: P) -> CellResult<ArrayD<f32>> {
    let path = path.as_ref();
    if is_tiff(path) {
        return read_tiff(path);
    }
    let img = image::open(path)?;
    let (w, h) = (img.width(), img.height());
    match img {
        DynamicImage::ImageLuma8(b) => from_samples(w, h, 1, b.as_raw()),
        DynamicImage::ImageLuma16(b) => from_samples(w, h, 1, b.as_raw()),
        DynamicImage::ImageLumaA8(_) => from_samples(w, h, 1, img.to_luma8().as_raw()),
        DynamicImage::ImageLumaA16(_) => from_samples(w, h, 1, img.to_luma16().as_raw()),
        DynamicImage::ImageRgb8(b) => from_samples(w, h, 3, b.as_raw()),
        DynamicImage::ImageRgba8(b) => from_samples(w, h, 4, b.as_raw()),
        DynamicImage::ImageRgb16(b) => from_samples(w, h, 3, b.as_raw()),
        DynamicImage::ImageRgba16(b) => from_samples(w, h, 4, b.as_raw()),
        other => from_samples(w, h, 3, other.to_rgb32f().as_raw()),
    }
}

/// 读取标签图, 像素值截断为非负整数.
pub fn read_labels<P: AsRef<Path>>(path: P) -> CellResult<ArrayD<u32>> {
    Ok(imread(path)?.mapv(|v| v.max(0.0).round() as u32))
}

/// 以 16 位灰度 png 保存 2D 数组.
pub fn write_png16<P: AsRef<Path>>(path: P, arr: ArrayView2<u16>) -> CellResult<()> {
    let (h, w) = arr.dim();
    let raw: Vec<u16> = arr.iter().copied().collect();
    let buf: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| CellError::UnsupportedFormat("png buffer size mismatch".into()))?;
    buf.save(path)?;
    Ok(())
}

/// 以 8 位 RGB png 保存 `(高, 宽, 3)` 数组.
pub fn write_rgb8<P: AsRef<Path>>(path: P, arr: &Array3<u8>) -> CellResult<()> {
    let (h, w, c) = arr.dim();
    if c != 3 {
        return Err(CellError::shape_mismatch(&[h, w, 3], &[h, w, c]));
    }
    let mut buf = RgbImage::new(w as u32, h as u32);
    for (x, y, px) in buf.enumerate_pixels_mut() {
        let (r, c) = (y as usize, x as usize);
        *px = Rgb([arr[(r, c, 0)], arr[(r, c, 1)], arr[(r, c, 2)]]);
    }
    buf.save(path)?;
    Ok(())
}

/// 保存标签数组, 格式由扩展名决定.
///
/// png 只接受 2D 的 16 位数组; tif 接受 2D / 3D 的 16 位或 32 位数组.
/// 其余情况返回 [`CellError::UnsupportedFormat`].
pub fn imsave_labels<P: AsRef<Path>>(path: P, labels: &LabelArray) -> CellResult<()> {
    let path = path.as_ref();
    match (extension_of(path).as_str(), labels) {
        ("tif" | "tiff", LabelArray::U16(a)) => write_u16(path, a.view()),
        ("tif" | "tiff", LabelArray::U32(a)) => write_u32(path, a.view()),
        ("png", LabelArray::U16(a)) if a.ndim() == 2 => {
            let a = a
                .view()
                .into_dimensionality()
                .map_err(|e| CellError::UnsupportedFormat(e.to_string()))?;
            write_png16(path, a)
        }
        (ext, l) => Err(CellError::UnsupportedFormat(format!(
            "cannot save {}-D {} labels as `{ext}`",
            l.ndim(),
            if l.is_u16() { "16-bit" } else { "32-bit" }
        ))),
    }
}
