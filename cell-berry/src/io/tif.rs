//! 多页 TIFF 的读写.
//!
//! 每页是一个 2D 平面, 页数对应 Z 维或通道维. 读取时所有采样统一转为 `f32`.

use crate::{CellError, CellResult};
use ndarray::{ArrayD, ArrayView2, ArrayView3, Axis, IxDyn};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};
use tiff::ColorType;

fn samples_per_pixel(color: ColorType) -> usize {
    match color {
        ColorType::Gray(_) | ColorType::Palette(_) => 1,
        ColorType::GrayA(_) => 2,
        ColorType::RGB(_) | ColorType::YCbCr(_) => 3,
        ColorType::RGBA(_) | ColorType::CMYK(_) => 4,
    }
}

fn to_f32(page: DecodingResult) -> Vec<f32> {
    match page {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
    }
}

/// 读取 TIFF 文件.
///
/// 结果形状:
///
/// 1. 单页单采样: `(高, 宽)`;
/// 2. 单页多采样: `(高, 宽, 采样)`;
/// 3. 多页单采样: `(页, 高, 宽)`;
/// 4. 多页多采样: `(页, 高, 宽, 采样)`.
///
/// 各页尺寸不一致时返回 [`CellError::ShapeMismatch`].
pub fn read_tiff<P: AsRef<Path>>(path: P) -> CellResult<ArrayD<f32>> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path.as_ref())?))?;
    let mut pages: Vec<f32> = Vec::new();
    let mut first: Option<(usize, usize, usize)> = None;
    let mut n_pages = 0usize;
    loop {
        let (w, h) = decoder.dimensions()?;
        let spp = samples_per_pixel(decoder.colortype()?);
        let dims = (h as usize, w as usize, spp);
        match first {
            None => first = Some(dims),
            Some(expected) if expected != dims => {
                return Err(CellError::shape_mismatch(
                    &[expected.0, expected.1, expected.2],
                    &[dims.0, dims.1, dims.2],
                ));
            }
            Some(_) => {}
        }
        pages.extend(to_f32(decoder.read_image()?));
        n_pages += 1;
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    let (h, w, spp) = first.unwrap_or((0, 0, 1));
    let shape: Vec<usize> = match (n_pages, spp) {
        (1, 1) => vec![h, w],
        (1, s) => vec![h, w, s],
        (p, 1) => vec![p, h, w],
        (p, s) => vec![p, h, w, s],
    };
    ArrayD::from_shape_vec(IxDyn(&shape), pages).map_err(|e| CellError::UnsupportedFormat(e.to_string()))
}

/// 读取流场缓存一类的 "页即通道" 文件, 得到 `(通道, 高, 宽)`.
///
/// 单页文件视作 1 个通道. 多采样页不被接受.
pub fn read_stack_f32<P: AsRef<Path>>(path: P) -> CellResult<ndarray::Array3<f32>> {
    let arr = read_tiff(path.as_ref())?;
    let arr = match arr.ndim() {
        2 => arr.insert_axis(Axis(0)),
        3 => arr,
        _ => {
            return Err(CellError::UnsupportedFormat(format!(
                "{} is not a stack of single-channel pages",
                path.as_ref().display()
            )))
        }
    };
    arr.into_dimensionality()
        .map_err(|e| CellError::UnsupportedFormat(e.to_string()))
}

/// 逐页写出. `pages` 的每一项已按行优先展开.
fn write_pages<C, P, I>(path: P, (h, w): (usize, usize), pages: I) -> CellResult<()>
where
    C: colortype::ColorType,
    [C::Inner]: TiffValue,
    P: AsRef<Path>,
    I: IntoIterator<Item = Vec<C::Inner>>,
{
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    for page in pages {
        encoder.write_image::<C>(w as u32, h as u32, &page)?;
    }
    Ok(())
}

fn flatten<T: Copy>(page: ArrayView2<T>) -> Vec<T> {
    page.iter().copied().collect()
}

/// 以多页 f32 TIFF 保存 `(通道, 高, 宽)` 数组, 每个通道一页.
pub fn write_f32_stack<P: AsRef<Path>>(path: P, stack: ArrayView3<f32>) -> CellResult<()> {
    let (_, h, w) = stack.dim();
    write_pages::<colortype::Gray32Float, _, _>(path, (h, w), stack.outer_iter().map(flatten))
}

macro_rules! impl_write_gray {
    ($($name: ident, $t: ty, $color: ty);+ $(;)?) => {
        $(
            /// 保存 2D (单页) 或 3D (每个 Z 平面一页) 灰度数组.
            ///
            /// 其他维数返回 [`CellError::UnsupportedFormat`].
            pub fn $name<P: AsRef<Path>>(path: P, arr: ndarray::ArrayViewD<$t>) -> CellResult<()> {
                match arr.ndim() {
                    2 => {
                        let (h, w) = (arr.shape()[0], arr.shape()[1]);
                        write_pages::<$color, _, _>(path, (h, w), std::iter::once(arr.iter().copied().collect()))
                    }
                    3 => {
                        let (h, w) = (arr.shape()[1], arr.shape()[2]);
                        let pages = arr.outer_iter().map(|p| p.iter().copied().collect::<Vec<$t>>());
                        write_pages::<$color, _, _>(path, (h, w), pages)
                    }
                    d => Err(CellError::UnsupportedFormat(format!("cannot write {d}-D array as tiff"))),
                }
            }
        )+
    };
}

impl_write_gray!(
    write_u16, u16, colortype::Gray16;
    write_u32, u32, colortype::Gray32;
);

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_f32_stack_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_flows.tif");
        let stack = Array3::from_shape_fn((3, 4, 5), |(c, h, w)| c as f32 - 0.5 * h as f32 + w as f32 / 8.0);
        write_f32_stack(&path, stack.view()).unwrap();
        assert_eq!(read_stack_f32(&path).unwrap(), stack);
    }

    #[test]
    fn test_single_page_is_one_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.tif");
        let page = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |ix| (ix[0] * 3 + ix[1]) as u16);
        write_u16(&path, page.view()).unwrap();
        assert_eq!(read_tiff(&path).unwrap().shape(), &[2, 3]);
        let stack = read_stack_f32(&path).unwrap();
        assert_eq!(stack.dim(), (1, 2, 3));
        assert_eq!(stack[(0, 1, 2)], 5.0);
    }

    #[test]
    fn test_u32_volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tif");
        let vol = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |ix| 70_000 + (ix[0] * 12 + ix[1] * 4 + ix[2]) as u32);
        write_u32(&path, vol.view()).unwrap();
        let back = read_tiff(&path).unwrap();
        assert_eq!(back.shape(), &[2, 3, 4]);
        assert_eq!(back[[1, 2, 3]], 70_023.0);
    }

    #[test]
    fn test_rgb_page_keeps_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.tif");
        let data: Vec<u8> = (0..2 * 3 * 3).collect();
        let file = BufWriter::new(File::create(&path).unwrap());
        TiffEncoder::new(file)
            .unwrap()
            .write_image::<colortype::RGB8>(3, 2, &data)
            .unwrap();
        let img = read_tiff(&path).unwrap();
        assert_eq!(img.shape(), &[2, 3, 3]);
        assert_eq!(img[[1, 2, 1]], 16.0);
    }

    #[test]
    fn test_bad_rank_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let arr = ArrayD::<u16>::zeros(IxDyn(&[4]));
        assert!(matches!(
            write_u16(dir.path().join("x.tif"), arr.view()).unwrap_err(),
            CellError::UnsupportedFormat(_)
        ));
    }
}
