//! 交互式标注会话的状态与导出.
//!
//! 会话显式持有图像栈, 掩码, 轮廓, 颜色等全部状态, 由调用者以 `&mut` 传递.

use super::bundle::{FlowPart, SegRecord};
use super::outline::{outline_labels, save_outlines as write_outlines};
use super::with_tail;
use crate::consts::suffix;
use crate::encode::{relabel_consecutive, LabelArray};
use crate::io::imsave_labels;
use crate::{CellError, CellResult};
use ndarray::{s, stack, Array1, Array2, Array4, ArrayD, ArrayView3, ArrayViewD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// 去掉所有长度为 1 的轴.
fn squeeze<T: Clone>(arr: ArrayD<T>) -> CellResult<ArrayD<T>> {
    let shape: Vec<usize> = arr.shape().iter().copied().filter(|&n| n != 1).collect();
    arr.as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&shape))
        .map_err(|e| CellError::UnsupportedFormat(e.to_string()))
}

fn into_ix<D: ndarray::Dimension>(arr: ArrayD<f32>) -> CellResult<ndarray::Array<f32, D>> {
    arr.into_dimensionality()
        .map_err(|e| CellError::UnsupportedFormat(e.to_string()))
}

/// 把 `Z x C x H x W` 补齐或截断为 3 通道, 返回是否补了两个及以上的空通道.
fn fill_channels(zchw: Array4<f32>) -> (Array4<f32>, bool) {
    let (z, c, h, w) = zchw.dim();
    if c >= 3 {
        return (zchw.slice(s![.., ..3, .., ..]).to_owned(), false);
    }
    let mut out = Array4::<f32>::zeros((z, 3, h, w));
    out.slice_mut(s![.., ..c, .., ..]).assign(&zchw);
    (out, 3 - c > 1)
}

/// 交互式标注会话.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// 当前图像文件.
    pub filename: PathBuf,

    /// `Z x Ly x Lx x 3` 图像栈, 取值 `[0, 255]`.
    pub stack: Array4<f32>,

    /// 原图是否只有一个有效通道.
    pub onechan: bool,

    /// 是否为真正的 3D 栈 (而不是单张图像).
    pub is_stack: bool,

    /// `Z x Ly x Lx` 实例掩码.
    pub masks: LabelArray,

    /// `Z x Ly x Lx` 带实例编号的轮廓.
    pub outlines: LabelArray,

    /// 每个实例的 RGB 颜色, `N x 3`.
    pub colors: Array2<u8>,

    /// 每个实例是否为手工绘制.
    pub ismanual: Array1<bool>,

    /// 每个实例绘制时所在的平面, -1 表示非手工.
    pub zdraw: Vec<i16>,

    /// 通道选择 `[细胞质, 细胞核]`.
    pub channels: [usize; 2],

    /// 当前显示通道.
    pub current_channel: i64,

    /// 放大系数. 只作为元数据保存.
    pub x2: f32,

    /// 当前平面.
    pub current_z: usize,

    /// 模型输出的流场导出.
    pub flows: Vec<FlowPart>,

    rng: StdRng,
}

impl SessionState {
    /// 以颜色种子 `seed` 创建空会话.
    pub fn new<P: AsRef<Path>>(filename: P, seed: u64) -> Self {
        let empty = LabelArray::U16(ArrayD::zeros(IxDyn(&[1, 0, 0])));
        Self {
            filename: filename.as_ref().to_owned(),
            stack: Array4::zeros((1, 0, 0, 3)),
            onechan: false,
            is_stack: false,
            masks: empty.clone(),
            outlines: empty,
            colors: Array2::zeros((0, 3)),
            ismanual: Array1::from_elem(0, false),
            zdraw: Vec::new(),
            channels: [0, 0],
            current_channel: 0,
            x2: 0.0,
            current_z: 0,
            flows: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 平面数.
    #[inline]
    pub fn nz(&self) -> usize {
        self.stack.dim().0
    }

    /// 空间形状 (高, 宽).
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        let (_, h, w, _) = self.stack.dim();
        (h, w)
    }

    /// 实例个数.
    #[inline]
    pub fn ncells(&self) -> u32 {
        self.masks.max()
    }

    /// 载入图像并规范化为 `Z x Ly x Lx x 3`.
    ///
    /// 1. 4D: 第一维小于 4 时视为 `C x Z x H x W`, 否则最后一维小于 4 时视为 `Z x H x W x C`,
    ///   其余视为 `Z x C x H x W`; 通道不足 3 时补零;
    /// 2. 3D: 第一维小于 5 时视为 `C x H x W`; 最后一维小于 5 时视为单张多通道图像,
    ///   否则视为 `Z x H x W` 灰度栈;
    /// 3. 2D: 单张灰度图;
    /// 4. 取值超出 `[0, 255]` 或最大值不超过 50 时线性拉伸到 `[0, 255]`;
    /// 5. 灰度平面复制为 3 通道.
    ///
    /// 掩码与轮廓被清空, 当前平面置于中间.
    pub fn initialize_images(&mut self, image: ArrayViewD<f32>, x2: f32) -> CellResult<()> {
        let owned = image.to_owned();
        let (raw, onechan) = match *image.shape() {
            [a, _, _, d] => {
                let zchw = into_ix::<ndarray::Ix4>(owned)?;
                let zchw = if a < 4 {
                    zchw.permuted_axes([1, 0, 2, 3])
                } else if d < 4 {
                    zchw.permuted_axes([0, 3, 1, 2])
                } else {
                    zchw
                };
                let (filled, onechan) = fill_channels(zchw);
                (filled.permuted_axes([0, 2, 3, 1]), onechan)
            }
            [a, _, _] => {
                let img = into_ix::<ndarray::Ix3>(owned)?;
                let hwc = if a < 5 { img.permuted_axes([1, 2, 0]) } else { img };
                let c = hwc.dim().2;
                if c < 5 {
                    let zchw = hwc.permuted_axes([2, 0, 1]).insert_axis(Axis(0));
                    let (filled, onechan) = fill_channels(zchw);
                    (filled.permuted_axes([0, 2, 3, 1]), onechan)
                } else {
                    // Z x H x W 灰度栈
                    let zhw = hwc;
                    (stack(Axis(3), &[zhw.view(), zhw.view(), zhw.view()]).map_err(|e| CellError::UnsupportedFormat(e.to_string()))?, true)
                }
            }
            [h, w] => {
                let plane = owned.into_shape((1, h, w)).map_err(|e| CellError::UnsupportedFormat(e.to_string()))?;
                (stack(Axis(3), &[plane.view(), plane.view(), plane.view()]).map_err(|e| CellError::UnsupportedFormat(e.to_string()))?, true)
            }
            ref other => {
                return Err(CellError::UnsupportedFormat(format!("cannot show image of shape {other:?}")));
            }
        };
        let mut stack = raw.as_standard_layout().into_owned();

        let (min, max) = stack
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
        if max > 255.0 || min < 0.0 || max <= 50.0 {
            let range = max - min;
            stack.mapv_inplace(|v| if range > 0.0 { (v - min) / range * 255.0 } else { 0.0 });
        }

        let (z, h, w, _) = stack.dim();
        log::debug!("{} planes of {}x{} loaded", z, h, w);
        self.stack = stack;
        self.onechan = onechan;
        self.is_stack = z > 1;
        self.x2 = x2;
        self.current_z = z / 2;
        let empty = LabelArray::U16(ArrayD::zeros(IxDyn(&[z, h, w])));
        self.masks = empty.clone();
        self.outlines = empty;
        self.colors = Array2::zeros((0, 3));
        self.ismanual = Array1::from_elem(0, false);
        self.zdraw.clear();
        Ok(())
    }

    /// 载入掩码 (及可选的轮廓).
    ///
    /// 掩码重新连续编号并以最小位宽保存; 未给出轮廓时逐平面计算.
    /// 每个实例分配一个随机颜色, 手工标记全部清除.
    pub fn masks_to_gui(&mut self, masks: ArrayViewD<u32>, outlines: Option<ArrayViewD<u32>>) -> CellResult<()> {
        let (h, w) = self.shape();
        let expected = [self.nz(), h, w];
        let lift = |a: ArrayViewD<u32>| -> CellResult<ArrayD<u32>> {
            let a = if a.ndim() == 2 { a.insert_axis(Axis(0)) } else { a };
            if a.shape() != expected {
                return Err(CellError::shape_mismatch(&expected, a.shape()));
            }
            Ok(relabel_consecutive(a))
        };

        let masks = lift(masks)?;
        let outlines = match outlines {
            Some(o) => lift(o)?,
            None => {
                let mut out = ArrayD::<u32>::zeros(masks.shape());
                for (mut o, m) in out.outer_iter_mut().zip(masks.outer_iter()) {
                    o.assign(&outline_labels(m)?);
                }
                out
            }
        };

        let masks = LabelArray::narrow(masks.view());
        let n = masks.max() as usize;
        let rng = &mut self.rng;
        self.colors = Array2::from_shape_fn((n, 3), |_| rng.gen_range(0..=255u8));
        self.ismanual = Array1::from_elem(n, false);
        self.zdraw = vec![-1; n];
        self.outlines = LabelArray::narrow(outlines.view());
        self.masks = masks;
        log::debug!("{n} masks loaded into session");
        Ok(())
    }

    /// 通道选择后的当前平面: 灰度时为通道均值, 否则为所选的一个或两个通道.
    fn chosen_plane(&self) -> CellResult<ArrayD<f32>> {
        let plane: ArrayView3<f32> = self.stack.index_axis(Axis(0), self.current_z);
        match self.channels {
            [0, _] => Ok(plane.mean_axis(Axis(2)).map_or_else(
                || ArrayD::zeros(IxDyn(&[0])),
                |m| m.insert_axis(Axis(2)).into_dyn(),
            )),
            [c0, c1] if c0 > 3 || c1 > 3 => Err(CellError::InvalidConfig(format!(
                "channels {:?} out of range for RGB stack",
                [c0, c1]
            ))),
            [c0, c1] => {
                let mut ids = vec![c0 - 1];
                if c1 > 0 {
                    ids.push(c1 - 1);
                }
                Ok(plane.select(Axis(2), &ids).into_dyn())
            }
        }
    }

    fn base(&self) -> PathBuf {
        self.filename.with_extension("")
    }

    /// 保存会话到 `{stem}_seg.npz`, 返回路径.
    ///
    /// 3D 栈保存 `outlines, colors, masks, current_channel, filename, flows, zdraw`;
    /// 单张图像保存 `outlines, colors, masks, chan_choose, img, ismanual, X2, filename, flows`,
    /// 其中数组去掉长度为 1 的轴.
    pub fn save_sets(&self) -> CellResult<PathBuf> {
        let filename = self.filename.to_string_lossy().into_owned();
        let record = if self.nz() > 1 && self.is_stack {
            SegRecord {
                outlines: Some(self.outlines.clone()),
                colors: Some(self.colors.clone()),
                masks: Some(self.masks.clone()),
                current_channel: Some(self.current_channel),
                filename,
                flows: self.flows.clone(),
                zdraw: Some(Array1::from(self.zdraw.clone())),
                ..Default::default()
            }
        } else {
            let squeeze_labels = |l: &LabelArray| -> CellResult<LabelArray> {
                Ok(match l {
                    LabelArray::U16(a) => LabelArray::U16(squeeze(a.clone())?),
                    LabelArray::U32(a) => LabelArray::U32(squeeze(a.clone())?),
                })
            };
            SegRecord {
                outlines: Some(squeeze_labels(&self.outlines)?),
                colors: Some(self.colors.clone()),
                masks: Some(squeeze_labels(&self.masks)?),
                chan_choose: Some(self.channels),
                img: Some(squeeze(self.chosen_plane()?)?),
                ismanual: Some(self.ismanual.clone()),
                x2: Some(self.x2),
                filename,
                flows: self.flows.clone(),
                ..Default::default()
            }
        };
        let path = with_tail(&self.filename, &format!("{}.npz", suffix::SEG));
        record.save(&path)?;
        log::info!(
            "{} ROIs saved, channels {:?}",
            self.ncells(),
            self.channels
        );
        Ok(path)
    }

    /// 保存掩码: 单平面为 `{stem}_cp_masks.png`, 多平面为 `{stem}_cp_masks.tif`.
    pub fn save_png(&self) -> CellResult<PathBuf> {
        let (ext, labels) = if self.nz() == 1 {
            let plane = match &self.masks {
                LabelArray::U16(a) => LabelArray::U16(a.index_axis(Axis(0), 0).to_owned()),
                LabelArray::U32(a) => LabelArray::U32(a.index_axis(Axis(0), 0).to_owned()),
            };
            ("png", plane)
        } else {
            ("tif", self.masks.clone())
        };
        let path = with_tail(&self.filename, &format!("{}.{ext}", suffix::CP_MASKS));
        imsave_labels(&path, &labels)?;
        Ok(path)
    }

    /// 单平面时保存轮廓文本并返回路径; 多平面时跳过并返回 `None`.
    pub fn save_outlines(&self) -> CellResult<Option<PathBuf>> {
        if self.nz() != 1 {
            log::warn!("cannot save 3D outlines of {}", self.filename.display());
            return Ok(None);
        }
        let plane = self.masks.to_u32();
        let plane = plane.index_axis(Axis(0), 0);
        write_outlines(self.base(), plane).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_labels;
    use ndarray::Array;

    fn gray(h: usize, w: usize) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[h, w]), |ix| (ix[0] * w + ix[1]) as f32 * 10.0)
    }

    #[test]
    fn test_initialize_gray_image() {
        let mut s = SessionState::new("a.png", 0);
        s.initialize_images(gray(4, 6).view(), 0.0).unwrap();
        assert_eq!(s.stack.dim(), (1, 4, 6, 3));
        assert!(s.onechan);
        assert!(!s.is_stack);
        assert_eq!(s.current_z, 0);
        // 最大值 230 在字节范围内, 不拉伸
        assert_eq!(s.stack[(0, 3, 5, 2)], 230.0);
    }

    #[test]
    fn test_initialize_rescales_and_orders_channels() {
        let mut s = SessionState::new("a.tif", 0);
        // C x H x W, 两个通道, 取值超过 255
        let img = Array::from_shape_fn(IxDyn(&[2, 4, 6]), |ix| (ix[0] * 1000 + ix[1] + ix[2]) as f32);
        s.initialize_images(img.view(), 0.0).unwrap();
        assert_eq!(s.stack.dim(), (1, 4, 6, 3));
        assert!(!s.onechan);
        let max = s.stack.iter().copied().fold(f32::MIN, f32::max);
        assert!((max - 255.0).abs() < 1e-3);

        // Z x H x W x C 的 4D 栈
        let vol = ArrayD::from_elem(IxDyn(&[5, 4, 6, 1]), 100.0);
        s.initialize_images(vol.view(), 2.0).unwrap();
        assert_eq!(s.stack.dim(), (5, 4, 6, 3));
        assert!(s.onechan && s.is_stack);
        assert_eq!(s.current_z, 2);
        assert_eq!(s.x2, 2.0);
    }

    #[test]
    fn test_masks_to_gui_relabels() {
        let mut s = SessionState::new("a.png", 7);
        s.initialize_images(gray(6, 6).view(), 0.0).unwrap();
        let mut m = ndarray::Array2::<u32>::zeros((6, 6));
        m.slice_mut(s![0..3, 0..3]).fill(40);
        m.slice_mut(s![3..6, 3..6]).fill(9);
        s.masks_to_gui(m.view().into_dyn(), None).unwrap();
        assert_eq!(s.ncells(), 2);
        assert!(s.masks.is_u16());
        let masks = s.masks.to_u32();
        assert_eq!(masks[[0, 0, 0]], 2);
        assert_eq!(masks[[0, 5, 5]], 1);
        assert_eq!(s.outlines.to_u32()[[0, 1, 1]], 0);
        assert_eq!(s.outlines.to_u32()[[0, 2, 2]], 2);
        assert_eq!(s.colors.dim(), (2, 3));
        assert_eq!(s.zdraw, vec![-1, -1]);
        assert_eq!(s.ismanual.len(), 2);

        let wrong = ndarray::Array2::<u32>::zeros((5, 6));
        assert!(s.masks_to_gui(wrong.view().into_dyn(), None).is_err());
    }

    #[test]
    fn test_save_single_plane_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = SessionState::new(dir.path().join("a.png"), 1);
        let rgb = Array::from_shape_fn(IxDyn(&[6, 6, 3]), |ix| (ix[2] * 60 + ix[0]) as f32);
        s.initialize_images(rgb.view(), 0.0).unwrap();
        let mut m = ndarray::Array2::<u32>::zeros((6, 6));
        m.slice_mut(s![1..5, 1..5]).fill(1);
        s.masks_to_gui(m.view().into_dyn(), None).unwrap();
        s.channels = [2, 1];

        let npz = s.save_sets().unwrap();
        assert_eq!(npz, dir.path().join("a_seg.npz"));
        let rec = SegRecord::load(&npz).unwrap();
        assert_eq!(rec.masks.unwrap().shape(), &[6, 6]);
        assert_eq!(rec.img.unwrap().shape(), &[6, 6, 2]);
        assert_eq!(rec.chan_choose, Some([2, 1]));
        assert_eq!(rec.x2, Some(0.0));
        assert!(rec.zdraw.is_none());

        let png = s.save_png().unwrap();
        assert_eq!(png, dir.path().join("a_cp_masks.png"));
        assert_eq!(read_labels(&png).unwrap(), m.into_dyn());
        let txt = s.save_outlines().unwrap().unwrap();
        assert_eq!(txt, dir.path().join("a_cp_outlines.txt"));
    }

    #[test]
    fn test_save_stack_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = SessionState::new(dir.path().join("v.tif"), 1);
        let vol = ArrayD::from_elem(IxDyn(&[3, 4, 4]), 1.0);
        s.initialize_images(vol.view(), 0.0).unwrap();
        assert_eq!(s.stack.dim(), (1, 4, 4, 3));

        // 最后一维不小于 5 时视为 Z x H x W 灰度栈
        let vol = ArrayD::from_elem(IxDyn(&[6, 8, 8]), 1.0);
        s.initialize_images(vol.view(), 0.0).unwrap();
        assert_eq!(s.stack.dim(), (6, 8, 8, 3));
        assert!(s.is_stack && s.onechan);
        let mut masks = ArrayD::<u32>::zeros(IxDyn(&[6, 8, 8]));
        masks.slice_mut(s![.., 2..5, 2..5]).fill(1);
        s.masks_to_gui(masks.view(), None).unwrap();

        let rec = SegRecord::load(s.save_sets().unwrap()).unwrap();
        assert_eq!(rec.zdraw.unwrap().len(), 1);
        assert!(rec.chan_choose.is_none());
        assert_eq!(rec.masks.unwrap().shape(), &[6, 8, 8]);

        assert_eq!(s.save_png().unwrap(), dir.path().join("v_cp_masks.tif"));
        assert_eq!(s.save_outlines().unwrap(), None);
    }
}
