//! 分割结果归档 `{stem}_seg.npz` 的读写.
//!
//! 归档是 numpy 可直接加载的 npz 文件, 每个字段一个数组. 标量以 0 维数组保存,
//! 文件名以 UTF-8 字节数组保存, 流场导出的每一部分保存为 `flows_{k}`.

use crate::encode::LabelArray;
use crate::{CellError, CellResult};
use ndarray::{arr0, Array1, Array2, ArrayD, Ix0, Ix1, Ix2, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek};
use std::path::Path;

/// 流场导出的一部分: 可视化用的字节图或原始浮点场.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowPart {
    /// 8 位可视化.
    U8(ArrayD<u8>),

    /// 原始浮点数据.
    F32(ArrayD<f32>),
}

impl FlowPart {
    /// 形状.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::U8(a) => a.shape(),
            Self::F32(a) => a.shape(),
        }
    }
}

/// 一次分割结果的完整记录. 每次保存都会覆盖旧文件.
///
/// 批量推理导出的记录带有 `chan_choose`, `ismanual`, `est_diam`;
/// 交互会话导出的记录另有 `colors`, `current_channel`, `zdraw`, `x2`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegRecord {
    /// 带实例编号的轮廓.
    pub outlines: Option<LabelArray>,

    /// 实例掩码.
    pub masks: Option<LabelArray>,

    /// 通道选择.
    pub chan_choose: Option<[usize; 2]>,

    /// 输入图像.
    pub img: Option<ArrayD<f32>>,

    /// 每个实例是否为手工绘制.
    pub ismanual: Option<Array1<bool>>,

    /// 原始图像文件名.
    pub filename: String,

    /// 流场导出.
    pub flows: Vec<FlowPart>,

    /// 估计的细胞直径.
    pub est_diam: Option<f32>,

    /// 每个实例的 RGB 颜色, `N x 3`.
    pub colors: Option<Array2<u8>>,

    /// 当前显示通道.
    pub current_channel: Option<i64>,

    /// 每个实例绘制时所在的 Z 平面, -1 表示非手工绘制.
    pub zdraw: Option<Array1<i16>>,

    /// 放大系数.
    pub x2: Option<f32>,
}

fn add_labels<W: std::io::Write + Seek>(npz: &mut NpzWriter<W>, name: &str, labels: &LabelArray) -> CellResult<()> {
    match labels {
        LabelArray::U16(a) => npz.add_array(name, a)?,
        LabelArray::U32(a) => npz.add_array(name, a)?,
    }
    Ok(())
}

/// 按存储类型读取标签: 先试 16 位, 再试 32 位.
fn read_labels<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> CellResult<LabelArray> {
    match npz.by_name::<OwnedRepr<u16>, IxDyn>(name) {
        Ok(a) => Ok(LabelArray::U16(a)),
        Err(ReadNpzError::Npy(_)) => Ok(LabelArray::U32(npz.by_name::<OwnedRepr<u32>, IxDyn>(name)?)),
        Err(e) => Err(e.into()),
    }
}

fn read_flow<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> CellResult<FlowPart> {
    match npz.by_name::<OwnedRepr<u8>, IxDyn>(name) {
        Ok(a) => Ok(FlowPart::U8(a)),
        Err(ReadNpzError::Npy(_)) => Ok(FlowPart::F32(npz.by_name::<OwnedRepr<f32>, IxDyn>(name)?)),
        Err(e) => Err(e.into()),
    }
}

impl SegRecord {
    /// 实例个数: 掩码的最大编号.
    pub fn instance_count(&self) -> u32 {
        self.masks.as_ref().map_or(0, LabelArray::max)
    }

    /// 写出为 npz 归档.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CellResult<()> {
        let path = path.as_ref();
        let mut npz = NpzWriter::new(BufWriter::new(File::create(path)?));
        if let Some(o) = &self.outlines {
            add_labels(&mut npz, "outlines", o)?;
        }
        if let Some(c) = &self.colors {
            npz.add_array("colors", c)?;
        }
        if let Some(m) = &self.masks {
            add_labels(&mut npz, "masks", m)?;
        }
        if let Some([c0, c1]) = self.chan_choose {
            npz.add_array("chan_choose", &Array1::from(vec![c0 as i64, c1 as i64]))?;
        }
        if let Some(c) = self.current_channel {
            npz.add_array("current_channel", &arr0(c))?;
        }
        if let Some(img) = &self.img {
            npz.add_array("img", img)?;
        }
        if let Some(m) = &self.ismanual {
            npz.add_array("ismanual", m)?;
        }
        if let Some(x2) = self.x2 {
            npz.add_array("X2", &arr0(x2))?;
        }
        npz.add_array("filename", &Array1::from(self.filename.as_bytes().to_vec()))?;
        for (k, part) in self.flows.iter().enumerate() {
            let name = format!("flows_{k}");
            match part {
                FlowPart::U8(a) => npz.add_array(name, a)?,
                FlowPart::F32(a) => npz.add_array(name, a)?,
            }
        }
        if let Some(z) = &self.zdraw {
            npz.add_array("zdraw", z)?;
        }
        if let Some(d) = self.est_diam {
            npz.add_array("est_diam", &arr0(d))?;
        }
        npz.finish()?;
        log::info!("{} instances saved to {}", self.instance_count(), path.display());
        Ok(())
    }

    /// 从 npz 归档加载. 未知字段被忽略, 缺失字段为 `None`.
    pub fn load<P: AsRef<Path>>(path: P) -> CellResult<Self> {
        let mut npz = NpzReader::new(File::open(path.as_ref())?)?;
        // 键: 去掉 `.npy` 的字段名, 值: 归档中的原始名称
        let names: BTreeMap<String, String> = npz
            .names()?
            .into_iter()
            .map(|n| (n.strip_suffix(".npy").unwrap_or(&n).to_owned(), n))
            .collect();

        let mut rec = Self::default();
        let mut flows: BTreeMap<usize, FlowPart> = BTreeMap::new();
        for (key, raw) in &names {
            let raw = raw.as_str();
            match key.as_str() {
                "outlines" => rec.outlines = Some(read_labels(&mut npz, raw)?),
                "masks" => rec.masks = Some(read_labels(&mut npz, raw)?),
                "colors" => rec.colors = Some(npz.by_name::<OwnedRepr<u8>, Ix2>(raw)?),
                "chan_choose" => {
                    let c = npz.by_name::<OwnedRepr<i64>, Ix1>(raw)?;
                    if c.len() != 2 {
                        return Err(CellError::shape_mismatch(&[2], c.shape()));
                    }
                    rec.chan_choose = Some([c[0].max(0) as usize, c[1].max(0) as usize]);
                }
                "current_channel" => {
                    rec.current_channel = Some(npz.by_name::<OwnedRepr<i64>, Ix0>(raw)?.into_scalar())
                }
                "img" => rec.img = Some(npz.by_name::<OwnedRepr<f32>, IxDyn>(raw)?),
                "ismanual" => rec.ismanual = Some(npz.by_name::<OwnedRepr<bool>, Ix1>(raw)?),
                "X2" => rec.x2 = Some(npz.by_name::<OwnedRepr<f32>, Ix0>(raw)?.into_scalar()),
                "filename" => {
                    let bytes = npz.by_name::<OwnedRepr<u8>, Ix1>(raw)?;
                    rec.filename = String::from_utf8_lossy(&bytes.to_vec()).into_owned();
                }
                "zdraw" => rec.zdraw = Some(npz.by_name::<OwnedRepr<i16>, Ix1>(raw)?),
                "est_diam" => rec.est_diam = Some(npz.by_name::<OwnedRepr<f32>, Ix0>(raw)?.into_scalar()),
                other => {
                    if let Some(k) = other.strip_prefix("flows_").and_then(|k| k.parse().ok()) {
                        flows.insert(k, read_flow(&mut npz, raw)?);
                    }
                }
            }
        }
        rec.flows = flows.into_values().collect();
        Ok(rec)
    }
}
