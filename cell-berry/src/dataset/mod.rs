//! 数据集操作.
//!
//! 目录结构:
//!
//! ```text
//! {root}/
//!   train/
//!     annotation.json
//!     images/
//!   val/
//!     images/
//! ```

mod files;

pub use files::{
    get_image_files, get_label_files, load_train_test_data, natural_cmp, LabelFiles, LabeledSet,
    TrainTestData,
};

use crate::annotation::{AnnotationStore, InstanceSource};
use crate::augment::{pad_image_nd, random_rotate_and_resize, reshape_and_normalize, to_hwc, PadInfo};
use crate::config::{TrainSpec, DATA_DIR_ENV};
use crate::consts::EVAL_EXTENSIONS;
use crate::flow::{CentroidFlows, FlowFieldGenerator};
use crate::io::{extension_of, imread};
use crate::target::TargetBuilder;
use crate::{CellError, CellResult};
use ndarray::{s, Array3, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}

/// 数据集根目录: 环境变量 `$CELL_DATA_DIR`, 否则 `{用户主目录}/dataset/cell`.
pub fn dataset_dir_from_env_or_home() -> Option<PathBuf> {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => home_dataset_dir_with(["cell"]),
    }
}

/// 与 PIL 的 `convert("RGB")` 一致: 灰度复制为 3 通道, 多余通道丢弃.
fn to_rgb(img: ArrayD<f32>) -> CellResult<Array3<f32>> {
    let hwc = to_hwc(img.view())?;
    let (h, w, c) = hwc.dim();
    Ok(match c {
        3 => hwc,
        c if c > 3 => hwc.slice(s![.., .., ..3]).to_owned(),
        _ => {
            let gray = hwc.index_axis(Axis(2), 0);
            Array3::from_shape_fn((h, w, 3), |(y, x, _)| gray[(y, x)])
        }
    })
}

/// 读取图像, 转为 RGB 后按通道选择重排并规范化.
fn load_input(path: &Path, channels: [usize; 2]) -> CellResult<Array3<f32>> {
    let rgb = to_rgb(imread(path)?)?;
    reshape_and_normalize(rgb.view().into_dyn(), channels, true)
}

/// 一次训练取样的结果.
#[derive(Debug, Clone)]
pub struct TrainSample {
    /// 最终使用的图像 id (可能因重采样而与请求的不同).
    pub id: u64,

    /// `2 x Ly' x Lx'` 网络输入.
    pub image: Array3<f32>,

    /// `3 x Ly' x Lx'` 目标: 概率, 行流场, 列流场.
    pub target: Array3<f32>,

    /// 尝试次数, 至少为 1.
    pub attempts: usize,
}

/// 一次推理取样的结果.
#[derive(Debug, Clone)]
pub struct EvalSample {
    /// 图像文件.
    pub path: PathBuf,

    /// 补零后的 `2 x Ly' x Lx'` 网络输入.
    pub image: ArrayD<f32>,

    /// 把预测裁剪回原始尺寸所需的信息.
    pub pad: PadInfo,
}

/// 数据集样本.
#[derive(Debug, Clone)]
pub enum Sample {
    /// 训练模式.
    Train(TrainSample),

    /// 推理模式.
    Eval(EvalSample),
}

#[derive(Debug)]
enum Mode<G> {
    Train {
        builder: TargetBuilder<AnnotationStore, G>,
        img_dir: PathBuf,
        ids: Vec<u64>,
    },
    Eval {
        files: Vec<PathBuf>,
    },
}

/// 细胞实例分割数据集.
///
/// 每个数据集持有自己的标注库和随机数生成器, 不与其他实例共享可变状态.
#[derive(Debug)]
pub struct CellDataset<G = CentroidFlows> {
    mode: Mode<G>,
    spec: TrainSpec,
    rng: StdRng,
}

impl CellDataset<CentroidFlows> {
    /// 以质心流场打开训练集 `{root}/train`.
    pub fn train<P: AsRef<Path>>(root: P, spec: TrainSpec) -> CellResult<Self> {
        Self::train_with(root, spec, CentroidFlows)
    }

    /// 打开推理集 `{root}/val/images`, 收集 png, tif, jpg 文件.
    ///
    /// 没有可用图像时返回 [`CellError::NoImagesFound`].
    pub fn eval<P: AsRef<Path>>(root: P, spec: TrainSpec) -> CellResult<Self> {
        spec.validate()?;
        let dir = root.as_ref().join("val").join("images");
        if !dir.is_dir() {
            return Err(CellError::NoImagesFound { dir });
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && EVAL_EXTENSIONS.contains(&extension_of(p).as_str()))
            .collect();
        if files.is_empty() {
            return Err(CellError::NoImagesFound { dir });
        }
        files.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
        let rng = StdRng::seed_from_u64(spec.seed);
        Ok(Self {
            mode: Mode::Eval { files },
            spec,
            rng,
        })
    }
}

impl<G: FlowFieldGenerator> CellDataset<G> {
    /// 以给定流场生成器打开训练集 `{root}/train`.
    pub fn train_with<P: AsRef<Path>>(root: P, spec: TrainSpec, generator: G) -> CellResult<Self> {
        spec.validate()?;
        let train = root.as_ref().join("train");
        let store = AnnotationStore::open(train.join("annotation.json"))?;
        let ids = store.ids();
        let rng = StdRng::seed_from_u64(spec.seed);
        Ok(Self {
            mode: Mode::Train {
                builder: TargetBuilder::new(store, generator),
                img_dir: train.join("images"),
                ids,
            },
            spec,
            rng,
        })
    }

    /// 样本数.
    pub fn len(&self) -> usize {
        match &self.mode {
            Mode::Train { ids, .. } => ids.len(),
            Mode::Eval { files } => files.len(),
        }
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否为训练模式.
    #[inline]
    pub fn is_train(&self) -> bool {
        matches!(self.mode, Mode::Train { .. })
    }

    /// 参数.
    #[inline]
    pub fn spec(&self) -> &TrainSpec {
        &self.spec
    }

    /// 类别名 (推理模式为空).
    pub fn classes(&self) -> &[String] {
        match &self.mode {
            Mode::Train { builder, .. } => builder.source().class_names(),
            Mode::Eval { .. } => &[],
        }
    }

    /// 训练集每张图像的宽高比, 顺序同样本顺序 (推理模式为空).
    pub fn aspect_ratios(&self) -> Vec<f64> {
        match &self.mode {
            Mode::Train { builder, .. } => builder.source().aspect_ratios(),
            Mode::Eval { .. } => Vec::new(),
        }
    }

    /// 获取第 `i` 个样本.
    ///
    /// 训练模式下, 若该图像无法构建目标 (见 [`CellError::is_resamplable`]),
    /// 随机换一个样本重试, 直到成功; 其余错误直接返回.
    ///
    /// # 注意
    ///
    /// `i >= self.len()` 时程序 panic.
    pub fn get(&mut self, i: usize) -> CellResult<Sample> {
        self.get_within(i, usize::MAX)
    }

    /// 与 [`CellDataset::get`] 相同, 但最多尝试 `attempts` 次.
    ///
    /// 尝试次数耗尽时返回最后一次的可重采样错误.
    ///
    /// # 注意
    ///
    /// `i >= self.len()` 时程序 panic.
    pub fn get_within(&mut self, i: usize, attempts: usize) -> CellResult<Sample> {
        let Self { mode, spec, rng } = self;
        let (builder, img_dir, ids) = match mode {
            Mode::Eval { files } => {
                let path = files[i].clone();
                let input = load_input(&path, spec.channels)?;
                let (image, pad) = pad_image_nd(input.view().into_dyn(), spec.divisor)?;
                return Ok(Sample::Eval(EvalSample { path, image, pad }));
            }
            Mode::Train { builder, img_dir, ids } => (&*builder, &*img_dir, &*ids),
        };

        let mut id = ids[i];
        let mut tried = 0;
        loop {
            tried += 1;
            match builder.build(id) {
                Ok(target) => {
                    let record = builder.source().image(id)?;
                    let input = load_input(&img_dir.join(&record.file_name), spec.channels)?;
                    let (image, target) = random_rotate_and_resize(input.view(), &target, spec.scale_range, rng)?;
                    return Ok(Sample::Train(TrainSample {
                        id,
                        image,
                        target,
                        attempts: tried,
                    }));
                }
                Err(e) if e.is_resamplable() && tried < attempts => {
                    let next = ids[rng.gen_range(0..ids.len())];
                    log::debug!("image {id} skipped ({e}), resampling image {next}");
                    id = next;
                }
                Err(e) => {
                    if e.is_resamplable() {
                        log::warn!("gave up after {tried} attempts starting from index {i}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::tests::TWO_IMAGES;
    use crate::io::write_rgb8;
    use std::fs;

    fn train_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let train = root.path().join("train");
        fs::create_dir_all(train.join("images")).unwrap();
        fs::write(train.join("annotation.json"), TWO_IMAGES).unwrap();
        let img = Array3::from_shape_fn((8, 8, 3), |(h, w, c)| ((h * 8 + w) * (c + 1)) as u8);
        write_rgb8(train.join("images").join("cells.png"), &img).unwrap();
        write_rgb8(train.join("images").join("empty.png"), &img).unwrap();
        root
    }

    #[test]
    fn test_home_dirs() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(home_dataset_dir(), Some(home.join("dataset")));
            assert_eq!(
                home_dataset_dir_with(["cell", "train"]),
                Some(home.join("dataset").join("cell").join("train"))
            );
        }
    }

    #[test]
    fn test_resample_terminates_with_fixed_seed() {
        let _ = simple_logger::SimpleLogger::new().init();
        let root = train_root();
        let mut ds = CellDataset::train(root.path(), TrainSpec::default()).unwrap();
        assert_eq!(ds.len(), 2);
        assert!(ds.is_train());
        assert_eq!(ds.classes(), ["cell", "nucleus"]);
        assert_eq!(ds.aspect_ratios(), vec![1.0, 1.0]);

        // 下标 1 为没有标注的 2 号图像, 最终必然落到 1 号图像
        for _ in 0..5 {
            match ds.get(1).unwrap() {
                Sample::Train(s) => {
                    assert_eq!(s.id, 1);
                    assert!(s.attempts >= 2);
                    assert_eq!(s.image.dim().0, 2);
                    assert_eq!(s.target.dim().0, 3);
                    assert_eq!(&s.image.shape()[1..], &s.target.shape()[1..]);
                }
                Sample::Eval(_) => panic!("train dataset returned eval sample"),
            }
        }
        match ds.get(0).unwrap() {
            Sample::Train(s) => assert_eq!(s.attempts, 1),
            Sample::Eval(_) => unreachable!(),
        }
    }

    #[test]
    fn test_bounded_attempts() {
        let root = train_root();
        let mut ds = CellDataset::train(root.path(), TrainSpec::default()).unwrap();
        assert!(matches!(
            ds.get_within(1, 1).unwrap_err(),
            CellError::TargetUnavailable { id: 2 }
        ));
    }

    #[test]
    fn test_eval_pads_inputs() {
        let root = tempfile::tempdir().unwrap();
        let val = root.path().join("val").join("images");
        assert!(matches!(
            CellDataset::eval(root.path(), TrainSpec::default()).unwrap_err(),
            CellError::NoImagesFound { .. }
        ));
        fs::create_dir_all(&val).unwrap();
        fs::write(val.join("readme.txt"), b"x").unwrap();
        assert!(matches!(
            CellDataset::eval(root.path(), TrainSpec::default()).unwrap_err(),
            CellError::NoImagesFound { .. }
        ));

        let img = Array3::from_shape_fn((10, 20, 3), |(h, w, _)| (h + w) as u8);
        write_rgb8(val.join("a.png"), &img).unwrap();
        let mut ds = CellDataset::eval(root.path(), TrainSpec::default()).unwrap();
        assert!(!ds.is_train());
        match ds.get(0).unwrap() {
            Sample::Eval(s) => {
                assert_eq!(s.pad.shape, (10, 20));
                assert_eq!(s.image.shape(), &[2, 32, 48]);
                assert_eq!(s.pad.crop(s.image.view()).unwrap().shape(), &[2, 10, 20]);
            }
            Sample::Train(_) => unreachable!(),
        }
    }
}
