//! 目录下图像, 标签, 流场缓存文件的发现与配对.
//!
//! 命名约定: 图像 `{base}{image_filter}.{ext}`, 标签 `{base}{mask_filter}.{tif|png}`,
//! 流场缓存 `{base}_flows.tif`.

use crate::consts::{suffix, IMAGE_EXTENSIONS};
use crate::io::{extension_of, imread, read_stack_f32};
use crate::{CellError, CellResult};
use ndarray::{concatenate, ArrayD, Axis};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 把字符串切成数字段与非数字段.
fn chunks(s: &str) -> Vec<(bool, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut digit = None;
    for (i, c) in s.char_indices() {
        let d = c.is_ascii_digit();
        match digit {
            Some(prev) if prev != d => {
                out.push((prev, &s[start..i]));
                start = i;
            }
            _ => {}
        }
        digit = Some(d);
    }
    if let Some(d) = digit {
        out.push((d, &s[start..]));
    }
    out
}

/// 自然序比较: 连续数字按数值比较, 其余按字符比较.
///
/// `img2 < img10`, `a_01 == a_1` 时再按原始字符串决出先后.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (ca, cb) = (chunks(a), chunks(b));
    for (&(da, sa), &(db, sb)) in ca.iter().zip(cb.iter()) {
        let ord = match (da, db) {
            (true, true) => {
                let (ta, tb) = (sa.trim_start_matches('0'), sb.trim_start_matches('0'));
                ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb))
            }
            _ => sa.cmp(sb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ca.len().cmp(&cb.len()).then_with(|| a.cmp(b))
}

/// 去掉扩展名后的完整路径字符串.
fn base_of(path: &Path) -> String {
    path.with_extension("").to_string_lossy().into_owned()
}

/// 不以任一非空后缀结尾.
fn free_of(base: &str, filters: &[&str]) -> bool {
    filters.iter().all(|f| f.is_empty() || !base.ends_with(f))
}

/// 列出 `folder` 下的图像文件 (不递归), 按自然序排序.
///
/// 1. 扩展名为 png, jpg, jpeg, tif, tiff;
/// 2. 去掉扩展名后不以 `_cp_masks`, `_cp_output`, `_flows` 或 `mask_filter` 结尾;
/// 3. 给定非空 `image_filter` 时, 去掉扩展名后必须以它结尾.
///
/// 没有符合条件的文件时返回 [`CellError::NoImagesFound`].
pub fn get_image_files<P: AsRef<Path>>(
    folder: P,
    mask_filter: &str,
    image_filter: Option<&str>,
) -> CellResult<Vec<PathBuf>> {
    let folder = folder.as_ref();
    let imf = image_filter.unwrap_or("");
    let mut filters: Vec<&str> = suffix::RESERVED.to_vec();
    filters.push(mask_filter);

    let mut names = Vec::new();
    if !folder.is_dir() {
        return Err(CellError::NoImagesFound {
            dir: folder.to_path_buf(),
        });
    }
    for entry in WalkDir::new(folder).min_depth(1).max_depth(1).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file() || !IMAGE_EXTENSIONS.contains(&extension_of(path).as_str()) {
            continue;
        }
        let base = base_of(path);
        if free_of(&base, &filters) && base.ends_with(imf) {
            names.push(path.to_path_buf());
        }
    }
    names.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));

    if names.is_empty() {
        return Err(CellError::NoImagesFound {
            dir: folder.to_path_buf(),
        });
    }
    log::debug!("{} images found in {}", names.len(), folder.display());
    Ok(names)
}

/// 与图像一一对应的标签文件, 以及可选的流场缓存文件.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFiles {
    /// 标签文件.
    pub labels: Vec<PathBuf>,

    /// 流场缓存文件. 只有全部存在时才为 `Some`.
    pub flows: Option<Vec<PathBuf>>,
}

/// 为 `images` 中的每张图像寻找标签与流场缓存.
///
/// # 注意
///
/// 1. 流场缓存先以第一张图像未去掉 `image_filter` 的名字探测, 不存在时改用去掉后的名字.
///   只要有一个缺失, 就视为全部没有.
/// 2. 标签扩展名由第一张图像决定, tif 优先于 png. 任一标签缺失时返回
///   [`CellError::LabelsMissing`].
pub fn get_label_files(
    images: &[PathBuf],
    mask_filter: &str,
    image_filter: Option<&str>,
) -> CellResult<LabelFiles> {
    let Some(first) = images.first() else {
        return Ok(LabelFiles {
            labels: Vec::new(),
            flows: None,
        });
    };
    let raw: Vec<String> = images.iter().map(|p| base_of(p)).collect();
    let stripped: Vec<String> = match image_filter {
        Some(imf) if !imf.is_empty() => raw
            .iter()
            .map(|b| b.strip_suffix(imf).unwrap_or(b).to_owned())
            .collect(),
        _ => raw.clone(),
    };

    let with = |bases: &[String], tail: &str| -> Vec<PathBuf> {
        bases.iter().map(|b| PathBuf::from(format!("{b}{tail}"))).collect()
    };

    let flow_tail = format!("{}.tif", suffix::FLOWS);
    let flow_bases = if Path::new(&format!("{}{flow_tail}", raw[0])).exists() {
        &raw
    } else {
        &stripped
    };
    let flows = Some(with(flow_bases, &flow_tail)).filter(|v| v.iter().all(|p| p.exists()));
    match &flows {
        Some(_) => log::debug!("flow caches found next to {}", first.display()),
        None => log::debug!("no complete set of flow caches next to {}", first.display()),
    }

    let tif = format!("{mask_filter}.tif");
    let png = format!("{mask_filter}.png");
    let labels = if Path::new(&format!("{}{tif}", stripped[0])).exists() {
        with(&stripped, &tif)
    } else if Path::new(&format!("{}{png}", stripped[0])).exists() {
        with(&stripped, &png)
    } else {
        return Err(CellError::LabelsMissing {
            path: first.clone(),
            reason: "labels not provided with correct mask filter",
        });
    };
    if let Some(missing) = labels.iter().find(|p| !p.exists()) {
        return Err(CellError::LabelsMissing {
            path: missing.clone(),
            reason: "labels not provided for all images",
        });
    }
    Ok(LabelFiles { labels, flows })
}

/// 一组已加载的图像与标签.
#[derive(Debug, Clone)]
pub struct LabeledSet {
    /// 图像.
    pub images: Vec<ArrayD<f32>>,

    /// 标签. 有流场缓存时为 `(通道, 高, 宽)`, 第 0 通道为标签图.
    pub labels: Vec<ArrayD<f32>>,

    /// 图像文件名.
    pub names: Vec<PathBuf>,
}

/// 训练集与可选的测试集.
#[derive(Debug, Clone)]
pub struct TrainTestData {
    /// 训练集.
    pub train: LabeledSet,

    /// 测试集.
    pub test: Option<LabeledSet>,
}

/// 标签图与流场缓存合并: 缓存少于 4 个通道时把标签图放到最前, 否则直接使用缓存.
fn attach_flows(label: ArrayD<f32>, flows: ndarray::Array3<f32>) -> CellResult<ArrayD<f32>> {
    if flows.dim().0 >= 4 {
        return Ok(flows.into_dyn());
    }
    let label = label.insert_axis(Axis(0));
    concatenate(Axis(0), &[label.view(), flows.view().into_dyn()])
        .map_err(|_| CellError::shape_mismatch(&label.shape()[1..], &flows.shape()[1..]))
}

fn load_set(dir: &Path, image_filter: Option<&str>, mask_filter: &str, unet: bool) -> CellResult<LabeledSet> {
    let names = get_image_files(dir, mask_filter, image_filter)?;
    let files = get_label_files(&names, mask_filter, image_filter)?;
    let images = names.iter().map(imread).collect::<CellResult<Vec<_>>>()?;
    let mut labels = files.labels.iter().map(imread).collect::<CellResult<Vec<_>>>()?;
    match files.flows {
        Some(flows) if !unet => {
            labels = labels
                .into_iter()
                .zip(flows.iter())
                .map(|(l, f)| attach_flows(l, read_stack_f32(f)?))
                .collect::<CellResult<Vec<_>>>()?;
        }
        _ => {}
    }
    Ok(LabeledSet { images, labels, names })
}

/// 加载训练集, 以及给定 `test_dir` 时的测试集. `unet` 为真时忽略流场缓存.
pub fn load_train_test_data<P: AsRef<Path>>(
    train_dir: P,
    test_dir: Option<P>,
    image_filter: Option<&str>,
    mask_filter: &str,
    unet: bool,
) -> CellResult<TrainTestData> {
    let train = load_set(train_dir.as_ref(), image_filter, mask_filter, unet)?;
    let test = test_dir
        .map(|d| load_set(d.as_ref(), image_filter, mask_filter, unet))
        .transpose()?;
    Ok(TrainTestData { train, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{write_f32_stack, write_png16, write_u16};
    use ndarray::{Array2, Array3, IxDyn};
    use std::fs;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, b"").unwrap();
        p
    }

    #[test]
    fn test_natural_order() {
        let mut v = vec!["img10", "img2", "img1", "a", "img02b"];
        v.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(v, ["a", "img1", "img2", "img02b", "img10"]);
        assert_eq!(natural_cmp("x9", "x10"), Ordering::Less);
        assert_eq!(natural_cmp("same", "same"), Ordering::Equal);
    }

    #[test]
    fn test_derivatives_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for n in [
            "a.png",
            "a_masks.png",
            "a_flows.tif",
            "a_cp_masks.png",
            "a_cp_output.png",
            "b.tif",
            "notes.txt",
        ] {
            touch(dir.path(), n);
        }
        let found = get_image_files(dir.path(), "_masks", None).unwrap();
        let names: Vec<_> = found.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, ["a.png", "b.tif"]);
    }

    #[test]
    fn test_image_filter_keeps_matching_stems() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a_img.png", "a_masks.png", "b.png"] {
            touch(dir.path(), n);
        }
        let found = get_image_files(dir.path(), "_masks", Some("_img")).unwrap();
        assert_eq!(found, [dir.path().join("a_img.png")]);
    }

    #[test]
    fn test_empty_folder() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "x_masks.png");
        assert!(matches!(
            get_image_files(dir.path(), "_masks", None).unwrap_err(),
            CellError::NoImagesFound { .. }
        ));
    }

    #[test]
    fn test_missing_folder_has_no_images() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        match get_image_files(&missing, "_masks", None).unwrap_err() {
            CellError::NoImagesFound { dir } => assert_eq!(dir, missing),
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_tif_label_beats_png() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a.png", "b.png", "a_masks.png", "a_masks.tif", "b_masks.tif"] {
            touch(dir.path(), n);
        }
        let images = get_image_files(dir.path(), "_masks", None).unwrap();
        let files = get_label_files(&images, "_masks", None).unwrap();
        assert_eq!(
            files.labels,
            [dir.path().join("a_masks.tif"), dir.path().join("b_masks.tif")]
        );
        assert_eq!(files.flows, None);
    }

    #[test]
    fn test_label_extension_decided_by_first_image() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a.png", "b.png", "a_masks.tif", "b_masks.png"] {
            touch(dir.path(), n);
        }
        let images = get_image_files(dir.path(), "_masks", None).unwrap();
        match get_label_files(&images, "_masks", None).unwrap_err() {
            CellError::LabelsMissing { path, .. } => assert_eq!(path, dir.path().join("b_masks.tif")),
            e => panic!("unexpected {e}"),
        }
    }

    #[test]
    fn test_flows_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a_img.png", "b_img.png", "a_masks.png", "b_masks.png", "a_flows.tif"] {
            touch(dir.path(), n);
        }
        let images = get_image_files(dir.path(), "_masks", Some("_img")).unwrap();
        let files = get_label_files(&images, "_masks", Some("_img")).unwrap();
        assert_eq!(files.flows, None);

        touch(dir.path(), "b_flows.tif");
        let files = get_label_files(&images, "_masks", Some("_img")).unwrap();
        assert_eq!(
            files.flows,
            Some(vec![dir.path().join("a_flows.tif"), dir.path().join("b_flows.tif")])
        );

        // 未去掉过滤词的名字优先
        touch(dir.path(), "a_img_flows.tif");
        let files = get_label_files(&images, "_masks", Some("_img")).unwrap();
        assert_eq!(files.flows, None);
    }

    #[test]
    fn test_load_attaches_short_flow_cache() {
        let dir = tempfile::tempdir().unwrap();
        let img = Array2::from_shape_fn((4, 5), |(h, w)| (h + w) as u16);
        write_png16(dir.path().join("a.png"), img.view()).unwrap();
        let mut lab = Array2::<u16>::zeros((4, 5));
        lab[(1, 1)] = 1;
        write_u16(dir.path().join("a_masks.tif"), lab.view().into_dyn()).unwrap();
        write_f32_stack(dir.path().join("a_flows.tif"), Array3::<f32>::ones((3, 4, 5)).view()).unwrap();

        let data = load_train_test_data(dir.path(), None, None, "_masks", false).unwrap();
        assert!(data.test.is_none());
        assert_eq!(data.train.labels[0].shape(), &[4, 4, 5]);
        assert_eq!(data.train.labels[0][[0, 1, 1]], 1.0);
        assert_eq!(data.train.labels[0][[2, 0, 0]], 1.0);

        let unet = load_train_test_data(dir.path(), Some(dir.path()), None, "_masks", true).unwrap();
        assert_eq!(unet.train.labels[0].shape(), &[4, 5]);
        assert_eq!(unet.test.unwrap().images[0], ArrayD::from_shape_fn(IxDyn(&[4, 5]), |ix| (ix[0] + ix[1]) as f32));
    }
}
