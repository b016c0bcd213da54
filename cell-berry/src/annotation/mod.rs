//! 多边形实例标注数据库.
//!
//! [`AnnotationStore`] 只读地包装一个 COCO 格式的标注文件, 以图像 id 为键提供
//! 类别表和每张图的标注列表. 上层只通过 [`InstanceSource`] 使用它,
//! 从而与具体的标注格式解耦.

mod coco;
mod raster;

pub use coco::{Annotation, ImageRecord, RleCounts, Segmentation};
pub use raster::rasterize;

use crate::{CellError, CellResult, Idx2d};
use coco::CocoFile;
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// 一张图像的全部实例: 有序的二值掩码及其类别.
#[derive(Debug, Clone)]
pub struct InstanceMasks {
    /// 图像形状 (高, 宽). 没有实例时仍然有效.
    pub shape: Idx2d,

    /// 每个实例一个二值掩码, 顺序即实例编号顺序.
    pub masks: Vec<Array2<u8>>,

    /// 与 `masks` 一一对应的零起始类别索引.
    pub classes: Vec<usize>,
}

impl InstanceMasks {
    /// 实例个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// 是否没有任何实例.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// 实例来源. 唯一的能力: 对图像 `id` 给出有序的二值实例掩码和类别名列表.
pub trait InstanceSource {
    /// 零起始类别索引空间中的类别名.
    fn class_names(&self) -> &[String];

    /// 获取图像 `image_id` 的全部实例.
    ///
    /// `image_id` 不存在时返回 [`CellError::AnnotationNotFound`].
    fn instance_masks(&self, image_id: u64) -> CellResult<InstanceMasks>;
}

/// 只读的标注数据库.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    images: BTreeMap<u64, ImageRecord>,
    annotations: HashMap<u64, Vec<Annotation>>,

    /// 按名称字母序 (同名按原生 id) 排列的类别名.
    classes: Vec<String>,

    /// `category_ids[i]` 为类别索引 `i` 对应的原生类别 id.
    category_ids: Vec<u64>,
}

impl AnnotationStore {
    /// 从 `path` 打开 JSON 标注文件.
    pub fn open<P: AsRef<Path>>(path: P) -> CellResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let file: CocoFile = serde_json::from_reader(reader).map_err(|source| CellError::Json {
            path: path.to_owned(),
            source,
        })?;
        let store = Self::from_coco(file);
        log::debug!(
            "loaded {} images, {} classes from {}",
            store.images.len(),
            store.classes.len(),
            path.display()
        );
        Ok(store)
    }

    /// 从内存中的 JSON 文本构建.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<CocoFile>(s).map(Self::from_coco)
    }

    fn from_coco(file: CocoFile) -> Self {
        let CocoFile {
            images,
            annotations: anns,
            mut categories,
        } = file;

        let images: BTreeMap<u64, ImageRecord> = images.into_iter().map(|r| (r.id, r)).collect();
        let mut annotations: HashMap<u64, Vec<Annotation>> = HashMap::with_capacity(images.len());
        for ann in anns {
            annotations.entry(ann.image_id).or_default().push(ann);
        }
        for v in annotations.values_mut() {
            v.sort_by_key(|a| a.id);
        }

        categories.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        let (classes, category_ids) = categories.into_iter().map(|c| (c.name, c.id)).unzip();

        Self {
            images,
            annotations,
            classes,
            category_ids,
        }
    }

    /// 类别名, 下标即零起始类别索引.
    #[inline]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// 零起始类别索引对应的原生类别 id.
    #[inline]
    pub fn category_id(&self, class_index: usize) -> Option<u64> {
        self.category_ids.get(class_index).copied()
    }

    /// 原生类别 id 对应的零起始类别索引.
    pub fn class_index(&self, category_id: u64) -> Option<usize> {
        self.category_ids.iter().position(|&c| c == category_id)
    }

    /// 全部图像 id, 升序.
    pub fn ids(&self) -> Vec<u64> {
        self.images.keys().copied().collect()
    }

    /// 图像个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// 数据库是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// 获取图像记录.
    pub fn image(&self, id: u64) -> CellResult<&ImageRecord> {
        self.images
            .get(&id)
            .ok_or(CellError::AnnotationNotFound { id })
    }

    /// 获取图像 `id` 的全部标注 (可能为空).
    pub fn annotations(&self, id: u64) -> CellResult<&[Annotation]> {
        self.image(id)?;
        Ok(self.annotations.get(&id).map_or(&[][..], Vec::as_slice))
    }

    /// 图像 `id` 中每个标注的零起始类别索引, 顺序同 [`Self::annotations`].
    ///
    /// 类别表中不存在的原生 id 被跳过.
    pub fn image_classes(&self, id: u64) -> CellResult<Vec<usize>> {
        Ok(self
            .annotations(id)?
            .iter()
            .filter_map(|a| self.class_index(a.category_id))
            .collect())
    }

    /// 每张图像的宽高比 (宽 / 高), 按 id 升序.
    pub fn aspect_ratios(&self) -> Vec<f64> {
        self.images
            .values()
            .map(|r| f64::from(r.width) / f64::from(r.height.max(1)))
            .collect()
    }
}

impl InstanceSource for AnnotationStore {
    fn class_names(&self) -> &[String] {
        self.classes()
    }

    fn instance_masks(&self, image_id: u64) -> CellResult<InstanceMasks> {
        let shape = self.image(image_id)?.shape();
        let anns = self.annotations(image_id)?;
        let mut masks = Vec::with_capacity(anns.len());
        let mut classes = Vec::with_capacity(anns.len());
        for ann in anns {
            masks.push(rasterize(ann.segmentation.as_ref(), shape)?);
            classes.push(self.class_index(ann.category_id).unwrap_or(0));
        }
        Ok(InstanceMasks {
            shape,
            masks,
            classes,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 两张 8x8 图像: 1 号有两个实例, 2 号没有实例.
    pub(crate) const TWO_IMAGES: &str = r#"{
        "images": [
            {"id": 2, "width": 8, "height": 8, "file_name": "empty.png"},
            {"id": 1, "width": 8, "height": 8, "file_name": "cells.png"}
        ],
        "annotations": [
            {"id": 11, "image_id": 1, "category_id": 7,
             "segmentation": [[4, 4, 8, 4, 8, 8, 4, 8]]},
            {"id": 10, "image_id": 1, "category_id": 3,
             "segmentation": [[0, 0, 4, 0, 4, 4, 0, 4]]}
        ],
        "categories": [
            {"id": 7, "name": "nucleus"},
            {"id": 3, "name": "cell"}
        ]
    }"#;

    #[test]
    fn test_classes_alphabetical_and_round_trip() {
        let store = AnnotationStore::from_json_str(TWO_IMAGES).unwrap();
        assert_eq!(store.classes(), ["cell", "nucleus"]);
        for idx in 0..store.classes().len() {
            let cat = store.category_id(idx).unwrap();
            assert_eq!(store.class_index(cat), Some(idx));
        }
        assert_eq!(store.category_id(2), None);
    }

    #[test]
    fn test_annotations_by_image() {
        let store = AnnotationStore::from_json_str(TWO_IMAGES).unwrap();
        assert_eq!(store.ids(), vec![1, 2]);
        let anns = store.annotations(1).unwrap();
        assert_eq!(anns.iter().map(|a| a.id).collect::<Vec<_>>(), vec![10, 11]);
        assert!(store.annotations(2).unwrap().is_empty());
        assert_eq!(store.image_classes(1).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_missing_image_id() {
        let store = AnnotationStore::from_json_str(TWO_IMAGES).unwrap();
        let err = store.annotations(99).unwrap_err();
        assert!(matches!(err, CellError::AnnotationNotFound { id: 99 }));
        assert!(store.instance_masks(99).unwrap_err().is_resamplable());
    }

    #[test]
    fn test_instance_masks_in_annotation_order() {
        let store = AnnotationStore::from_json_str(TWO_IMAGES).unwrap();
        let inst = store.instance_masks(1).unwrap();
        assert_eq!(inst.len(), 2);
        assert_eq!(inst.shape, (8, 8));
        // 第一个实例 (id 10) 位于左上角
        assert_eq!(inst.masks[0][(0, 0)], 1);
        assert_eq!(inst.masks[1][(0, 0)], 0);
        assert_eq!(inst.masks[1][(7, 7)], 1);
        assert_eq!(inst.classes, vec![0, 1]);

        assert!(store.instance_masks(2).unwrap().is_empty());
        assert_eq!(store.aspect_ratios(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_open_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("annotation.json");
        std::fs::write(&p, "{not json").unwrap();
        let err = AnnotationStore::open(&p).unwrap_err();
        assert!(err.to_string().contains("annotation.json"));
    }
}
