//! 训练目标构建: 标注 -> 实例掩码 -> 标签图 -> 流场.

use crate::annotation::InstanceSource;
use crate::encode::natural_encode;
use crate::flow::{FlowFieldGenerator, FlowTarget};
use crate::{CellError, CellResult};

/// 组合 [`InstanceSource`] 和 [`FlowFieldGenerator`] 构建 4 通道训练目标.
#[derive(Debug, Clone)]
pub struct TargetBuilder<S, G> {
    source: S,
    generator: G,
}

impl<S: InstanceSource, G: FlowFieldGenerator> TargetBuilder<S, G> {
    /// 初始化.
    #[inline]
    pub fn new(source: S, generator: G) -> Self {
        Self { source, generator }
    }

    /// 实例来源.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// 为图像 `image_id` 构建训练目标.
    ///
    /// # 错误
    ///
    /// 1. 图像不存在: [`CellError::AnnotationNotFound`];
    /// 2. 图像没有实例标注: [`CellError::TargetUnavailable`].
    ///
    /// 以上两种情况都不是致命错误, 调用者应换一个样本重试
    /// (见 [`CellError::is_resamplable`]).
    pub fn build(&self, image_id: u64) -> CellResult<FlowTarget> {
        let inst = self.source.instance_masks(image_id)?;
        if inst.is_empty() {
            return Err(CellError::TargetUnavailable { id: image_id });
        }
        let labels = natural_encode(inst.shape, &inst.masks)?;
        self.generator
            .labels_to_flows(std::slice::from_ref(&labels))?
            .into_iter()
            .next()
            .ok_or(CellError::TargetUnavailable { id: image_id })
    }
}
