//! 通用常量.

/// 派生文件的命名后缀.
pub mod suffix {
    /// 分割掩码输出文件后缀, `{stem}_cp_masks.{png|tif}`.
    pub const CP_MASKS: &str = "_cp_masks";

    /// 三联可视化图片后缀, `{stem}_cp_output.png`.
    pub const CP_OUTPUT: &str = "_cp_output";

    /// 轮廓文本后缀, `{stem}_cp_outlines.txt`.
    pub const CP_OUTLINES: &str = "_cp_outlines";

    /// 流场缓存后缀, `{stem}_flows.tif`.
    pub const FLOWS: &str = "_flows";

    /// 分割结果归档后缀, `{stem}_seg.npz`.
    pub const SEG: &str = "_seg";

    /// 默认的标签文件后缀.
    pub const DEFAULT_MASK_FILTER: &str = "_masks";

    /// 图像发现时始终排除的派生文件后缀 (另外还有用户给定的 `mask_filter`).
    pub const RESERVED: [&str; 3] = [CP_MASKS, CP_OUTPUT, FLOWS];
}

/// 会被当作图像收集的文件扩展名, 按搜索顺序排列.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

/// 推理模式目录下接受的图像扩展名.
pub const EVAL_EXTENSIONS: [&str; 3] = ["png", "tif", "jpg"];

/// 16 位标签的上限 (不含). 最大值达到该值时升级为 32 位.
pub const U16_LABEL_LIMIT: u64 = u16::MAX as u64;

/// 训练目标 (flow target) 的通道数.
pub const TARGET_CHANNELS: usize = 4;

/// 训练目标各通道的含义.
pub mod channel {
    /// 标签图 (natural encoding).
    pub const LABEL: usize = 0;

    /// 细胞概率.
    pub const CELL_PROB: usize = 1;

    /// 流场的行 (y) 分量.
    pub const FLOW_Y: usize = 2;

    /// 流场的列 (x) 分量.
    pub const FLOW_X: usize = 3;
}

/// 网络要求的空间尺寸因子. 推理时图像被补零到它的整数倍.
pub const DEFAULT_DIVISOR: usize = 16;

/// 训练时随机缩放的默认范围, 缩放因子在 `[1 - r/2, 1 + r/2]` 中选取.
pub const DEFAULT_SCALE_RANGE: f32 = 0.5;

/// 训练和推理时默认的通道选择: 细胞质取绿色通道, 细胞核取红色通道.
pub const DEFAULT_CHANNELS: [usize; 2] = [2, 1];

/// 可视化时掩码叠加的轮廓颜色.
pub const OUTLINE_RGB: [u8; 3] = [255, 0, 0];
