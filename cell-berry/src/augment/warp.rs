//! 训练时的随机仿射变换: 缩放, 旋转, 水平翻转.
//!
//! 图像与目标共享同一组参数; 目标最后两个通道视为流场向量, 会随之旋转和翻转.

use super::check_spatial;
use crate::flow::FlowTarget;
use crate::CellResult;
use ndarray::{Array3, ArrayView3, Axis};
use rand::Rng;
use std::f64::consts::PI;

/// 一次随机变换的参数.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpParams {
    /// 旋转角 (弧度), `[0, 2π)`.
    pub theta: f64,

    /// 缩放系数, `[1 - r/2, 1 + r/2)`.
    pub scale: f64,

    /// 是否先做水平翻转.
    pub flip: bool,
}

impl WarpParams {
    /// 恒等变换.
    pub const IDENTITY: Self = Self {
        theta: 0.0,
        scale: 1.0,
        flip: false,
    };

    /// 按缩放幅度 `scale_range` 抽取一组参数.
    pub fn draw<R: Rng + ?Sized>(rng: &mut R, scale_range: f32) -> Self {
        let r = f64::from(scale_range.max(0.0));
        let u: f64 = rng.gen_range(0.0..1.0);
        Self {
            scale: 1.0 - r / 2.0 + r * u,
            theta: rng.gen_range(0.0..2.0 * PI),
            flip: rng.gen_bool(0.5),
        }
    }

    /// 输出的空间形状: 每一维 `max(1, floor(L * scale))`.
    pub fn output_shape(&self, (ly, lx): (usize, usize)) -> (usize, usize) {
        let f = |l: usize| ((l as f64 * self.scale).floor() as usize).max(1);
        (f(ly), f(lx))
    }
}

/// 双线性采样, 超出 `[0, L - 1]` 的部分按 0 处理.
fn bilinear(plane: ndarray::ArrayView2<f32>, y: f64, x: f64) -> f32 {
    let (h, w) = plane.dim();
    let (y0, x0) = (y.floor(), x.floor());
    let (fy, fx) = ((y - y0) as f32, (x - x0) as f32);
    let at = |yy: f64, xx: f64| -> f32 {
        if yy < 0.0 || xx < 0.0 || yy >= h as f64 || xx >= w as f64 {
            0.0
        } else {
            plane[(yy as usize, xx as usize)]
        }
    };
    let (v00, v01) = (at(y0, x0), at(y0, x0 + 1.0));
    let (v10, v11) = (at(y0 + 1.0, x0), at(y0 + 1.0, x0 + 1.0));
    let top = v00 + (v01 - v00) * fx;
    let bottom = v10 + (v11 - v10) * fx;
    top + (bottom - top) * fy
}

/// 用同一组参数变换 `img` (`C x Ly x Lx`) 与 `target` (`Ct x Ly x Lx`).
///
/// `target` 的最后两个通道视为 (行, 列) 流场分量. 空间形状不一致时返回
/// [`crate::CellError::ShapeMismatch`].
pub fn warp_pair(
    img: ArrayView3<f32>,
    target: ArrayView3<f32>,
    params: WarpParams,
) -> CellResult<(Array3<f32>, Array3<f32>)> {
    check_spatial(img, target)?;
    let (ci, ly, lx) = img.dim();
    let ct = target.dim().0;
    let (oy, ox) = params.output_shape((ly, lx));

    let (cy, cx) = ((ly as f64 - 1.0) / 2.0, (lx as f64 - 1.0) / 2.0);
    let (ocy, ocx) = ((oy as f64 - 1.0) / 2.0, (ox as f64 - 1.0) / 2.0);
    let (sin, cos) = params.theta.sin_cos();

    let mut out_img = Array3::<f32>::zeros((ci, oy, ox));
    let mut out_tgt = Array3::<f32>::zeros((ct, oy, ox));
    for y in 0..oy {
        for x in 0..ox {
            let (dy, dx) = ((y as f64 - ocy) / params.scale, (x as f64 - ocx) / params.scale);
            let sy = cy + cos * dy + sin * dx;
            let mut sx = cx - sin * dy + cos * dx;
            if params.flip {
                sx = lx as f64 - 1.0 - sx;
            }
            for (c, plane) in img.axis_iter(Axis(0)).enumerate() {
                out_img[(c, y, x)] = bilinear(plane, sy, sx);
            }
            for (c, plane) in target.axis_iter(Axis(0)).enumerate() {
                out_tgt[(c, y, x)] = bilinear(plane, sy, sx);
            }
        }
    }

    // 流场向量跟随变换: 先翻转列分量, 再旋转
    if ct >= 2 {
        let (fy_c, fx_c) = (ct - 2, ct - 1);
        let (s, c) = (sin as f32, cos as f32);
        for y in 0..oy {
            for x in 0..ox {
                let vy = out_tgt[(fy_c, y, x)];
                let mut vx = out_tgt[(fx_c, y, x)];
                if params.flip {
                    vx = -vx;
                }
                out_tgt[(fy_c, y, x)] = c * vy - s * vx;
                out_tgt[(fx_c, y, x)] = s * vy + c * vx;
            }
        }
    }
    Ok((out_img, out_tgt))
}

/// 训练增强: 抽取随机参数并变换图像与目标.
///
/// 输出目标不含标签通道, 依次为概率, 行流场, 列流场.
pub fn random_rotate_and_resize<R: Rng + ?Sized>(
    img: ArrayView3<f32>,
    target: &FlowTarget,
    scale_range: f32,
    rng: &mut R,
) -> CellResult<(Array3<f32>, Array3<f32>)> {
    let params = WarpParams::draw(rng, scale_range);
    let reduced = target.without_labels();
    warp_pair(img, reduced.view(), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(c: usize, h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((c, h, w), |(k, y, x)| (k * 100 + y * 10 + x) as f32)
    }

    #[test]
    fn test_identity_keeps_everything() {
        let img = ramp(2, 6, 7);
        let tgt = ramp(3, 6, 7);
        let (i2, t2) = warp_pair(img.view(), tgt.view(), WarpParams::IDENTITY).unwrap();
        assert_eq!(i2, img);
        assert_eq!(t2, tgt);
    }

    #[test]
    fn test_flip_negates_column_flow() {
        let img = ramp(1, 3, 4);
        let mut tgt = Array3::<f32>::zeros((3, 3, 4));
        tgt.index_axis_mut(Axis(0), 2).fill(1.0);
        let params = WarpParams {
            flip: true,
            ..WarpParams::IDENTITY
        };
        let (i2, t2) = warp_pair(img.view(), tgt.view(), params).unwrap();
        assert_eq!(i2[(0, 1, 0)], img[(0, 1, 3)]);
        assert!(t2.index_axis(Axis(0), 2).iter().all(|&v| v == -1.0));
        assert!(t2.index_axis(Axis(0), 1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_quarter_turn_rotates_flow() {
        let img = Array3::<f32>::ones((1, 5, 5));
        let mut tgt = Array3::<f32>::zeros((3, 5, 5));
        tgt.index_axis_mut(Axis(0), 1).fill(1.0);
        let params = WarpParams {
            theta: PI / 2.0,
            ..WarpParams::IDENTITY
        };
        let (_, t2) = warp_pair(img.view(), tgt.view(), params).unwrap();
        // 中心像素: (1, 0) 旋转 90° 得 (0, 1)
        assert!(t2[(1, 2, 2)].abs() < 1e-5);
        assert!((t2[(2, 2, 2)] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shapes_follow_scale() {
        let img = ramp(2, 40, 30);
        let labels = ndarray::Array2::<u32>::zeros((40, 30));
        let target = crate::flow::FlowFieldGenerator::labels_to_flows(
            &crate::flow::CentroidFlows,
            &[labels],
        )
        .unwrap()
        .remove(0);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let params = WarpParams::draw(&mut StdRng::seed_from_u64(seed), 0.5);
            assert!(params.scale >= 0.75 && params.scale < 1.25);
            assert!((0.0..2.0 * PI).contains(&params.theta));

            let (i2, t2) = random_rotate_and_resize(img.view(), &target, 0.5, &mut rng).unwrap();
            let (oy, ox) = params.output_shape((40, 30));
            assert_eq!(i2.dim(), (2, oy, ox));
            assert_eq!(t2.dim(), (3, oy, ox));
        }
    }

    #[test]
    fn test_shapes_at_scale_bounds() {
        let img = ramp(2, 37, 23);
        let tgt = ramp(3, 37, 23);
        let r = 0.5;
        let cases = [
            (1.0 - r / 2.0, (27, 17)),
            (1.0 + r / 2.0 - f64::EPSILON, (46, 28)),
        ];
        for (scale, (oy, ox)) in cases {
            for (theta, flip) in [(0.0, false), (1.3, true), (2.0 * PI - 1e-9, false)] {
                let params = WarpParams { theta, scale, flip };
                let (i2, t2) = warp_pair(img.view(), tgt.view(), params).unwrap();
                assert_eq!(i2.shape()[1..], t2.shape()[1..]);
                assert_eq!(i2.shape(), &[2, oy, ox]);
                assert_eq!(t2.shape(), &[3, oy, ox]);
            }
        }
    }

    #[test]
    fn test_output_never_empty() {
        let tiny = WarpParams {
            scale: 0.1,
            ..WarpParams::IDENTITY
        };
        assert_eq!(tiny.output_shape((3, 2)), (1, 1));
        let img = ramp(1, 3, 2);
        let (i2, _) = warp_pair(img.view(), img.view(), tiny).unwrap();
        assert_eq!(i2.dim(), (1, 1, 1));
    }

    #[test]
    fn test_mismatched_target_rejected() {
        let img = ramp(1, 4, 4);
        let tgt = ramp(3, 4, 5);
        assert!(matches!(
            warp_pair(img.view(), tgt.view(), WarpParams::IDENTITY).unwrap_err(),
            CellError::ShapeMismatch { .. }
        ));
    }
}
