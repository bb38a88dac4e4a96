//! 4, 7, 10要素の楕円体フィッティング
//!
//! 地磁気計測値 s は，真の地磁気ベクトル m（|m| = B）に対して
//! s = W m + V（V: ハードアイアン，W: ソフトアイアン）と歪んでいると考える．
//! 点群に二次曲面を当てはめて V と補正行列 W^-1 を求め，
//! 較正値は m = W^-1 (s - V) で得る．W^-1 は対称正定値で det = 1 に正規化する．
//!
//! 参考文献
//! 1. j_rocket_boy, "球面フィッティングの導出と実装", 2018.
//!    (https://www.slideshare.net/j_rocket_boy/fitting-88311197)
//! 2. Mark Pedley, "Calibrating an eCompass in the Presence of Hard- and Soft-Iron Interference",
//!    Freescale Semiconductor Application Note AN4246, 2013.
//! 3. Qingde Li, John G. Griffiths, "Least Squares Ellipsoid Specific Fitting",
//!    Geometric Modeling and Processing, 2004.

use serde::{Deserialize, Serialize};

use crate::error::FitFailure;
use crate::{Matrix3x3, SMatrix, SVector, Vector3};

type Vector4 = SVector<f64, 4>;
type Vector7 = SVector<f64, 7>;
type Vector10 = SVector<f64, 10>;
type Matrix4x4 = SMatrix<f64, 4, 4>;
type Matrix7x7 = SMatrix<f64, 7, 7>;
type Matrix10x10 = SMatrix<f64, 10, 10>;

/// ソルバの段（未知数の個数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SolverTier {
    /// 球（ハードアイアンのみ）
    Four,
    /// 軸に沿った楕円体（対角スケール）
    Seven,
    /// 一般の楕円体
    Ten,
}

impl SolverTier {
    /// 低い段から順に
    pub const ALL: [SolverTier; 3] = [SolverTier::Four, SolverTier::Seven, SolverTier::Ten];

    pub fn elements(self) -> usize {
        match self {
            SolverTier::Four => 4,
            SolverTier::Seven => 7,
            SolverTier::Ten => 10,
        }
    }

    pub fn index(self) -> usize {
        match self {
            SolverTier::Four => 0,
            SolverTier::Seven => 1,
            SolverTier::Ten => 2,
        }
    }

    /// 一つ下の段
    pub fn lower(self) -> Option<SolverTier> {
        match self {
            SolverTier::Four => None,
            SolverTier::Seven => Some(SolverTier::Four),
            SolverTier::Ten => Some(SolverTier::Seven),
        }
    }

    /// 各段のフィッティングを実行する
    pub fn fit(self, samples: &[Vector3], bounds: &FitBounds) -> Result<EllipsoidFit, FitFailure> {
        match self {
            SolverTier::Four => fit_sphere(samples, bounds),
            SolverTier::Seven => fit_axis_aligned(samples, bounds),
            SolverTier::Ten => fit_general(samples, bounds),
        }
    }
}

/// 数値条件の上限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitBounds {
    /// 正規方程式の条件数（最大固有値/最小固有値）の上限
    pub max_condition: f64,
    /// 形状行列の固有値比の上限
    pub max_eigen_ratio: f64,
}

/// フィッティング結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipsoidFit {
    pub tier: SolverTier,
    /// ハードアイアン V [uT]
    pub offset: Vector3,
    /// ソフトアイアン補正行列 W^-1（対称正定値，det = 1）
    pub soft_iron: Matrix3x3,
    /// 全磁力 B [uT]
    pub field: f64,
}

/// 重心を引いてRMS半径で割った点群
///
/// 二乗項と定数項のスケールが揃わないと正規方程式の条件が悪くなるので，
/// フィッティングはこの正規化座標で行って最後に元に戻す．
struct Normalized {
    mean: Vector3,
    scale: f64,
    points: Vec<Vector3>,
}

fn normalize(samples: &[Vector3]) -> Result<Normalized, FitFailure> {
    if samples.is_empty() {
        return Err(FitFailure::TooFewSamples);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().fold(Vector3::zeros(), |acc, s| acc + s) / n;
    let scale = (samples.iter().map(|s| (s - mean).norm_squared()).sum::<f64>() / n).sqrt();
    if !scale.is_finite() || scale <= f64::EPSILON * mean.norm().max(1.0) {
        return Err(FitFailure::Singular);
    }

    let points = samples.iter().map(|s| (s - mean) / scale).collect();
    Ok(Normalized { mean, scale, points })
}

/// 点群の姿勢方向の拡がり
///
/// サンプル共分散の最小固有値の平方根を，サンプルのRMSノルムで割ったもの．
/// 全球を一様に覆えば 1/sqrt(3) 程度，静止していればノイズ程度になる．
pub fn angular_spread(samples: &[Vector3]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().fold(Vector3::zeros(), |acc, s| acc + s) / n;
    let mut cov = Matrix3x3::zeros();
    for s in samples {
        let d = s - mean;
        cov += d * d.transpose();
    }
    cov /= n;

    let rms = (samples.iter().map(|s| s.norm_squared()).sum::<f64>() / n).sqrt();
    if !(rms > 0.0) {
        return 0.0;
    }
    let min_eigen = cov
        .symmetric_eigenvalues()
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min)
        .max(0.0);
    min_eigen.sqrt() / rms
}

/// 正規方程式の行列（対称）の条件数を確認する
fn check_condition(eigenvalues: &[f64], max_condition: f64) -> Result<(), FitFailure> {
    let min = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(min > 0.0 && max.is_finite()) || max / min > max_condition {
        return Err(FitFailure::Singular);
    }
    Ok(())
}

/// 最小固有値の番号を返す
///
/// 解は最小固有値に対応する固有ベクトル（ほぼ零空間）として求めるので，
/// 二番目に小さい固有値まで潰れていると解が一意に決まらない．
fn null_direction(eigenvalues: &[f64], max_condition: f64) -> Result<usize, FitFailure> {
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&i, &j| eigenvalues[i].total_cmp(&eigenvalues[j]));

    let largest = eigenvalues[order[order.len() - 1]];
    let second = eigenvalues[order[1]];
    if !(largest.is_finite() && largest > 0.0) || second <= largest / max_condition {
        return Err(FitFailure::Singular);
    }
    Ok(order[0])
}

/// 形状行列 A と中心から較正パラメータを組み立てる
///
/// (p - c)^T A (p - c) = k を det(A') = 1 となるよう A' = A / det(A)^(1/3) に直すと，
/// 右辺が B^2 になる．W^-1 は A' の対称平方根．
fn assemble(
    tier: SolverTier,
    norm: &Normalized,
    shape: Matrix3x3,
    center: Vector3,
    k: f64,
    bounds: &FitBounds,
) -> Result<EllipsoidFit, FitFailure> {
    // 固有値分解
    let eigen = shape.symmetric_eigen();
    let u: Matrix3x3 = eigen.eigenvectors;
    let s_diag: Vector3 = eigen.eigenvalues;

    let min = s_diag.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = s_diag.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(min > 0.0) || !(k > 0.0) {
        return Err(FitFailure::NotPositiveDefinite);
    }
    if max / min > bounds.max_eigen_ratio {
        return Err(FitFailure::Eccentric);
    }

    let gain = (s_diag[0] * s_diag[1] * s_diag[2]).cbrt();
    let mut w = Matrix3x3::zeros();
    for i in 0..3 {
        w[(i, i)] = (s_diag[i] / gain).sqrt();
    }
    let soft_iron = u * w * u.transpose();
    let field = norm.scale * (k / gain).sqrt();
    let offset = norm.mean + norm.scale * center;

    if !(field.is_finite() && offset.iter().all(|v| v.is_finite())) {
        return Err(FitFailure::Singular);
    }

    Ok(EllipsoidFit { tier, offset, soft_iron, field })
}

/// 4要素：球面フィッティング
///
/// x^2 + y^2 + z^2 + a x + b y + c z + d = 0 の係数を最小二乗で求める（Ref.1）．
pub fn fit_sphere(samples: &[Vector3], bounds: &FitBounds) -> Result<EllipsoidFit, FitFailure> {
    let norm = normalize(samples)?;

    let mut a = Matrix4x4::zeros();
    let mut b = Vector4::zeros();
    for p in &norm.points {
        let x = p[0];
        let y = p[1];
        let z = p[2];

        let x2 = x * x;
        let y2 = y * y;
        let z2 = z * z;

        a[(0, 0)] += x2;
        a[(0, 1)] += x * y;
        a[(0, 2)] += x * z;
        a[(0, 3)] += x;
        a[(1, 1)] += y2;
        a[(1, 2)] += y * z;
        a[(1, 3)] += y;
        a[(2, 2)] += z2;
        a[(2, 3)] += z;
        a[(3, 3)] += 1.0;

        let tmp = x2 + y2 + z2;
        b[0] += x * tmp;
        b[1] += y * tmp;
        b[2] += z * tmp;
        b[3] += tmp;
    }

    // 下三角行列の式は上三角行列と同じ
    for i in 1..4 {
        for j in 0..i {
            a[(i, j)] = a[(j, i)];
        }
    }
    b = -b;

    check_condition(a.symmetric_eigenvalues().as_slice(), bounds.max_condition)?;
    let x = a.cholesky().ok_or(FitFailure::Singular)?.solve(&b);

    let center = Vector3::new(-0.5 * x[0], -0.5 * x[1], -0.5 * x[2]);
    let r2 = center.norm_squared() - x[3];
    assemble(SolverTier::Four, &norm, Matrix3x3::identity(), center, r2, bounds)
}

/// 7要素：軸に沿った楕円体
///
/// a x^2 + b y^2 + c z^2 + d x + e y + f z + g = 0 の係数ベクトルを，
/// 正規方程式の最小固有値に対応する固有ベクトルとして求める（Ref.2）．
pub fn fit_axis_aligned(samples: &[Vector3], bounds: &FitBounds) -> Result<EllipsoidFit, FitFailure> {
    let norm = normalize(samples)?;

    let mut m = Matrix7x7::zeros();
    for p in &norm.points {
        let phi = Vector7::from([p[0] * p[0], p[1] * p[1], p[2] * p[2], p[0], p[1], p[2], 1.0]);
        m += phi * phi.transpose();
    }

    let eigen = m.symmetric_eigen();
    let i = null_direction(eigen.eigenvalues.as_slice(), bounds.max_condition)?;
    let mut v: Vector7 = eigen.eigenvectors.column(i).into_owned();
    // 固有ベクトルの符号は任意なので二次の係数が正になる向きに揃える
    if v[0] + v[1] + v[2] < 0.0 {
        v = -v;
    }

    let mut shape = Matrix3x3::zeros();
    let mut center = Vector3::zeros();
    for axis in 0..3 {
        if !(v[axis] > 0.0) {
            return Err(FitFailure::NotPositiveDefinite);
        }
        shape[(axis, axis)] = v[axis];
        center[axis] = -v[axis + 3] / (2.0 * v[axis]);
    }
    let k = (0..3).map(|axis| v[axis] * center[axis] * center[axis]).sum::<f64>() - v[6];

    assemble(SolverTier::Seven, &norm, shape, center, k, bounds)
}

/// 10要素：一般の楕円体
///
/// p^T A p + l^T p + j = 0（A は対称）を同様に固有ベクトルとして求め，
/// 中心 c = -A^-1 l / 2 を取り出す（Ref.3）．
pub fn fit_general(samples: &[Vector3], bounds: &FitBounds) -> Result<EllipsoidFit, FitFailure> {
    let norm = normalize(samples)?;

    let mut m = Matrix10x10::zeros();
    for p in &norm.points {
        let x = p[0];
        let y = p[1];
        let z = p[2];
        let phi = Vector10::from([
            x * x,
            y * y,
            z * z,
            2.0 * x * y,
            2.0 * x * z,
            2.0 * y * z,
            x,
            y,
            z,
            1.0,
        ]);
        m += phi * phi.transpose();
    }

    let eigen = m.symmetric_eigen();
    let i = null_direction(eigen.eigenvalues.as_slice(), bounds.max_condition)?;
    let mut v: Vector10 = eigen.eigenvectors.column(i).into_owned();
    if v[0] + v[1] + v[2] < 0.0 {
        v = -v;
    }

    let shape = Matrix3x3::new(
        v[0], v[3], v[4],
        v[3], v[1], v[5],
        v[4], v[5], v[2],
    );
    let l = Vector3::new(v[6], v[7], v[8]);
    let center = -0.5 * shape.cholesky().ok_or(FitFailure::NotPositiveDefinite)?.solve(&l);
    let k = center.dot(&(shape * center)) - v[9];

    assemble(SolverTier::Ten, &norm, shape, center, k, bounds)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    pub(crate) const BOUNDS: FitBounds = FitBounds {
        max_condition: 1.0e12,
        max_eigen_ratio: 4.0,
    };

    /// 球面上にほぼ一様に並ぶ単位ベクトル（フィボナッチ格子）
    pub(crate) fn sphere_directions(n: usize) -> Vec<Vector3> {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        (0..n)
            .map(|i| {
                let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - z * z).sqrt();
                let theta = golden * i as f64;
                Vector3::new(r * theta.cos(), r * theta.sin(), z)
            })
            .collect()
    }

    /// s = W (B u) + V
    pub(crate) fn distorted(n: usize, field: f64, w: Matrix3x3, v: Vector3) -> Vec<Vector3> {
        sphere_directions(n).into_iter().map(|u| w * (field * u) + v).collect()
    }

    fn skewed_soft_iron() -> Matrix3x3 {
        let r = Rotation3::from_euler_angles(0.3, -0.2, 0.7).into_inner();
        let d = Matrix3x3::from_diagonal(&Vector3::new(1.15, 0.95, 1.0 / (1.15 * 0.95)));
        r * d * r.transpose()
    }

    #[test]
    fn sphere_recovers_offset_and_radius() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let samples = distorted(200, 50.0, Matrix3x3::identity(), v);
        let fit = fit_sphere(&samples, &BOUNDS).unwrap();
        assert_eq!(fit.tier, SolverTier::Four);
        assert_relative_eq!(fit.offset, v, epsilon = 1e-9);
        assert_relative_eq!(fit.field, 50.0, epsilon = 1e-9);
        assert_relative_eq!(fit.soft_iron, Matrix3x3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn axis_aligned_recovers_diagonal_scale() {
        let w = Matrix3x3::from_diagonal(&Vector3::new(1.2, 1.0 / 1.2, 1.0));
        let v = Vector3::new(-12.0, 4.0, 30.0);
        let samples = distorted(300, 45.0, w, v);
        let fit = fit_axis_aligned(&samples, &BOUNDS).unwrap();
        assert_relative_eq!(fit.offset, v, epsilon = 1e-6);
        assert_relative_eq!(fit.field, 45.0, epsilon = 1e-6);
        assert_relative_eq!(fit.soft_iron * w, Matrix3x3::identity(), epsilon = 1e-6);
    }

    #[test]
    fn general_recovers_skewed_soft_iron() {
        let w = skewed_soft_iron();
        let v = Vector3::new(8.0, -15.0, 2.5);
        let samples = distorted(400, 50.0, w, v);
        let fit = fit_general(&samples, &BOUNDS).unwrap();
        assert_relative_eq!(fit.offset, v, epsilon = 1e-6);
        assert_relative_eq!(fit.field, 50.0, epsilon = 1e-6);
        assert_relative_eq!(fit.soft_iron * w, Matrix3x3::identity(), epsilon = 1e-6);
        assert_relative_eq!(fit.soft_iron, fit.soft_iron.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn general_rejects_eccentric_ellipsoid() {
        let w = Matrix3x3::from_diagonal(&Vector3::new(3.0, 1.0, 1.0 / 3.0));
        let samples = distorted(400, 50.0, w, Vector3::zeros());
        assert_eq!(fit_general(&samples, &BOUNDS), Err(FitFailure::Eccentric));
    }

    #[test]
    fn planar_ring_is_singular_for_the_sphere_fit() {
        let samples: Vec<Vector3> = (0..90)
            .map(|i| {
                let t = i as f64 * std::f64::consts::TAU / 90.0;
                Vector3::new(40.0 * t.cos(), 40.0 * t.sin(), 0.0)
            })
            .collect();
        assert_eq!(fit_sphere(&samples, &BOUNDS), Err(FitFailure::Singular));
    }

    #[test]
    fn identical_samples_cannot_be_normalized() {
        let samples = vec![Vector3::new(20.0, 5.0, -30.0); 64];
        assert_eq!(fit_general(&samples, &BOUNDS), Err(FitFailure::Singular));
    }

    #[test]
    fn spread_separates_sphere_from_still_device() {
        let sphere = distorted(200, 50.0, Matrix3x3::identity(), Vector3::new(1.0, 2.0, 3.0));
        assert!(angular_spread(&sphere) > 0.5);

        let still: Vec<Vector3> = (0..200)
            .map(|i| Vector3::new(30.0, -5.0, 38.0) + 0.05 * Vector3::new((i as f64).sin(), (1.7 * i as f64).cos(), (0.3 * i as f64).sin()))
            .collect();
        assert!(angular_spread(&still) < 0.01);
    }
}
