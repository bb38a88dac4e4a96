//! 姿勢推定カルマンフィルタ（乗法型EKF）
//!
//! 状態はクォータニオン q（機体座標 → 世界座標）とジャイロバイアス b．
//! 誤差状態 [δθ, δb]（δθ は機体座標の微小回転）の6x6共分散を伝播し，
//! 加速度（重力方向）と地磁気の方向ベクトルで補正する．
//! 世界座標は x: 北，y: 西，z: 上（NWU）で，静止時の加速度計は +z を指す．
//!
//! 参考文献
//! 1. F. Landis Markley, "Attitude Error Representations for Kalman Filtering",
//!    Journal of Guidance, Control, and Dynamics, Vol.26, No.2, 2003.
//! 2. Malcolm D. Shuster, S. D. Oh, "Three-Axis Attitude Determination from Vector Observations",
//!    Journal of Guidance and Control, Vol.4, No.1, 1981.

use nalgebra::{Rotation3, UnitQuaternion};
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::error::{FusionError, Result};
use crate::{Matrix3x3, SMatrix, SVector, Vector3};

type Vector6 = SVector<f64, 6>;
type Matrix3x6 = SMatrix<f64, 3, 6>;
type Matrix6x3 = SMatrix<f64, 6, 3>;
pub type Matrix6x6 = SMatrix<f64, 6, 6>;

/// 方向ベクトルとして扱える最小ノルム
const MIN_NORM: f64 = 1.0e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Uninitialized,
    /// 初期姿勢のために加速度と地磁気を平均している
    Aligning,
    Tracking,
}

/// 一周期分の入力（較正済み）
///
/// どのセンサも欠けてよい．加速度が無い周期は予測のみになる．
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterInput {
    /// 角速度 [rad/s]
    pub gyro: Option<Vector3>,
    /// 加速度 [g]
    pub accel: Option<Vector3>,
    /// 較正済み地磁気 [uT]
    pub mag: Option<Vector3>,
    /// 前周期からの経過時間 [s]
    pub dt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterState {
    pub orientation: UnitQuaternion<f64>,
    /// ジャイロバイアス [rad/s]
    pub gyro_bias: Vector3,
    /// 誤差共分散 [δθ, δb]
    pub covariance: Matrix6x6,
    pub first_lock: bool,
}

impl FilterState {
    fn new(config: &FilterConfig, gyro_bias: Vector3) -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            gyro_bias,
            covariance: initial_covariance(config),
            first_lock: false,
        }
    }
}

fn initial_covariance(config: &FilterConfig) -> Matrix6x6 {
    let mut p = Matrix6x6::zeros();
    for i in 0..3 {
        p[(i, i)] = config.initial_attitude_var;
        p[(i + 3, i + 3)] = config.initial_bias_var;
    }
    p
}

/// フィルタの健全性
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterHealth {
    pub mode: FilterMode,
    /// 発散してリセットした（確認されるまで立ったまま）
    pub fault: bool,
    pub divergences: u32,
    pub covariance_trace: f64,
    /// 直近の加速度残差ノルム
    pub accel_residual: Option<f64>,
    /// 直近の地磁気残差ノルム
    pub mag_residual: Option<f64>,
    /// 直近の周期で外れ値として重みを下げた
    pub downweighted: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Alignment {
    accel_sum: Vector3,
    mag_sum: Vector3,
    accel_count: usize,
    mag_count: usize,
}

pub struct OrientationFilter {
    config: FilterConfig,
    mode: FilterMode,
    state: FilterState,
    /// 世界座標での地磁気の向き（単位ベクトル）
    mag_reference: Option<Vector3>,
    alignment: Alignment,
    last_gyro: Vector3,
    seeded_bias: Option<Vector3>,
    health: FilterHealth,
}

/// 歪対称行列 [v×]
fn skew(v: &Vector3) -> Matrix3x3 {
    v.cross_matrix()
}

impl OrientationFilter {
    pub fn new(config: FilterConfig) -> Self {
        let state = FilterState::new(&config, Vector3::zeros());
        let health = FilterHealth {
            mode: FilterMode::Uninitialized,
            fault: false,
            divergences: 0,
            covariance_trace: state.covariance.trace(),
            accel_residual: None,
            mag_residual: None,
            downweighted: false,
        };
        Self {
            config,
            mode: FilterMode::Uninitialized,
            state,
            mag_reference: None,
            alignment: Alignment::default(),
            last_gyro: Vector3::zeros(),
            seeded_bias: None,
            health,
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.state.orientation
    }

    pub fn health(&self) -> FilterHealth {
        self.health
    }

    pub fn mag_reference(&self) -> Option<Vector3> {
        self.mag_reference
    }

    /// 地磁気の基準方向を捨てる（較正値が変わったとき用）
    ///
    /// 追跡中なら方位も古い地磁気で決まっているので，ジャイロバイアスを残して
    /// アライメントからやり直す．
    pub fn forget_mag_reference(&mut self) {
        if self.mag_reference.take().is_some() {
            debug!("magnetic reference cleared");
        }
        self.alignment.mag_sum = Vector3::zeros();
        self.alignment.mag_count = 0;
        if self.mode == FilterMode::Tracking {
            self.seeded_bias.get_or_insert(self.state.gyro_bias);
            self.alignment = Alignment::default();
            self.set_mode(FilterMode::Aligning);
        }
    }

    /// 発散フラグを確認済みにする
    pub fn acknowledge_fault(&mut self) -> bool {
        std::mem::take(&mut self.health.fault)
    }

    /// 次のアライメントで使うジャイロバイアスを与える（保存値の復元用）
    pub fn seed_gyro_bias(&mut self, bias: Vector3) {
        self.seeded_bias = Some(bias);
        if self.mode == FilterMode::Uninitialized {
            self.state.gyro_bias = bias;
        }
    }

    /// 初期化前の状態に戻す
    pub fn reset(&mut self) {
        let bias = self.seeded_bias.unwrap_or_else(Vector3::zeros);
        self.state = FilterState::new(&self.config, bias);
        self.mag_reference = None;
        self.alignment = Alignment::default();
        self.last_gyro = Vector3::zeros();
        self.set_mode(FilterMode::Uninitialized);
    }

    fn set_mode(&mut self, mode: FilterMode) {
        if self.mode != mode {
            debug!(from = ?self.mode, to = ?mode, "orientation filter mode change");
        }
        self.mode = mode;
        self.health.mode = mode;
    }

    /// 一周期分の処理
    pub fn step(&mut self, input: &FilterInput) -> Result<FilterState> {
        self.health.downweighted = false;
        self.health.accel_residual = None;
        self.health.mag_residual = None;
        if let Some(gyro) = input.gyro {
            self.last_gyro = gyro;
        }

        match self.mode {
            FilterMode::Uninitialized => {
                self.alignment = Alignment::default();
                self.set_mode(FilterMode::Aligning);
                self.accumulate_alignment(input);
            }
            FilterMode::Aligning => self.accumulate_alignment(input),
            FilterMode::Tracking => {
                self.predict(input.dt);
                if let Some(accel) = input.accel {
                    self.update(accel, input.mag);
                }
            }
        }

        self.check_health()?;
        Ok(self.state)
    }

    fn accumulate_alignment(&mut self, input: &FilterInput) {
        let a = &mut self.alignment;
        // 地磁気は加速度と同じ周期のものだけ使う
        if let Some(accel) = input.accel.and_then(|v| v.try_normalize(MIN_NORM)) {
            a.accel_sum += accel;
            a.accel_count += 1;
            if let Some(mag) = input.mag.and_then(|v| v.try_normalize(MIN_NORM)) {
                a.mag_sum += mag;
                a.mag_count += 1;
            }
        }
        if a.accel_count < self.config.align_samples {
            return;
        }

        let up = a.accel_sum / a.accel_count as f64;
        let mag = (a.mag_count > 0).then(|| a.mag_sum / a.mag_count as f64);
        match triad(up, mag) {
            Some(orientation) => {
                self.state.orientation = orientation;
                self.state.covariance = initial_covariance(&self.config);
                if let Some(bias) = self.seeded_bias.take() {
                    self.state.gyro_bias = bias;
                }
                self.mag_reference = mag.and_then(|m| north_reference(&(orientation * m)));
                self.set_mode(FilterMode::Tracking);
                info!(
                    magnetic = self.mag_reference.is_some(),
                    heading = self.heading_degrees(),
                    "orientation filter aligned"
                );
            }
            None => {
                warn!("alignment vectors are degenerate, restarting alignment");
            }
        }
        self.alignment = Alignment::default();
    }

    /// 予測ステップ
    fn predict(&mut self, dt: f64) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }
        let omega = self.last_gyro - self.state.gyro_bias;

        // クォータニオンの積分
        let dq = UnitQuaternion::from_scaled_axis(omega * dt);
        self.state.orientation = self.state.orientation * dq;

        // 状態遷移行列
        let mut phi = Matrix6x6::identity();
        let rot = Rotation3::from_scaled_axis(-omega * dt);
        phi.fixed_view_mut::<3, 3>(0, 0).copy_from(rot.matrix());
        phi.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-dt * Matrix3x3::identity()));

        let mut q = Matrix6x6::zeros();
        for i in 0..3 {
            q[(i, i)] = self.config.gyro_noise * dt;
            q[(i + 3, i + 3)] = self.config.bias_walk * dt;
        }

        self.state.covariance = phi * self.state.covariance * phi.transpose() + q;
        self.symmetrization();
        self.renormalize();
    }

    /// 観測更新
    fn update(&mut self, accel: Vector3, mag: Option<Vector3>) {
        let up = Vector3::z();
        let accel_residual = self.correct(up, accel, self.config.accel_noise);
        self.health.accel_residual = accel_residual;

        let mag = mag.and_then(|m| m.try_normalize(MIN_NORM));
        let mag_residual = match (self.mag_reference, mag) {
            (Some(reference), Some(m)) => self.correct(reference, m, self.config.mag_noise),
            (None, Some(m)) => {
                // アライメント時に地磁気が無かった場合は最初の観測から伏角だけ取る．
                // 方位は以降の補正で北に合わせる．
                self.mag_reference = north_reference(&(self.state.orientation * m));
                None
            }
            _ => None,
        };
        self.health.mag_residual = mag_residual;

        if !self.state.first_lock {
            if let (Some(ra), Some(rm)) = (accel_residual, mag_residual) {
                if ra < self.config.lock_residual && rm < self.config.lock_residual {
                    self.state.first_lock = true;
                    info!(accel_residual = ra, mag_residual = rm, "orientation filter first lock");
                }
            }
        }
    }

    /// 方向ベクトル一つ分の補正．戻り値は残差ノルム．
    ///
    /// * reference: 世界座標での向き（単位ベクトル）
    /// * measured: 機体座標での計測値
    fn correct(&mut self, reference: Vector3, measured: Vector3, noise_var: f64) -> Option<f64> {
        let z = measured.try_normalize(MIN_NORM)?;
        let predicted = self.state.orientation.inverse() * reference;
        let residual = z - predicted;
        let residual_norm = residual.norm();

        // 外れ値は棄却せず観測ノイズを膨らませる
        let mut r_var = noise_var;
        if residual_norm > self.config.outlier_bound {
            let ratio = residual_norm / self.config.outlier_bound;
            r_var *= ratio * ratio;
            self.health.downweighted = true;
        }
        let r = Matrix3x3::identity() * r_var;

        let mut h = Matrix3x6::zeros();
        h.fixed_view_mut::<3, 3>(0, 0).copy_from(&skew(&predicted));

        let p = self.state.covariance;
        let s = h * p * h.transpose() + r;
        let s_inv = s.try_inverse()?;
        let gain: Matrix6x3 = p * h.transpose() * s_inv;

        let dx: Vector6 = gain * residual;
        let dtheta = Vector3::new(dx[0], dx[1], dx[2]);
        let dbias = Vector3::new(dx[3], dx[4], dx[5]);
        self.state.orientation = self.state.orientation * UnitQuaternion::from_scaled_axis(dtheta);
        self.state.gyro_bias += dbias;

        // Joseph形式で共分散を更新
        let i_kh = Matrix6x6::identity() - gain * h;
        self.state.covariance = i_kh * p * i_kh.transpose() + gain * r * gain.transpose();
        self.symmetrization();
        self.renormalize();

        Some(residual_norm)
    }

    /// 誤差共分散行列を強制的に対称化する
    ///
    /// 数値計算誤差で徐々に共分散行列の対称性が失われていくので毎周期実行する．
    fn symmetrization(&mut self) {
        let p = &mut self.state.covariance;
        for i in 1..6 {
            for j in 0..i {
                let v = 0.5 * (p[(i, j)] + p[(j, i)]);
                p[(i, j)] = v;
                p[(j, i)] = v;
            }
        }
    }

    fn renormalize(&mut self) {
        self.state.orientation = UnitQuaternion::new_normalize(self.state.orientation.into_inner());
    }

    fn check_health(&mut self) -> Result<()> {
        let p = &self.state.covariance;
        let trace = p.trace();
        self.health.covariance_trace = trace;

        let diverged = !p.iter().all(|v| v.is_finite())
            || (0..6).any(|i| p[(i, i)] < 0.0)
            || !self.state.orientation.coords.iter().all(|v| v.is_finite())
            || trace > self.config.divergence_trace;
        if diverged {
            warn!(trace, "orientation filter diverged, resetting");
            self.health.fault = true;
            self.health.divergences += 1;
            self.reset();
            return Err(FusionError::FilterDivergence { trace });
        }

        let attitude_trace = p[(0, 0)] + p[(1, 1)] + p[(2, 2)];
        if self.mode == FilterMode::Tracking && attitude_trace > self.config.realign_trace {
            warn!(attitude_trace, "orientation confidence collapsed, realigning");
            self.seeded_bias.get_or_insert(self.state.gyro_bias);
            self.alignment = Alignment::default();
            self.set_mode(FilterMode::Aligning);
        }
        Ok(())
    }

    /// コンパス方位 [deg]（北から時計回り，0〜360）
    pub fn heading_degrees(&self) -> f64 {
        let forward = self.state.orientation * Vector3::x();
        let heading = (-forward[1]).atan2(forward[0]).to_degrees();
        if heading < 0.0 {
            heading + 360.0
        } else {
            heading
        }
    }

    /// (roll, pitch) [deg]
    pub fn tilt_degrees(&self) -> (f64, f64) {
        let (roll, pitch, _) = self.state.orientation.euler_angles();
        (roll.to_degrees(), pitch.to_degrees())
    }
}

/// 重力と地磁気の2ベクトルから姿勢を決める（TRIAD）
///
/// 地磁気が無いときは機体x軸の水平成分を北とみなす．
/// 世界座標の地磁気を北（+x）と鉛直の成分に直した単位ベクトル
fn north_reference(world: &Vector3) -> Option<Vector3> {
    let horizontal = (world[0] * world[0] + world[1] * world[1]).sqrt();
    Vector3::new(horizontal, 0.0, world[2]).try_normalize(MIN_NORM)
}

fn triad(up_body: Vector3, mag_body: Option<Vector3>) -> Option<UnitQuaternion<f64>> {
    let up = up_body.try_normalize(MIN_NORM)?;
    let reference = mag_body
        .filter(|m| up.cross(m).norm() > 1.0e-3 * m.norm())
        .unwrap_or_else(|| if up.cross(&Vector3::x()).norm() > 0.1 { Vector3::x() } else { Vector3::y() });

    // 機体座標で表した世界座標の各軸
    let west = up.cross(&reference).try_normalize(MIN_NORM)?;
    let north = west.cross(&up);
    let world_in_body = Rotation3::from_basis_unchecked(&[north, west, up]);
    Some(UnitQuaternion::from_rotation_matrix(&world_in_body.inverse()))
}
