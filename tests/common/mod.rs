#![allow(dead_code)]

use std::time::Duration;

use mag_fusion::kalman::FilterInput;
use mag_fusion::{FusionContext, Matrix3x3, SensorKind, UnitQuaternion, Vector3};

/// 融合周期 [s]
pub const DT: f64 = 0.01;

/// デフォルト設定の換算係数の逆数
pub const ACCEL_COUNTS_PER_G: f64 = 8192.0;
pub const MAG_COUNTS_PER_UT: f64 = 10.0;

/// 伏角60度，北向きの地磁気（NWU）
pub fn earth_field(strength: f64) -> Vector3 {
    let dip = 60.0_f64.to_radians();
    strength * Vector3::new(dip.cos(), 0.0, -dip.sin())
}

/// 球面上にほぼ一様に並ぶ単位ベクトル（フィボナッチ格子）
pub fn sphere_directions(n: usize) -> Vec<Vector3> {
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

/// 歪んだ地磁気計測値 s = W (B u) + V
pub fn ellipsoid_cloud(n: usize, field: f64, w: Matrix3x3, v: Vector3) -> Vec<Vector3> {
    sphere_directions(n).into_iter().map(|u| w * (field * u) + v).collect()
}

/// ほぼ一定の向きで静止したときの地磁気計測値
pub fn held_still_cloud(n: usize, field: Vector3) -> Vec<Vector3> {
    (0..n)
        .map(|i| {
            // 決定的な小さい揺らぎ
            let k = i as f64;
            field + 0.05 * Vector3::new((1.3 * k).sin(), (2.1 * k).cos(), (0.7 * k).sin())
        })
        .collect()
}

/// 姿勢 q で静止しているときの理想的な観測
pub fn static_input(q: &UnitQuaternion<f64>, mag_strength: f64) -> FilterInput {
    FilterInput {
        gyro: Some(Vector3::zeros()),
        accel: Some(q.inverse() * Vector3::z()),
        mag: Some(q.inverse() * earth_field(mag_strength)),
        dt: DT,
    }
}

fn counts(v: Vector3, per_unit: f64) -> (i32, i32, i32) {
    let c = v * per_unit;
    (c[0].round() as i32, c[1].round() as i32, c[2].round() as i32)
}

/// 地磁気 [uT] をカウント値にして取り込む
pub fn push_mag(ctx: &mut FusionContext, mag: Vector3, t: Duration) {
    let (x, y, z) = counts(mag, MAG_COUNTS_PER_UT);
    ctx.push_sample(SensorKind::Magnetometer, x, y, z, t);
}

/// 姿勢 q で静止しているときの一周期分のサンプルを取り込む
///
/// * hard_iron: 地磁気に加わるオフセット [uT]
pub fn push_static(ctx: &mut FusionContext, q: &UnitQuaternion<f64>, hard_iron: Vector3, t: Duration) {
    let (x, y, z) = counts(q.inverse() * Vector3::z(), ACCEL_COUNTS_PER_G);
    ctx.push_sample(SensorKind::Accelerometer, x, y, z, t);
    ctx.push_sample(SensorKind::Gyroscope, 0, 0, 0, t);
    push_mag(ctx, q.inverse() * earth_field(48.0) + hard_iron, t);
}

pub fn tick_time(k: usize) -> Duration {
    Duration::from_secs_f64(k as f64 * DT)
}
