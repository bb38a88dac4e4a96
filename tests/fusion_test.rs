mod common;

use std::time::Duration;

use approx::assert_abs_diff_eq;
use rstest::{fixture, rstest};

use common::{ellipsoid_cloud, push_mag, push_static, tick_time};
use mag_fusion::{
    CalibrationRecord, FilterMode, FusionConfig, FusionContext, Matrix3x3, SensorKind, SolverTier, UnitQuaternion,
    Vector3,
};

const HARD_IRON: Vector3 = Vector3::new(1.0, 2.0, 3.0);

#[fixture]
fn config() -> FusionConfig {
    let mut config = FusionConfig::default();
    config.orchestrator.background_calibration = false;
    config
}

/// 全方位に回した地磁気を流し込んで較正させる
fn calibrate(ctx: &mut FusionContext) -> usize {
    let cloud = ellipsoid_cloud(250, 50.0, Matrix3x3::identity(), HARD_IRON);
    for (i, m) in cloud.into_iter().enumerate() {
        push_mag(ctx, m, Duration::from_micros(i as u64 * 100));
    }
    let k = 3;
    let _ = ctx.tick(tick_time(k));
    k
}

#[rstest]
fn end_to_end_calibrates_then_locks(config: FusionConfig) {
    let mut ctx = FusionContext::new(config).unwrap();
    let mut k = calibrate(&mut ctx);
    assert!(ctx.is_calibration_valid());
    let cal = ctx.get_calibration().unwrap();
    assert_eq!(cal.solver, SolverTier::Ten);
    assert_abs_diff_eq!(cal.offset, HARD_IRON, epsilon = 0.1);

    let truth = UnitQuaternion::from_euler_angles(0.0, 0.0, 30.0_f64.to_radians());
    for _ in 0..500 {
        k += 1;
        push_static(&mut ctx, &truth, HARD_IRON, tick_time(k));
        let output = ctx.tick(tick_time(k)).unwrap();
        assert_abs_diff_eq!(output.orientation.quaternion.norm(), 1.0, epsilon = 1e-6);
    }

    let orientation = ctx.get_orientation();
    assert_eq!(orientation.mode, FilterMode::Tracking);
    assert!(orientation.first_lock);
    assert!(orientation.quaternion.angle_to(&truth) < 1.0_f64.to_radians());
    assert_abs_diff_eq!(ctx.heading_degrees(), 330.0, epsilon = 1.0);

    let health = ctx.get_filter_health();
    assert!(health.stale.is_empty());
    assert!(!health.is_degraded());
    assert!(health.ensure_nominal().is_ok());
    assert!(health.calibration_valid);
    assert_eq!(health.last_calibration_failure, None);
}

#[rstest]
fn calibration_after_alignment_corrects_heading(config: FusionConfig) {
    let hard_iron = Vector3::new(20.0, -15.0, 10.0);
    let truth = UnitQuaternion::identity();
    let mut ctx = FusionContext::new(config).unwrap();

    // 未較正の地磁気でアライメントすると方位がずれる
    let mut k = 0;
    for _ in 0..30 {
        k += 1;
        push_static(&mut ctx, &truth, hard_iron, tick_time(k));
        ctx.tick(tick_time(k)).unwrap();
    }
    assert_eq!(ctx.get_orientation().mode, FilterMode::Tracking);
    assert!(ctx.get_orientation().quaternion.angle_to(&truth) > 5.0_f64.to_radians());

    // 機体を回して全方位の地磁気を集める
    let cloud = ellipsoid_cloud(250, 48.0, Matrix3x3::identity(), hard_iron);
    for (i, m) in cloud.into_iter().enumerate() {
        push_mag(&mut ctx, m, tick_time(k) + Duration::from_micros(10 * (i as u64 + 1)));
    }
    k += 1;
    let _ = ctx.tick(tick_time(k));
    let cal = ctx.get_calibration().unwrap();
    assert_abs_diff_eq!(cal.offset, hard_iron, epsilon = 0.1);

    for _ in 0..300 {
        k += 1;
        push_static(&mut ctx, &truth, hard_iron, tick_time(k));
        ctx.tick(tick_time(k)).unwrap();
    }
    let orientation = ctx.get_orientation();
    assert_eq!(orientation.mode, FilterMode::Tracking);
    assert!(orientation.quaternion.angle_to(&truth) < 1.0_f64.to_radians());
}

#[rstest]
fn calibration_reads_are_stable_between_ticks(config: FusionConfig) {
    let mut ctx = FusionContext::new(config).unwrap();
    assert_eq!(ctx.get_calibration(), None);
    calibrate(&mut ctx);
    assert_eq!(ctx.get_calibration(), ctx.get_calibration());
}

#[rstest]
fn held_still_startup_records_failure(config: FusionConfig) {
    let mut ctx = FusionContext::new(config).unwrap();
    let truth = UnitQuaternion::identity();
    for k in 1..=200 {
        push_static(&mut ctx, &truth, HARD_IRON, tick_time(k));
        let _ = ctx.tick(tick_time(k));
    }

    let health = ctx.get_filter_health();
    assert!(!ctx.is_calibration_valid());
    assert!(health.last_calibration_failure.is_some());
    // 較正できなくてもフィルタは動き続ける
    assert_eq!(ctx.get_orientation().mode, FilterMode::Tracking);
}

#[rstest]
fn dropped_channel_goes_stale_and_recovers(config: FusionConfig) {
    let mut ctx = FusionContext::new(config).unwrap();
    let truth = UnitQuaternion::identity();
    let mut k = 0;
    for _ in 0..100 {
        k += 1;
        push_static(&mut ctx, &truth, Vector3::zeros(), tick_time(k));
        ctx.tick(tick_time(k)).unwrap();
    }

    // 加速度だけ止まる
    for _ in 0..100 {
        k += 1;
        ctx.push_sample(SensorKind::Gyroscope, 0, 0, 0, tick_time(k));
        ctx.tick(tick_time(k)).unwrap();
    }
    let health = ctx.get_filter_health();
    assert_eq!(health.stale, vec![SensorKind::Accelerometer, SensorKind::Magnetometer]);
    assert!(health.is_degraded());

    for _ in 0..10 {
        k += 1;
        push_static(&mut ctx, &truth, Vector3::zeros(), tick_time(k));
        ctx.tick(tick_time(k)).unwrap();
    }
    assert!(ctx.get_filter_health().stale.is_empty());
}

#[rstest]
fn buffer_overflow_is_reported_once_drained(config: FusionConfig) {
    let capacity = config.buffer.accel_capacity;
    let mut ctx = FusionContext::new(config).unwrap();
    for i in 0..capacity + 5 {
        ctx.push_sample(SensorKind::Accelerometer, 0, 0, 8192, Duration::from_millis(i as u64));
    }
    let accel = ctx.get_filter_health().buffer(SensorKind::Accelerometer);
    assert!(accel.overflow);
    assert_eq!(accel.overwritten, 5);
    assert!(ctx.drain_overflow(SensorKind::Accelerometer));
    assert!(!ctx.get_filter_health().buffer(SensorKind::Accelerometer).overflow);
}

#[rstest]
fn persisted_calibration_restores_exactly(config: FusionConfig) {
    let mut ctx = FusionContext::new(config.clone()).unwrap();
    calibrate(&mut ctx);
    let record = ctx.export_calibration();
    assert!(record.valid);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("magcal.json");
    record.save_to(&path).unwrap();
    let loaded = CalibrationRecord::load_from(&path).unwrap();
    assert_eq!(loaded, record);

    let mut restored = FusionContext::new(config).unwrap();
    restored.restore_calibration(&loaded);
    assert!(restored.is_calibration_valid());
    assert_eq!(restored.get_calibration(), ctx.get_calibration());
}
