//! 融合周期の駆動
//!
//! `FusionContext` がバッファ・地磁気較正・姿勢フィルタを所有し，外部からは
//! ここの関数を通してだけ触る．較正ソルバは別スレッドで走らせ，結果はチャネルで
//! 受け取るので，較正中もフィルタの周期は止まらない．

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use nalgebra::UnitQuaternion;
use tracing::{debug, info, warn};

use crate::buffer::{BufferHealth, SampleBuffers, SensorKind, SensorSample};
use crate::config::FusionConfig;
use crate::ellipsoid::angular_spread;
use crate::error::{FitFailure, FusionError, Result};
use crate::kalman::{FilterHealth, FilterInput, FilterMode, OrientationFilter};
use crate::magcal::{CancelToken, Calibration, MagCalSolver, MagneticCalibration, SolveReport};
use crate::storage::CalibrationRecord;
use crate::Vector3;

/// 姿勢の出力
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub quaternion: UnitQuaternion<f64>,
    pub first_lock: bool,
    pub mode: FilterMode,
}

/// フィルタとバッファと較正の健全性
#[derive(Debug, Clone, PartialEq)]
pub struct FusionHealth {
    pub filter: FilterHealth,
    /// 古くなったチャンネル
    pub stale: Vec<SensorKind>,
    /// SensorKind::ALL の順
    pub buffers: [BufferHealth; 3],
    pub calibration_valid: bool,
    pub calibration_in_progress: bool,
    /// 直近の較正失敗理由（成功で消える）
    pub last_calibration_failure: Option<FitFailure>,
}

impl FusionHealth {
    pub fn buffer(&self, kind: SensorKind) -> BufferHealth {
        self.buffers[slot(kind)]
    }

    pub fn is_degraded(&self) -> bool {
        self.filter.fault || !self.stale.is_empty()
    }

    /// 異常があれば最初の一つをエラーとして返す
    pub fn ensure_nominal(&self) -> Result<()> {
        if self.filter.fault {
            return Err(FusionError::FilterDivergence { trace: self.filter.covariance_trace });
        }
        if let Some(kind) = self.stale.first() {
            return Err(FusionError::StaleInput(*kind));
        }
        Ok(())
    }
}

/// 一周期分の出力
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutput {
    pub timestamp: Duration,
    pub orientation: Orientation,
    /// コンパス方位 [deg]
    pub heading: f64,
    /// この周期にフィルタへ入れた較正済み地磁気 [uT]
    pub calibrated_mag: Option<Vector3>,
}

/// 別スレッドで走っている較正
struct CalibrationJob {
    generation: u64,
    cancel: CancelToken,
    receiver: Receiver<SolveReport>,
}

pub struct FusionContext {
    config: FusionConfig,
    buffers: SampleBuffers,
    magcal: MagneticCalibration,
    solver: Arc<MagCalSolver>,
    filter: OrientationFilter,
    job: Option<CalibrationJob>,
    last_tick: Option<Duration>,
    /// チャンネルごとに最後にフィルタへ渡したサンプルの時刻
    consumed: [Option<Duration>; 3],
    stale: [bool; 3],
    last_calibration_failure: Option<FitFailure>,
}

fn slot(kind: SensorKind) -> usize {
    match kind {
        SensorKind::Accelerometer => 0,
        SensorKind::Gyroscope => 1,
        SensorKind::Magnetometer => 2,
    }
}

fn average(samples: &[SensorSample]) -> Option<Vector3> {
    if samples.is_empty() {
        return None;
    }
    let sum = samples.iter().fold(Vector3::zeros(), |acc, s| acc + s.value());
    Some(sum / samples.len() as f64)
}

impl FusionContext {
    pub fn new(config: FusionConfig) -> Result<Self> {
        config.validate()?;
        let mut magcal = MagneticCalibration::new();
        if config.orchestrator.calibrate_on_startup {
            magcal.request();
        }
        Ok(Self {
            buffers: SampleBuffers::new(&config.buffer),
            solver: Arc::new(MagCalSolver::new(config.magcal.clone())),
            filter: OrientationFilter::new(config.filter.clone()),
            magcal,
            job: None,
            last_tick: None,
            consumed: [None; 3],
            stale: [false; 3],
            last_calibration_failure: None,
            config,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// センサの生カウント値を取り込む（ブロックしない）
    pub fn push_sample(&mut self, kind: SensorKind, x: i32, y: i32, z: i32, timestamp: Duration) {
        let channels = &self.config.channels;
        let counts = channels.coordinate_system.remap(kind, [x, y, z]);
        let scale = match kind {
            SensorKind::Accelerometer => channels.accel.scale,
            SensorKind::Gyroscope => channels.gyro.scale,
            SensorKind::Magnetometer => channels.mag.scale,
        };
        let sample = SensorSample::new(timestamp, counts, Vector3::from(scale));
        self.buffers.channel_mut(kind).record(sample);
    }

    /// 融合を一周期進める
    ///
    /// * now: 外部の単調時計の現在時刻
    pub fn tick(&mut self, now: Duration) -> Result<FusionOutput> {
        self.poll_calibration();
        if self.magcal.take_new_calibration().is_some() {
            // 較正前の値で覚えた地磁気の向きは捨てる
            self.filter.forget_mag_reference();
        }
        self.maybe_start_calibration(now);

        let dt = self
            .last_tick
            .map(|last| now.saturating_sub(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        // 周期の頭で較正値のスナップショットを取る
        let calibration = self.magcal.calibration();
        let accel = self.fresh(SensorKind::Accelerometer, now).and_then(|s| average(&s));
        let gyro = self.fresh(SensorKind::Gyroscope, now).and_then(|s| average(&s));
        let calibrated_mag = self
            .fresh(SensorKind::Magnetometer, now)
            .and_then(|s| s.last().map(|m| calibration.apply(m.value())));

        let input = FilterInput { gyro, accel, mag: calibrated_mag, dt };
        self.filter.step(&input)?;

        Ok(FusionOutput {
            timestamp: now,
            orientation: self.get_orientation(),
            heading: self.filter.heading_degrees(),
            calibrated_mag,
        })
    }

    /// 前回渡した以降のサンプルを取り出し，古さを判定する
    fn fresh(&mut self, kind: SensorKind, now: Duration) -> Option<Vec<SensorSample>> {
        let i = slot(kind);
        let buffer = self.buffers.channel(kind);

        let stale = match buffer.latest() {
            Some(latest) => now.saturating_sub(latest.timestamp) > self.config.orchestrator.stale_after(),
            None => true,
        };
        if stale != self.stale[i] {
            if stale {
                warn!(?kind, "sensor channel went stale");
            } else {
                info!(?kind, "sensor channel recovered");
            }
            self.stale[i] = stale;
        }
        if stale {
            return None;
        }

        let samples = match self.consumed[i] {
            Some(after) => buffer.since(after),
            None => buffer.latest().map(|s| vec![*s]).unwrap_or_default(),
        };
        let latest = samples.last()?;
        self.consumed[i] = Some(latest.timestamp);
        Some(samples)
    }

    /// 別スレッドの較正結果を受け取る
    fn poll_calibration(&mut self) {
        let Some(job) = &self.job else {
            return;
        };
        match job.receiver.try_recv() {
            Ok(report) => {
                let generation = job.generation;
                self.job = None;
                if let Err(e) = self.complete(generation, report) {
                    debug!(error = %e, "magnetic calibration finished without a new result");
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                warn!("magnetic calibration worker exited without a result");
                self.job = None;
                self.magcal.abandon();
                self.last_calibration_failure = Some(FitFailure::Abandoned);
            }
        }
    }

    fn complete(&mut self, generation: u64, report: SolveReport) -> Result<Calibration> {
        let result = self.magcal.finish(generation, report);
        self.last_calibration_failure = match &result {
            Ok(_) => None,
            Err(FusionError::InsufficientData { .. }) => Some(FitFailure::TooFewSamples),
            Err(FusionError::IllConditioned(reason)) => Some(*reason),
            Err(_) => Some(FitFailure::Abandoned),
        };
        result
    }

    /// 較正を始めるべきか判定する
    fn maybe_start_calibration(&mut self, now: Duration) {
        if self.magcal.is_in_progress() {
            return;
        }
        let magcal = &self.config.magcal;
        let mag = self.buffers.channel(SensorKind::Magnetometer);
        if mag.len() < magcal.min_samples[0] {
            return;
        }

        let since_last = self.magcal.last_attempt_at().map(|t| now.saturating_sub(t));
        let start = if self.magcal.is_requested() {
            true
        } else if !self.magcal.is_valid() {
            // 姿勢分布が足りるようになったら再挑戦
            since_last.map_or(true, |d| d >= magcal.retry_interval()) && {
                let window: Vec<Vector3> = mag.snapshot(magcal.window).iter().map(|s| s.value()).collect();
                angular_spread(&window) >= magcal.min_spread[0]
            }
        } else {
            since_last.map_or(true, |d| d >= magcal.refresh_interval())
        };

        if start {
            if let Err(e) = self.start_calibration(now) {
                warn!(error = %e, "failed to start magnetic calibration");
            }
        }
    }

    fn window(&self) -> Vec<Vector3> {
        self.buffers
            .channel(SensorKind::Magnetometer)
            .snapshot(self.config.magcal.window)
            .iter()
            .map(|s| s.value())
            .collect()
    }

    fn start_calibration(&mut self, now: Duration) -> Result<()> {
        let samples = self.window();
        let generation = self.magcal.begin(now);
        debug!(samples = samples.len(), generation, "starting magnetic calibration");

        if !self.config.orchestrator.background_calibration {
            let report = self.solver.solve(&samples, &CancelToken::new());
            if let Err(e) = self.complete(generation, report) {
                debug!(error = %e, "magnetic calibration finished without a new result");
            }
            return Ok(());
        }

        let cancel = CancelToken::new();
        let (sender, receiver) = bounded(1);
        let solver = Arc::clone(&self.solver);
        let token = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("magcal".into())
            .spawn(move || {
                let report = solver.solve(&samples, &token);
                // 受け手が居なくなっていたら結果は捨てる
                let _ = sender.send(report);
            });
        if let Err(e) = spawned {
            self.magcal.abandon();
            return Err(e.into());
        }
        self.job = Some(CalibrationJob { generation, cancel, receiver });
        Ok(())
    }

    /// バッファの現在の内容でその場で較正する（ブロックする）
    pub fn calibrate_now(&mut self, now: Duration) -> Result<Calibration> {
        self.abandon_calibration();
        let samples = self.window();
        let generation = self.magcal.begin(now);
        let report = self.solver.solve(&samples, &CancelToken::new());
        self.complete(generation, report)
    }

    /// 別スレッドの較正の結果を待つ（ツール・テスト用）
    pub fn wait_for_calibration(&mut self, timeout: Duration) -> Option<Result<Calibration>> {
        let job = self.job.take()?;
        match job.receiver.recv_timeout(timeout) {
            Ok(report) => Some(self.complete(job.generation, report)),
            Err(_) => {
                self.job = Some(job);
                None
            }
        }
    }

    /// 実行中の較正を打ち切る．直前の有効な較正はそのまま残る．
    pub fn abandon_calibration(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel.cancel();
        }
        self.magcal.abandon();
    }

    pub fn request_calibration(&mut self) {
        self.magcal.request();
    }

    pub fn is_calibration_valid(&self) -> bool {
        self.magcal.is_valid()
    }

    /// 有効な較正があれば返す
    pub fn get_calibration(&self) -> Option<Calibration> {
        self.magcal.is_valid().then(|| self.magcal.calibration())
    }

    pub fn magnetic_calibration(&self) -> &MagneticCalibration {
        &self.magcal
    }

    pub fn get_orientation(&self) -> Orientation {
        let state = self.filter.state();
        Orientation {
            quaternion: state.orientation,
            first_lock: state.first_lock,
            mode: self.filter.mode(),
        }
    }

    pub fn get_filter_health(&self) -> FusionHealth {
        FusionHealth {
            filter: self.filter.health(),
            stale: SensorKind::ALL
                .into_iter()
                .filter(|k| self.stale[slot(*k)])
                .collect(),
            buffers: SensorKind::ALL.map(|k| self.buffers.channel(k).health()),
            calibration_valid: self.magcal.is_valid(),
            calibration_in_progress: self.magcal.is_in_progress(),
            last_calibration_failure: self.last_calibration_failure,
        }
    }

    pub fn filter(&self) -> &OrientationFilter {
        &self.filter
    }

    /// フィルタの発散フラグを確認済みにする
    pub fn acknowledge_fault(&mut self) -> bool {
        self.filter.acknowledge_fault()
    }

    /// バッファのオーバーフローを確認済みにする
    pub fn drain_overflow(&mut self, kind: SensorKind) -> bool {
        self.buffers.channel_mut(kind).drain_overflow()
    }

    pub fn heading_degrees(&self) -> f64 {
        self.filter.heading_degrees()
    }

    /// 保存用の較正レコード
    pub fn export_calibration(&self) -> CalibrationRecord {
        let bias = (self.filter.mode() == FilterMode::Tracking).then(|| self.filter.state().gyro_bias);
        CalibrationRecord::new(self.magcal.is_valid(), &self.magcal.calibration(), bias)
    }

    /// 保存していた較正を復元する
    pub fn restore_calibration(&mut self, record: &CalibrationRecord) {
        if let Some(bias) = record.gyro_bias() {
            self.filter.seed_gyro_bias(bias);
        }
        if record.valid {
            self.abandon_calibration();
            self.magcal.restore(record.calibration());
            info!(tier = record.solver.elements(), field = record.field, "restored magnetic calibration");
        }
    }
}

impl Drop for FusionContext {
    fn drop(&mut self) {
        if let Some(job) = &self.job {
            job.cancel.cancel();
        }
    }
}
