//! 地磁気較正ソルバと較正レコード
//!
//! バッファから取り出した地磁気サンプルの窓に対して，使える中で最も高い段の
//! 楕円体フィッティングを試し，失敗したら下の段へ落とす．
//! 受理された較正はレコードに丸ごと書き込まれるまでフィルタからは見えない．

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::MagCalConfig;
use crate::ellipsoid::{angular_spread, EllipsoidFit, FitBounds, SolverTier};
use crate::error::{FitFailure, FusionError, Result};
use crate::{Matrix3x3, Vector3};

/// 適用する較正値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub solver: SolverTier,
    /// ハードアイアン [uT]
    pub offset: Vector3,
    /// ソフトアイアン補正行列（未較正なら単位行列）
    pub soft_iron: Matrix3x3,
    /// 全磁力 [uT]
    pub field: f64,
    /// フィット誤差 [%]
    pub fit_error_pct: f64,
}

impl Calibration {
    /// 何もしない較正
    pub fn identity() -> Self {
        Self {
            solver: SolverTier::Four,
            offset: Vector3::zeros(),
            soft_iron: Matrix3x3::identity(),
            field: 0.0,
            fit_error_pct: 100.0,
        }
    }

    /// 生の地磁気計測値を較正する
    ///
    /// * raw: 生の地磁気計測値 [x, y, z] [uT]
    pub fn apply(&self, raw: Vector3) -> Vector3 {
        self.soft_iron * (raw - self.offset)
    }
}

/// 各段の試行結果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TierOutcome {
    #[default]
    NotAttempted,
    Failed(FitFailure),
    Accepted(Calibration),
}

impl TierOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TierOutcome::Failed(_))
    }
}

/// 4, 7, 10要素それぞれの直近の試行結果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TierAttempts([TierOutcome; 3]);

impl TierAttempts {
    pub fn get(&self, tier: SolverTier) -> TierOutcome {
        self.0[tier.index()]
    }

    fn set(&mut self, tier: SolverTier, outcome: TierOutcome) {
        self.0[tier.index()] = outcome;
    }

    pub fn iter(&self) -> impl Iterator<Item = (SolverTier, TierOutcome)> + '_ {
        SolverTier::ALL.into_iter().map(move |t| (t, self.get(t)))
    }

    /// 最後に試した（最も低い）段とその成否
    pub fn last_attempted(&self) -> Option<(SolverTier, bool)> {
        SolverTier::ALL.into_iter().find_map(|t| match self.get(t) {
            TierOutcome::NotAttempted => None,
            TierOutcome::Failed(_) => Some((t, false)),
            TierOutcome::Accepted(_) => Some((t, true)),
        })
    }
}

/// 窓内の全磁力の統計（収束判定用）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldStats {
    pub samples: usize,
    pub raw_mean: f64,
    pub raw_variance: f64,
    pub calibrated_mean: f64,
    pub calibrated_variance: f64,
}

/// 較正処理の中断要求
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// 一回の較正処理の結果
#[derive(Debug)]
pub struct SolveReport {
    pub attempts: TierAttempts,
    pub stats: FieldStats,
    pub result: Result<Calibration>,
}

fn mean_variance(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count().max(1) as f64;
    let mean = values.clone().sum::<f64>() / n;
    let variance = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance)
}

pub struct MagCalSolver {
    config: MagCalConfig,
}

impl MagCalSolver {
    pub fn new(config: MagCalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MagCalConfig {
        &self.config
    }

    fn bounds(&self) -> FitBounds {
        FitBounds {
            max_condition: self.config.max_condition,
            max_eigen_ratio: self.config.max_eigen_ratio,
        }
    }

    /// サンプル数と姿勢分布から，この段を試してよいか判定する
    fn eligible(&self, tier: SolverTier, samples: usize, spread: f64) -> std::result::Result<(), FitFailure> {
        if samples < self.config.min_samples[tier.index()] {
            Err(FitFailure::TooFewSamples)
        } else if spread < self.config.min_spread[tier.index()] {
            Err(FitFailure::PoorCoverage)
        } else {
            Ok(())
        }
    }

    /// サンプルの窓から較正値を推定する
    ///
    /// * samples: 物理量に換算した生の地磁気計測値 [uT]（古い順）
    pub fn solve(&self, samples: &[Vector3], cancel: &CancelToken) -> SolveReport {
        let mut attempts = TierAttempts::default();
        let raw = mean_variance(samples.iter().map(|s| s.norm()));
        let mut stats = FieldStats {
            samples: samples.len(),
            raw_mean: raw.0,
            raw_variance: raw.1,
            ..FieldStats::default()
        };

        let required = self.config.min_samples[0];
        if samples.len() < required {
            debug!(available = samples.len(), required, "not enough magnetometer samples to calibrate");
            return SolveReport {
                attempts,
                stats,
                result: Err(FusionError::InsufficientData { available: samples.len(), required }),
            };
        }

        let spread = angular_spread(samples);
        let mut start = None;
        for tier in SolverTier::ALL.into_iter().rev() {
            match self.eligible(tier, samples.len(), spread) {
                Ok(()) => {
                    start = Some(tier);
                    break;
                }
                Err(reason) => attempts.set(tier, TierOutcome::Failed(reason)),
            }
        }

        let mut last_failure = FitFailure::PoorCoverage;
        let mut tier = start;
        while let Some(current) = tier {
            if cancel.is_cancelled() {
                attempts.set(current, TierOutcome::Failed(FitFailure::Abandoned));
                return SolveReport { attempts, stats, result: Err(FusionError::CalibrationAbandoned) };
            }

            match current.fit(samples, &self.bounds()).and_then(|fit| self.accept(fit, samples)) {
                Ok((calibration, calibrated)) => {
                    attempts.set(current, TierOutcome::Accepted(calibration));
                    stats.calibrated_mean = calibrated.0;
                    stats.calibrated_variance = calibrated.1;
                    return SolveReport { attempts, stats, result: Ok(calibration) };
                }
                Err(reason) => {
                    debug!(tier = current.elements(), %reason, "magnetic calibration tier rejected");
                    attempts.set(current, TierOutcome::Failed(reason));
                    last_failure = reason;
                    tier = current.lower();
                }
            }
        }

        warn!(spread, samples = samples.len(), reason = %last_failure, "magnetic calibration rejected at every tier");
        SolveReport { attempts, stats, result: Err(FusionError::IllConditioned(last_failure)) }
    }

    /// フィッティング結果の受理判定
    fn accept(&self, fit: EllipsoidFit, samples: &[Vector3]) -> std::result::Result<(Calibration, (f64, f64)), FitFailure> {
        if !(self.config.min_field..=self.config.max_field).contains(&fit.field) {
            return Err(FitFailure::FieldOutOfRange);
        }
        if fit.soft_iron.cholesky().is_none() {
            return Err(FitFailure::NotPositiveDefinite);
        }

        let raw_variance = mean_variance(samples.iter().map(|s| s.norm())).1;
        let (mean, variance) = mean_variance(samples.iter().map(|s| (fit.soft_iron * (s - fit.offset)).norm()));
        let fit_error_pct = 100.0 * variance.sqrt() / fit.field;

        let converged = variance <= self.config.variance_ratio * raw_variance
            || fit_error_pct <= self.config.fit_error_floor_pct;
        if !converged {
            return Err(FitFailure::NotConverged);
        }

        let calibration = Calibration {
            solver: fit.tier,
            offset: fit.offset,
            soft_iron: fit.soft_iron,
            field: fit.field,
            fit_error_pct,
        };
        Ok((calibration, (mean, variance)))
    }
}

/// 地磁気較正の状態
///
/// 書き換えは較正処理の開始・終了時だけで，フィルタは `calibration()` で
/// 受理済みの値のコピーを読む．
#[derive(Debug, Clone)]
pub struct MagneticCalibration {
    valid: bool,
    in_progress: bool,
    requested: bool,
    new_available: bool,
    current: Calibration,
    stats: FieldStats,
    attempts: TierAttempts,
    last_attempt_at: Option<Duration>,
    generation: u64,
}

impl Default for MagneticCalibration {
    fn default() -> Self {
        Self {
            valid: false,
            in_progress: false,
            requested: false,
            new_available: false,
            current: Calibration::identity(),
            stats: FieldStats::default(),
            attempts: TierAttempts::default(),
            last_attempt_at: None,
            generation: 0,
        }
    }
}

impl MagneticCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// 現在の較正値（未較正なら何もしない較正）
    pub fn calibration(&self) -> Calibration {
        self.current
    }

    pub fn stats(&self) -> FieldStats {
        self.stats
    }

    pub fn attempts(&self) -> TierAttempts {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> Option<Duration> {
        self.last_attempt_at
    }

    pub fn request(&mut self) {
        self.requested = true;
    }

    /// 較正処理を開始する．戻り値の世代番号で結果を照合する．
    pub fn begin(&mut self, now: Duration) -> u64 {
        self.in_progress = true;
        self.requested = false;
        self.last_attempt_at = Some(now);
        self.generation += 1;
        self.generation
    }

    /// 実行中の較正処理を破棄する．遅れて届いた結果は無視される．
    pub fn abandon(&mut self) {
        if self.in_progress {
            debug!(generation = self.generation, "abandoning magnetic calibration");
        }
        self.in_progress = false;
        self.generation += 1;
    }

    /// 較正処理の結果を反映する
    ///
    /// 新しい較正は，段が現在以上かフィット誤差が現在より小さい場合にだけ置き換える．
    pub fn finish(&mut self, generation: u64, report: SolveReport) -> Result<Calibration> {
        if generation != self.generation || !self.in_progress {
            return Err(FusionError::CalibrationAbandoned);
        }
        self.in_progress = false;
        self.attempts = report.attempts;
        self.stats = report.stats;

        let candidate = report.result?;
        let replace = !self.valid
            || candidate.solver >= self.current.solver
            || candidate.fit_error_pct < self.current.fit_error_pct;
        if replace {
            info!(
                tier = candidate.solver.elements(),
                offset_x = candidate.offset[0],
                offset_y = candidate.offset[1],
                offset_z = candidate.offset[2],
                field = candidate.field,
                fit_error_pct = candidate.fit_error_pct,
                "magnetic calibration accepted"
            );
            self.current = candidate;
            self.valid = true;
            self.new_available = true;
        } else {
            debug!(
                tier = candidate.solver.elements(),
                fit_error_pct = candidate.fit_error_pct,
                "keeping existing higher-order magnetic calibration"
            );
        }
        Ok(self.current)
    }

    /// 新しい較正があれば一度だけ返す
    pub fn take_new_calibration(&mut self) -> Option<Calibration> {
        if std::mem::take(&mut self.new_available) {
            Some(self.current)
        } else {
            None
        }
    }

    /// 保存していた較正を復元する
    pub fn restore(&mut self, calibration: Calibration) {
        self.current = calibration;
        self.valid = true;
        self.new_available = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ellipsoid::tests::distorted;
    use approx::assert_relative_eq;

    fn solver() -> MagCalSolver {
        MagCalSolver::new(MagCalConfig::default())
    }

    fn sphere(n: usize) -> Vec<Vector3> {
        distorted(n, 50.0, Matrix3x3::identity(), Vector3::new(1.0, 2.0, 3.0))
    }

    #[test]
    fn picks_highest_tier_allowed_by_sample_count() {
        let report = solver().solve(&sphere(120), &CancelToken::new());
        let calibration = report.result.unwrap();
        assert_eq!(calibration.solver, SolverTier::Seven);
        assert_eq!(report.attempts.get(SolverTier::Ten), TierOutcome::Failed(FitFailure::TooFewSamples));
        assert_eq!(report.attempts.get(SolverTier::Four), TierOutcome::NotAttempted);
        assert_eq!(report.attempts.last_attempted(), Some((SolverTier::Seven, true)));
    }

    #[test]
    fn falls_back_when_higher_tier_fails() {
        // 軸比が大きいので10要素と7要素は扁平すぎると判定され，球では収束しない
        let w = Matrix3x3::from_diagonal(&Vector3::new(2.0, 1.0, 0.5));
        let samples = distorted(200, 50.0, w, Vector3::new(5.0, 0.0, 0.0));
        let report = solver().solve(&samples, &CancelToken::new());
        assert_eq!(report.attempts.get(SolverTier::Ten), TierOutcome::Failed(FitFailure::Eccentric));
        assert_eq!(report.attempts.get(SolverTier::Seven), TierOutcome::Failed(FitFailure::Eccentric));
        assert!(report.attempts.get(SolverTier::Four).is_failed());
        assert!(matches!(report.result, Err(FusionError::IllConditioned(_))));
    }

    #[test]
    fn lower_tier_is_accepted_after_higher_tier_fails() {
        // 傾いた楕円体．10要素では固有値比 (1.3/(1/1.3))^2 ≈ 2.86 が見えて扁平すぎと判定されるが，
        // 軸に沿った7要素の近似は丸くなるので受理される
        let r = nalgebra::Rotation3::from_euler_angles(0.0, std::f64::consts::FRAC_PI_4, 0.0).into_inner();
        let w = r * Matrix3x3::from_diagonal(&Vector3::new(1.3, 1.0, 1.0 / 1.3)) * r.transpose();
        let samples = distorted(300, 50.0, w, Vector3::new(30.0, -20.0, 25.0));
        let solver = MagCalSolver::new(MagCalConfig { max_eigen_ratio: 2.0, ..MagCalConfig::default() });
        let report = solver.solve(&samples, &CancelToken::new());

        assert_eq!(report.attempts.get(SolverTier::Ten), TierOutcome::Failed(FitFailure::Eccentric));
        assert!(matches!(report.attempts.get(SolverTier::Seven), TierOutcome::Accepted(_)));
        assert_eq!(report.attempts.get(SolverTier::Four), TierOutcome::NotAttempted);
        assert_eq!(report.attempts.last_attempted(), Some((SolverTier::Seven, true)));
        let calibration = report.result.unwrap();
        assert_eq!(calibration.solver, SolverTier::Seven);
        assert!(calibration.soft_iron.cholesky().is_some());
        assert!(report.stats.calibrated_variance < report.stats.raw_variance);
    }

    #[test]
    fn field_outside_physical_range_is_rejected() {
        let samples = distorted(200, 150.0, Matrix3x3::identity(), Vector3::zeros());
        let report = solver().solve(&samples, &CancelToken::new());
        assert!(report.attempts.iter().all(|(_, o)| o == TierOutcome::Failed(FitFailure::FieldOutOfRange)));
        assert!(matches!(report.result, Err(FusionError::IllConditioned(FitFailure::FieldOutOfRange))));
    }

    #[test]
    fn cancelled_solve_is_abandoned() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = solver().solve(&sphere(200), &cancel);
        assert!(matches!(report.result, Err(FusionError::CalibrationAbandoned)));
        assert_eq!(report.attempts.get(SolverTier::Ten), TierOutcome::Failed(FitFailure::Abandoned));
    }

    #[test]
    fn new_calibration_is_consumed_once() {
        let mut record = MagneticCalibration::new();
        let generation = record.begin(Duration::ZERO);
        assert!(record.is_in_progress());
        let report = solver().solve(&sphere(200), &CancelToken::new());
        record.finish(generation, report).unwrap();

        assert!(record.is_valid());
        assert!(!record.is_in_progress());
        assert!(record.take_new_calibration().is_some());
        assert!(record.take_new_calibration().is_none());
        assert_relative_eq!(record.calibration().offset, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-6);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut record = MagneticCalibration::new();
        let generation = record.begin(Duration::ZERO);
        record.abandon();
        let report = solver().solve(&sphere(200), &CancelToken::new());
        assert!(matches!(record.finish(generation, report), Err(FusionError::CalibrationAbandoned)));
        assert!(!record.is_valid());
    }

    #[test]
    fn lower_tier_with_worse_fit_does_not_replace() {
        let mut record = MagneticCalibration::new();
        let good = Calibration {
            solver: SolverTier::Ten,
            offset: Vector3::new(1.0, 1.0, 1.0),
            soft_iron: Matrix3x3::identity(),
            field: 50.0,
            fit_error_pct: 0.5,
        };
        record.restore(good);
        record.take_new_calibration();

        let generation = record.begin(Duration::from_secs(1));
        let worse = Calibration { solver: SolverTier::Four, fit_error_pct: 1.5, ..good };
        let report = SolveReport {
            attempts: TierAttempts::default(),
            stats: FieldStats::default(),
            result: Ok(worse),
        };
        assert_eq!(record.finish(generation, report).unwrap(), good);
        assert!(record.take_new_calibration().is_none());
    }
}
