//! 設定値（閾値・ノイズ・容量）
//!
//! 閾値の類は実機に合わせて調整するものなので，全てTOMLから読み込めるようにしてある．
//! 省略したキーはデフォルト値になる．

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::axis::CoordinateSystem;
use crate::error::{FusionError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub buffer: BufferConfig,
    pub channels: ChannelsConfig,
    pub magcal: MagCalConfig,
    pub filter: FilterConfig,
    pub orchestrator: OrchestratorConfig,
}

/// リングバッファの容量（センサ種別ごと）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub accel_capacity: usize,
    pub gyro_capacity: usize,
    pub mag_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            accel_capacity: 64,
            gyro_capacity: 64,
            mag_capacity: 512,
        }
    }
}

/// 生カウント値から物理量への換算係数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// 1カウントあたりの物理量 [x, y, z]
    pub scale: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// センサ基板の座標系
    pub coordinate_system: CoordinateSystem,
    /// [g/count]
    pub accel: ChannelConfig,
    /// [rad/s/count]
    pub gyro: ChannelConfig,
    /// [uT/count]
    pub mag: ChannelConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        // FXOS8700(±4g, 0.1uT/LSB) と FXAS21002(±2000dps) の組み合わせ
        let gyro = 0.0625_f64.to_radians();
        Self {
            coordinate_system: CoordinateSystem::Ned,
            accel: ChannelConfig { scale: [1.0 / 8192.0; 3] },
            gyro: ChannelConfig { scale: [gyro; 3] },
            mag: ChannelConfig { scale: [0.1; 3] },
        }
    }
}

/// 地磁気較正ソルバの閾値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagCalConfig {
    /// 4, 7, 10要素ソルバそれぞれの最小サンプル数
    pub min_samples: [usize; 3],
    /// 4, 7, 10要素ソルバそれぞれに要求する姿勢分布の拡がり
    ///
    /// サンプル共分散の最小固有値の平方根をサンプルのRMSノルムで割った値．
    /// 全球を一様に覆うと約0.58，静止していればほぼゼロになる．
    pub min_spread: [f64; 3],
    /// 正規方程式の条件数の上限
    pub max_condition: f64,
    /// 形状行列の固有値比（最大/最小）の上限
    pub max_eigen_ratio: f64,
    /// 全磁力の下限 [uT]
    pub min_field: f64,
    /// 全磁力の上限 [uT]
    pub max_field: f64,
    /// 較正後のノルム分散 / 較正前のノルム分散 の上限
    pub variance_ratio: f64,
    /// これ以下のフィット誤差[%]なら分散比に関係なく収束とみなす
    pub fit_error_floor_pct: f64,
    /// 一回の較正に使う最新サンプル数
    pub window: usize,
    /// 較正失敗後，次に自動で試みるまでの間隔 [s]
    pub retry_interval_secs: f64,
    /// 有効な較正があるときの定期再較正の間隔 [s]
    pub refresh_interval_secs: f64,
}

impl Default for MagCalConfig {
    fn default() -> Self {
        Self {
            min_samples: [40, 100, 150],
            min_spread: [0.05, 0.1, 0.15],
            max_condition: 1.0e12,
            max_eigen_ratio: 4.0,
            min_field: 10.0,
            max_field: 90.0,
            variance_ratio: 0.5,
            fit_error_floor_pct: 2.0,
            window: 256,
            retry_interval_secs: 2.0,
            refresh_interval_secs: 60.0,
        }
    }
}

impl MagCalConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_interval_secs)
    }
}

/// 姿勢推定カルマンフィルタのパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// 初期アライメントで平均するサンプル数
    pub align_samples: usize,
    /// ジャイロのノイズ密度 [rad^2/s]
    pub gyro_noise: f64,
    /// ジャイロバイアスのランダムウォーク [rad^2/s^3]
    pub bias_walk: f64,
    /// 加速度方向の観測ノイズ分散（単位ベクトル）
    pub accel_noise: f64,
    /// 地磁気方向の観測ノイズ分散（単位ベクトル）
    pub mag_noise: f64,
    /// これを超える残差ノルムは観測ノイズを膨らませて重みを下げる
    pub outlier_bound: f64,
    /// 初回ロックとみなす残差ノルム
    pub lock_residual: f64,
    /// 姿勢誤差共分散のトレースがこれを超えたらアライメントからやり直す [rad^2]
    pub realign_trace: f64,
    /// 共分散のトレースがこれを超えたら発散とみなす
    pub divergence_trace: f64,
    /// 姿勢誤差の初期分散 [rad^2]
    pub initial_attitude_var: f64,
    /// バイアスの初期分散 [(rad/s)^2]
    pub initial_bias_var: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            align_samples: 10,
            gyro_noise: 1.0e-4,
            bias_walk: 1.0e-8,
            accel_noise: 0.01,
            mag_noise: 0.05,
            outlier_bound: 0.3,
            lock_residual: 0.05,
            realign_trace: 0.5,
            divergence_trace: 1.0e6,
            initial_attitude_var: 0.01,
            initial_bias_var: 1.0e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 新しいサンプルがこの時間来なければそのチャンネルは古いとみなす [s]
    pub stale_after_secs: f64,
    /// 較正ソルバを別スレッドで走らせる
    pub background_calibration: bool,
    /// 起動直後に較正を要求する
    pub calibrate_on_startup: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 0.5,
            background_calibration: true,
            calibrate_on_startup: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.stale_after_secs)
    }
}

impl FusionConfig {
    /// TOML文字列から読み込む（省略したキーはデフォルト値）
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FusionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定ファイルを読み込む
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!(?path, "Loaded fusion config");
        Ok(config)
    }

    /// 閾値の整合性を確認する
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(FusionError::Config(msg));

        let b = &self.buffer;
        if b.accel_capacity == 0 || b.gyro_capacity == 0 || b.mag_capacity == 0 {
            return bad("buffer capacities must be non-zero".into());
        }

        let m = &self.magcal;
        if m.min_samples[0] < 4 || m.min_samples[0] > m.min_samples[1] || m.min_samples[1] > m.min_samples[2] {
            return bad(format!("magcal.min_samples must be ascending and >= 4: {:?}", m.min_samples));
        }
        if m.window < m.min_samples[0] || m.window > b.mag_capacity {
            return bad(format!(
                "magcal.window ({}) must lie between {} and buffer.mag_capacity ({})",
                m.window, m.min_samples[0], b.mag_capacity
            ));
        }
        if !(m.min_field > 0.0 && m.min_field < m.max_field) {
            return bad(format!("invalid field range [{}, {}]", m.min_field, m.max_field));
        }
        if m.max_eigen_ratio < 1.0 || m.max_condition <= 1.0 {
            return bad("magcal conditioning bounds must exceed 1".into());
        }
        if !(m.variance_ratio > 0.0 && m.variance_ratio <= 1.0) {
            return bad(format!("magcal.variance_ratio out of range: {}", m.variance_ratio));
        }
        // Duration に変換するので有限でなければならない
        let intervals = [m.retry_interval_secs, m.refresh_interval_secs];
        if intervals.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
            return bad(format!(
                "magcal intervals must be finite and non-negative: retry {}, refresh {}",
                m.retry_interval_secs, m.refresh_interval_secs
            ));
        }

        let f = &self.filter;
        if f.align_samples == 0 {
            return bad("filter.align_samples must be non-zero".into());
        }
        let noises = [f.gyro_noise, f.bias_walk, f.accel_noise, f.mag_noise, f.initial_attitude_var, f.initial_bias_var];
        if noises.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return bad("filter noise levels must be positive".into());
        }
        if !(f.outlier_bound > 0.0 && f.lock_residual > 0.0 && f.realign_trace < f.divergence_trace) {
            return bad("filter thresholds are inconsistent".into());
        }

        let stale = self.orchestrator.stale_after_secs;
        if !(stale.is_finite() && stale > 0.0) {
            return bad(format!("orchestrator.stale_after_secs must be finite and positive: {stale}"));
        }
        Ok(())
    }
}
