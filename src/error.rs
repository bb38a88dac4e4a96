//! エラー型の定義

use thiserror::Error;

use crate::buffer::SensorKind;

/// 各ソルバ段での較正失敗理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FitFailure {
    /// サンプル数がこの段の最小数に届いていない
    #[error("too few samples for this solver")]
    TooFewSamples,

    /// サンプルの姿勢分布が偏っている（静止している等）
    #[error("angular coverage of the samples is too small")]
    PoorCoverage,

    /// 正規方程式が特異に近い
    #[error("normal equations are singular or badly conditioned")]
    Singular,

    /// 形状行列が正定値でない
    #[error("ellipsoid shape matrix is not positive-definite")]
    NotPositiveDefinite,

    /// 固有値比が大きすぎる（扁平すぎる楕円体）
    #[error("ellipsoid is too eccentric")]
    Eccentric,

    /// 推定した全磁力が物理的にありえない値
    #[error("fitted field magnitude is outside the plausible range")]
    FieldOutOfRange,

    /// 較正後のノルムの分散が十分に小さくならない
    #[error("calibrated magnitude variance did not converge")]
    NotConverged,

    /// 途中で打ち切られた
    #[error("calibration attempt was abandoned")]
    Abandoned,
}

/// 融合処理のエラー
#[derive(Debug, Error)]
pub enum FusionError {
    /// 較正に使えるサンプルが足りない
    #[error("insufficient magnetometer data: {available} samples, {required} required")]
    InsufficientData { available: usize, required: usize },

    /// 正規方程式が特異か形状行列が不正（下の段へ落とす）
    #[error("calibration fit is ill-conditioned: {0}")]
    IllConditioned(FitFailure),

    /// 共分散が発散した（フィルタは初期化前に戻してある）
    #[error("orientation filter diverged (covariance trace {trace})")]
    FilterDivergence { trace: f64 },

    /// 設定した時間内に新しいサンプルが来ていない
    #[error("{0:?} channel is stale")]
    StaleInput(SensorKind),

    /// 較正処理が途中で打ち切られた
    #[error("calibration abandoned")]
    CalibrationAbandoned,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("calibration record is invalid: {0}")]
    Storage(String),

    #[error("failed to encode or decode calibration record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FitFailure> for FusionError {
    fn from(reason: FitFailure) -> Self {
        match reason {
            FitFailure::Abandoned => FusionError::CalibrationAbandoned,
            other => FusionError::IllConditioned(other),
        }
    }
}

/// 融合処理の結果型
pub type Result<T> = std::result::Result<T, FusionError>;
