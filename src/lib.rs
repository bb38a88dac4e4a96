//! 9軸センサ（加速度・角速度・地磁気）による姿勢推定
//!
//! 地磁気センサのハードアイアン・ソフトアイアン較正を楕円体フィッティングで求め，
//! 較正済みの地磁気と加速度・角速度を乗法型拡張カルマンフィルタで融合する．
//! 世界座標は NWU（x: 北，y: 西，z: 上）とする．
//!
//! 参考文献
//! 1. M. Ozyagcilar, "Calibrating an eCompass in the Presence of Hard- and
//!    Soft-Iron Interference", Freescale Semiconductor, AN4246, 2015.
//! 2. F. L. Markley, "Attitude Error Representations for Kalman Filtering",
//!    Journal of Guidance, Control, and Dynamics, vol. 26, no. 2, 2003.
//! 3. M. D. Shuster and S. D. Oh, "Three-Axis Attitude Determination from
//!    Vector Observations", Journal of Guidance and Control, vol. 4, no. 1, 1981.

pub use nalgebra::{SMatrix, SVector, UnitQuaternion};

pub type Vector3 = SVector<f64, 3>;
pub type Matrix3x3 = SMatrix<f64, 3, 3>;

pub mod axis;
pub mod buffer;
pub mod config;
pub mod ellipsoid;
pub mod error;
pub mod fusion;
pub mod kalman;
pub mod magcal;
pub mod storage;

pub use axis::CoordinateSystem;
pub use buffer::{BufferHealth, SampleBuffer, SensorKind, SensorSample};
pub use config::FusionConfig;
pub use ellipsoid::SolverTier;
pub use error::{FitFailure, FusionError, Result};
pub use fusion::{FusionContext, FusionHealth, FusionOutput, Orientation};
pub use kalman::{FilterHealth, FilterMode, OrientationFilter};
pub use magcal::{Calibration, MagCalSolver, MagneticCalibration};
pub use storage::CalibrationRecord;
