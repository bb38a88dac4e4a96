//! 較正値の保存と復元
//!
//! 先頭にマジック番号と版数を持つ JSON にする．浮動小数点は
//! serde_json の float_roundtrip で書くので，読み戻した値はビット単位で一致する．

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ellipsoid::SolverTier;
use crate::error::{FusionError, Result};
use crate::magcal::Calibration;
use crate::{Matrix3x3, Vector3};

pub const CALIBRATION_MAGIC: u32 = 0x1234_5678;
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    magic: u32,
    version: u32,
    pub valid: bool,
    pub solver: SolverTier,
    pub offset: [f64; 3],
    /// 行優先
    pub soft_iron: [[f64; 3]; 3],
    pub field: f64,
    pub fit_error_pct: f64,
    #[serde(default)]
    pub gyro_bias: Option<[f64; 3]>,
}

impl CalibrationRecord {
    pub fn new(valid: bool, calibration: &Calibration, gyro_bias: Option<Vector3>) -> Self {
        let w = &calibration.soft_iron;
        Self {
            magic: CALIBRATION_MAGIC,
            version: FORMAT_VERSION,
            valid,
            solver: calibration.solver,
            offset: calibration.offset.into(),
            soft_iron: [
                [w[(0, 0)], w[(0, 1)], w[(0, 2)]],
                [w[(1, 0)], w[(1, 1)], w[(1, 2)]],
                [w[(2, 0)], w[(2, 1)], w[(2, 2)]],
            ],
            field: calibration.field,
            fit_error_pct: calibration.fit_error_pct,
            gyro_bias: gyro_bias.map(Into::into),
        }
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            solver: self.solver,
            offset: Vector3::from(self.offset),
            soft_iron: self.soft_iron_matrix(),
            field: self.field,
            fit_error_pct: self.fit_error_pct,
        }
    }

    pub fn gyro_bias(&self) -> Option<Vector3> {
        self.gyro_bias.map(Vector3::from)
    }

    fn soft_iron_matrix(&self) -> Matrix3x3 {
        let w = &self.soft_iron;
        Matrix3x3::new(
            w[0][0], w[0][1], w[0][2],
            w[1][0], w[1][1], w[1][2],
            w[2][0], w[2][1], w[2][2],
        )
    }

    /// 読み込んだレコードの整合性
    fn validate(&self) -> Result<()> {
        if self.magic != CALIBRATION_MAGIC {
            return Err(FusionError::Storage(format!("bad magic {:#010x}", self.magic)));
        }
        if self.version != FORMAT_VERSION {
            return Err(FusionError::Storage(format!("unsupported version {}", self.version)));
        }
        let values = self.offset.iter().chain(self.soft_iron.iter().flatten());
        if !values.chain([&self.field, &self.fit_error_pct]).all(|v| v.is_finite()) {
            return Err(FusionError::Storage("non-finite value".into()));
        }
        if !self.valid {
            return Ok(());
        }

        let w = self.soft_iron_matrix();
        let asymmetry = (w - w.transpose()).abs().max();
        if asymmetry > 1e-9 * w.abs().max() || w.cholesky().is_none() {
            return Err(FusionError::Storage("soft-iron matrix is not symmetric positive definite".into()));
        }
        if self.field <= 0.0 {
            return Err(FusionError::Storage(format!("field strength {} is not positive", self.field)));
        }
        Ok(())
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let record: Self = serde_json::from_slice(blob)?;
        record.validate()?;
        Ok(record)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_blob()?)?;
        info!(path = %path.display(), valid = self.valid, "saved magnetic calibration");
        Ok(())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let record = Self::from_blob(&fs::read(path)?)?;
        debug!(path = %path.display(), valid = record.valid, "loaded magnetic calibration");
        Ok(record)
    }
}
