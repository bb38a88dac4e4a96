//! センサ軸の座標系変換
//!
//! 基板上のセンサICの軸は融合アルゴリズムが仮定する座標系と一致するとは限らないので，
//! 生データをバッファに入れる前に必ず並べ替える．

use serde::{Deserialize, Serialize};

use crate::buffer::SensorKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSystem {
    /// 変換なし
    #[default]
    Ned,
    Android,
    Win8,
}

impl CoordinateSystem {
    /// 生カウント値を融合に使う座標系へ写す
    pub fn remap(self, kind: SensorKind, [x, y, z]: [i32; 3]) -> [i32; 3] {
        match (self, kind) {
            (CoordinateSystem::Ned, _) => [x, y, z],
            (CoordinateSystem::Android, _) => [-x, -y, z],
            (CoordinateSystem::Win8, SensorKind::Accelerometer) => [x, y, -z],
            (CoordinateSystem::Win8, _) => [-x, -y, z],
        }
    }
}
