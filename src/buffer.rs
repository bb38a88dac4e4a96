//! センサ生データのリングバッファ
//!
//! 書き込みはハードウェア取り込み側の一箇所だけで，較正ソルバとフィルタは
//! スナップショットを読むだけ（内容は書き換えない）．

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::Vector3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [
        SensorKind::Accelerometer,
        SensorKind::Gyroscope,
        SensorKind::Magnetometer,
    ];

    fn index(self) -> usize {
        match self {
            SensorKind::Accelerometer => 0,
            SensorKind::Gyroscope => 1,
            SensorKind::Magnetometer => 2,
        }
    }
}

/// 時刻付きの生計測値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// 外部から与えられる単調増加時刻
    pub timestamp: Duration,
    /// センサ固有のカウント値 [x, y, z]
    pub counts: [i32; 3],
    /// 1カウントあたりの物理量
    pub scale: Vector3,
}

impl SensorSample {
    pub fn new(timestamp: Duration, counts: [i32; 3], scale: Vector3) -> Self {
        Self { timestamp, counts, scale }
    }

    /// 物理量に換算した値
    pub fn value(&self) -> Vector3 {
        Vector3::new(
            self.counts[0] as f64,
            self.counts[1] as f64,
            self.counts[2] as f64,
        )
        .component_mul(&self.scale)
    }
}

/// バッファの健全性
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferHealth {
    pub count: usize,
    pub capacity: usize,
    /// 未確認の上書きがある
    pub overflow: bool,
    /// 上書きで失われたサンプルの累計
    pub overwritten: u64,
    /// 時刻が巻き戻っていて捨てたサンプルの累計
    pub out_of_order: u64,
}

#[derive(Debug, Clone)]
pub struct SampleBuffer {
    slots: Vec<SensorSample>,
    capacity: usize,
    write: usize,
    count: usize,
    overflow: bool,
    overwritten: u64,
    out_of_order: u64,
}

impl SampleBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            write: 0,
            count: 0,
            overflow: false,
            overwritten: 0,
            out_of_order: 0,
        }
    }

    /// サンプルを追加する．満杯なら最古のものを上書きしてオーバーフローを立てる．
    /// 直前のサンプルより新しくない時刻のものは捨てる．
    pub fn record(&mut self, sample: SensorSample) {
        // 同時刻も巻き戻りとして扱う（`since` は時刻で新旧を判定するため）
        if let Some(latest) = self.latest().map(|s| s.timestamp) {
            if sample.timestamp <= latest {
                self.out_of_order += 1;
                debug!(?sample.timestamp, ?latest, "dropping out-of-order sample");
                return;
            }
        }

        if self.slots.len() < self.capacity {
            self.slots.push(sample);
        } else {
            self.slots[self.write] = sample;
        }
        self.write = (self.write + 1) % self.capacity;

        if self.count == self.capacity {
            if !self.overflow {
                warn!(capacity = self.capacity, "sample buffer overflow");
            }
            self.overflow = true;
            self.overwritten += 1;
        } else {
            self.count += 1;
        }
    }

    /// 最新n個を古い順に返す（n > count のときはあるだけ返す）
    pub fn snapshot(&self, n: usize) -> Vec<SensorSample> {
        let n = n.min(self.count);
        (0..n)
            .map(|i| {
                let idx = (self.write + self.capacity - n + i) % self.capacity;
                self.slots[idx]
            })
            .collect()
    }

    /// `after` より新しいサンプルを古い順に返す
    pub fn since(&self, after: Duration) -> Vec<SensorSample> {
        let mut fresh: Vec<SensorSample> = self
            .iter_newest_first()
            .take_while(|s| s.timestamp > after)
            .collect();
        fresh.reverse();
        fresh
    }

    pub fn latest(&self) -> Option<&SensorSample> {
        if self.count == 0 {
            return None;
        }
        Some(&self.slots[(self.write + self.capacity - 1) % self.capacity])
    }

    /// オーバーフローフラグを読んで下ろす
    pub fn drain_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflow)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn health(&self) -> BufferHealth {
        BufferHealth {
            count: self.count,
            capacity: self.capacity,
            overflow: self.overflow,
            overwritten: self.overwritten,
            out_of_order: self.out_of_order,
        }
    }

    fn iter_newest_first(&self) -> impl Iterator<Item = SensorSample> + '_ {
        (1..=self.count).map(move |k| self.slots[(self.write + self.capacity - k) % self.capacity])
    }
}

/// 加速度・ジャイロ・地磁気の3チャンネル分のバッファ
#[derive(Debug, Clone)]
pub struct SampleBuffers {
    channels: [SampleBuffer; 3],
}

impl SampleBuffers {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            channels: [
                SampleBuffer::with_capacity(config.accel_capacity),
                SampleBuffer::with_capacity(config.gyro_capacity),
                SampleBuffer::with_capacity(config.mag_capacity),
            ],
        }
    }

    pub fn channel(&self, kind: SensorKind) -> &SampleBuffer {
        &self.channels[kind.index()]
    }

    pub fn channel_mut(&mut self, kind: SensorKind) -> &mut SampleBuffer {
        &mut self.channels[kind.index()]
    }
}
