use nalgebra::Vector3;
use serde::Deserialize;

/// Gravity vector in world frame (m/s^2).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// Slack applied to the boundaries of [`ImuBuffer::period`] queries.
const PERIOD_EPS: f64 = 1e-9;

/// IMU noise parameters (1-sigma, continuous time).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
    /// Gyroscope bias random walk.
    pub sigma_gyro_walk: f64,
    /// Accelerometer bias random walk.
    pub sigma_accel_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            // Approximate EuRoC noise values
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            sigma_gyro_walk: 1.9393e-5,
            sigma_accel_walk: 3.0e-3,
        }
    }
}

/// IMU biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { accel, gyro }
    }

    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }

    /// True when either component moved further than its threshold.
    pub fn differs_from(&self, other: &ImuBias, accel_threshold: f64, gyro_threshold: f64) -> bool {
        (self.accel - other.accel).norm() > accel_threshold
            || (self.gyro - other.gyro).norm() > gyro_threshold
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for ImuBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ba [{:+.4}, {:+.4}, {:+.4}] Bg [{:+.5}, {:+.5}, {:+.5}]",
            self.accel.x, self.accel.y, self.accel.z, self.gyro.x, self.gyro.y, self.gyro.z
        )
    }
}

/// Single IMU measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp_s,
            accel,
            gyro,
        }
    }
}

/// Time-ordered IMU sample buffer for one agent.
#[derive(Debug, Clone, Default)]
pub struct ImuBuffer {
    samples: Vec<ImuSample>,
}

impl ImuBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(samples: Vec<ImuSample>) -> Self {
        let mut buffer = Self::new();
        buffer.extend(samples);
        buffer
    }

    /// Append a sample. Samples that do not advance time are rejected.
    pub fn push(&mut self, sample: ImuSample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.timestamp_s <= last.timestamp_s {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }

    pub fn extend<I: IntoIterator<Item = ImuSample>>(&mut self, samples: I) {
        for s in samples {
            self.push(s);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[ImuSample] {
        &self.samples
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.samples.last().map(|s| s.timestamp_s)
    }

    /// Samples with `t0 <= t <= t1`, plus the index of the first one.
    pub fn period(&self, t0: f64, t1: f64) -> (Vec<ImuSample>, Option<usize>) {
        let start = self
            .samples
            .partition_point(|s| s.timestamp_s < t0 - PERIOD_EPS);
        let end = self
            .samples
            .partition_point(|s| s.timestamp_s <= t1 + PERIOD_EPS);
        if start >= end {
            return (Vec::new(), None);
        }
        (self.samples[start..end].to_vec(), Some(start))
    }

    /// Drop samples strictly older than `t`.
    pub fn discard_before(&mut self, t: f64) {
        let idx = self.samples.partition_point(|s| s.timestamp_s < t - PERIOD_EPS);
        self.samples.drain(..idx);
    }
}
