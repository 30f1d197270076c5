// use crate::all::*;

// Eigen-like aliases.
pub type Vector2d = nalgebra::Vector2::<f64>;
pub type Vector3d = nalgebra::Vector3::<f64>;
pub type Vector6d = nalgebra::Vector6::<f64>;
pub type Matrix3d = nalgebra::Matrix3::<f64>;
pub type Matrix9d = nalgebra::SMatrix::<f64, 9, 9>;
pub type Matrixd = nalgebra::DMatrix::<f64>;
pub type Vectord = nalgebra::DVector::<f64>;
pub type Quaterniond = nalgebra::UnitQuaternion::<f64>;

// Nanoseconds since an arbitrary epoch. Zero is reserved/invalid.
pub type Timestamp = i64;

pub const NANOS_PER_SECOND: f64 = 1e9;

pub fn seconds_between(t0: Timestamp, t1: Timestamp) -> f64 {
  (t1 - t0) as f64 / NANOS_PER_SECOND
}

// A single 6-DoF inertial measurement. Immutable once stored.
#[derive(Clone, Copy, Debug)]
pub struct InertialSample {
  pub time: Timestamp,
  // Specific force, m/s^2.
  pub accel: Vector3d,
  // Angular rate, rad/s.
  pub gyro: Vector3d,
}

// Slowly varying inertial sensor offsets, jointly estimated with the motion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorBias {
  pub accel: Vector3d,
  pub gyro: Vector3d,
}

impl SensorBias {
  pub fn new(accel: Vector3d, gyro: Vector3d) -> SensorBias {
    SensorBias { accel, gyro }
  }

  pub fn zero() -> SensorBias {
    SensorBias {
      accel: Vector3d::zeros(),
      gyro: Vector3d::zeros(),
    }
  }

  // Norm of the stacked difference, used for relinearization decisions.
  pub fn distance(&self, other: &SensorBias) -> f64 {
    ((self.accel - other.accel).norm_squared()
      + (self.gyro - other.gyro).norm_squared()).sqrt()
  }
}

// Orientation plus translation, composed rigid-body style. Never decomposed
// into Euler angles.
#[derive(Clone, Copy, Debug)]
pub struct RigidPose {
  pub rotation: Quaterniond,
  pub translation: Vector3d,
}

impl RigidPose {
  pub fn new(rotation: Quaterniond, translation: Vector3d) -> RigidPose {
    RigidPose { rotation, translation }
  }

  pub fn identity() -> RigidPose {
    RigidPose {
      rotation: Quaterniond::identity(),
      translation: Vector3d::zeros(),
    }
  }

  pub fn compose(&self, other: &RigidPose) -> RigidPose {
    RigidPose {
      rotation: self.rotation * other.rotation,
      translation: self.translation + self.rotation * other.translation,
    }
  }

  pub fn inverse(&self) -> RigidPose {
    let rotation = self.rotation.inverse();
    RigidPose {
      rotation,
      translation: -(rotation * self.translation),
    }
  }

  pub fn transform(&self, p: &Vector3d) -> Vector3d {
    self.rotation * p + self.translation
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub usize);

// One rectified stereo detection: both images share the vertical coordinate.
#[derive(Clone, Copy, Debug)]
pub struct LandmarkObservation {
  pub id: LandmarkId,
  pub left_x: f64,
  pub right_x: f64,
  pub y: f64,
}

// Same measurement without the landmark id, as stored in tracks and factors.
#[derive(Clone, Copy, Debug)]
pub struct StereoObservation {
  pub left_x: f64,
  pub right_x: f64,
  pub y: f64,
}

impl LandmarkObservation {
  pub fn stereo(&self) -> StereoObservation {
    StereoObservation {
      left_x: self.left_x,
      right_x: self.right_x,
      y: self.y,
    }
  }

  pub fn is_finite(&self) -> bool {
    self.left_x.is_finite() && self.right_x.is_finite() && self.y.is_finite()
  }
}

// Per-keyframe validity flags reported by the visual front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingStatus {
  Valid,
  LowDisparity,
  FewMatches,
  Invalid,
}

#[derive(Clone, Copy, Debug)]
pub struct TrackingStatusSummary {
  pub mono: TrackingStatus,
  pub stereo: TrackingStatus,
}

// The (pose, velocity, bias) triple used for seeding and reporting.
#[derive(Clone, Copy, Debug)]
pub struct NavigationState {
  pub pose: RigidPose,
  pub velocity: Vector3d,
  pub bias: SensorBias,
}

// One active variable of the sliding window. Owned by the estimator.
#[derive(Clone, Copy, Debug)]
pub struct KeyframeState {
  pub index: usize,
  pub time: Timestamp,
  pub pose: RigidPose,
  pub velocity: Vector3d,
  pub bias: SensorBias,
}

impl KeyframeState {
  pub fn navigation_state(&self) -> NavigationState {
    NavigationState {
      pose: self.pose,
      velocity: self.velocity,
      bias: self.bias,
    }
  }
}
