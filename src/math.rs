use crate::all::*;

// Cosine of the angle under which a direction counts as axis-aligned for the
// gravity rounding option (about 11 degrees).
const NEAR_AXIS_COS: f64 = 0.98;

pub fn skew(v: &Vector3d) -> Matrix3d {
  Matrix3d::new(
    0., -v[2], v[1],
    v[2], 0., -v[0],
    -v[1], v[0], 0.,
  )
}

pub fn so3_exp(v: &Vector3d) -> Quaterniond {
  Quaterniond::from_scaled_axis(*v)
}

pub fn so3_log(q: &Quaterniond) -> Vector3d {
  q.scaled_axis()
}

// Right Jacobian of the SO(3) exponential at `v`.
pub fn so3_right_jacobian(v: &Vector3d) -> Matrix3d {
  let theta = v.norm();
  let s = skew(v);
  if theta < 1e-8 {
    return Matrix3d::identity() - 0.5 * s;
  }
  let theta2 = theta * theta;
  Matrix3d::identity()
    - (1. - theta.cos()) / theta2 * s
    + (theta - theta.sin()) / (theta2 * theta) * s * s
}

// Rotation mapping the direction of `from` onto the direction of `to`.
// The antiparallel case has no unique solution; pick a deterministic
// orthogonal axis so repeated calls agree.
pub fn rotation_aligning(from: &Vector3d, to: &Vector3d) -> Quaterniond {
  assert!(from.norm() > 0. && to.norm() > 0.);
  match Quaterniond::rotation_between(from, to) {
    Some(q) => q,
    None => {
      let axis = orthogonal_unit(from);
      Quaterniond::from_axis_angle(&nalgebra::Unit::new_normalize(axis), std::f64::consts::PI)
    },
  }
}

fn orthogonal_unit(v: &Vector3d) -> Vector3d {
  // Cross with the world axis least aligned with `v`.
  let a = v.map(|x| x.abs());
  let e = if a[0] <= a[1] && a[0] <= a[2] {
    Vector3d::x()
  }
  else if a[1] <= a[2] {
    Vector3d::y()
  }
  else {
    Vector3d::z()
  };
  v.cross(&e).normalize()
}

pub fn is_near_axis_aligned(v: &Vector3d) -> bool {
  let n = v.norm();
  assert!(n > 0.);
  v.amax() / n >= NEAR_AXIS_COS
}

// Signed unit axis closest to the direction of `v`.
pub fn round_to_unit_axis(v: &Vector3d) -> Vector3d {
  let i = v.iamax();
  let mut axis = Vector3d::zeros();
  axis[i] = v[i].signum();
  axis
}
