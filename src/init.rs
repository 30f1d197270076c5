// Stationary-IMU bootstrap: gravity-alignment orientation and initial bias,
// computed from a batch of samples taken while the body is at rest. Runs
// before the estimator is constructed.

use crate::all::*;

// Orientation whose rotation maps the measured "up" direction onto the world
// gravity direction. A stationary accelerometer measures the negative of
// gravity, so the measured direction is the negated sample mean. The
// translation is irrelevant for gravity alignment and returned as zero.
//
// With `round_to_nearest_axis`, a (near-)axis-aligned target gravity is
// snapped to the nearest signed unit axis first, suppressing small
// perturbations of the alignment; for other targets rounding is a no-op.
pub fn estimate_initial_orientation(
  samples: &[InertialSample],
  world_gravity: &Vector3d,
  round_to_nearest_axis: bool,
) -> Result<RigidPose> {
  if samples.is_empty() {
    bail!("Orientation bootstrap needs at least one stationary sample.");
  }
  if world_gravity.norm() == 0. {
    bail!("World gravity must be non-zero.");
  }
  let measured = -mean_accel(samples);
  if measured.norm() == 0. {
    bail!("Stationary accelerometer mean is zero; cannot align with gravity.");
  }

  let target = if round_to_nearest_axis && is_near_axis_aligned(world_gravity) {
    round_to_unit_axis(world_gravity)
  }
  else {
    *world_gravity
  };

  Ok(RigidPose::new(
    rotation_aligning(&measured, &target),
    Vector3d::zeros(),
  ))
}

// Closed-form stationary bias: the true angular rate is zero, so the gyro
// bias is the sample mean; the accelerometer should read the negative of
// gravity, so its bias is the mean plus gravity.
pub fn estimate_initial_bias(
  samples: &[InertialSample],
  world_gravity: &Vector3d,
) -> Result<SensorBias> {
  if samples.is_empty() {
    bail!("Bias bootstrap needs at least one stationary sample.");
  }
  let n = samples.len() as f64;
  let gyro = samples.iter().fold(Vector3d::zeros(), |acc, s| acc + s.gyro) / n;
  Ok(SensorBias::new(mean_accel(samples) + world_gravity, gyro))
}

fn mean_accel(samples: &[InertialSample]) -> Vector3d {
  samples.iter().fold(Vector3d::zeros(), |acc, s| acc + s.accel) / samples.len() as f64
}

#[cfg(test)]
mod tests {
  use super::*;

  const TOL: f64 = 1e-7;

  fn stationary_batch(n: usize, accel: Vector3d, gyro: Vector3d) -> Vec<InertialSample> {
    (0..n).map(|i| InertialSample {
      time: (i as Timestamp + 1) * 1_000_000,
      accel,
      gyro,
    }).collect()
  }

  #[test]
  fn test_orientation_recovers_gravity_direction() {
    // Pairs of (measured direction, world gravity), including already
    // aligned, antiparallel and rotated targets.
    let tilted = Quaterniond::from_scaled_axis(Vector3d::new(0.1, 1., 0.5))
      * Vector3d::new(9.8, -1., 0.);
    let cases = [
      (Vector3d::new(9.8, 1., 0.), Vector3d::new(0., 0., -9.8)),
      (Vector3d::new(0., -9.8, 0.), Vector3d::new(0., -9.8, 0.)),
      (Vector3d::new(0., 0., -9.8), Vector3d::new(0., 0., 9.8)),
      (Vector3d::new(9.8, 0., 0.), Vector3d::new(0., -9.8, 0.)),
      (Vector3d::new(9.8, -1., 0.), tilted),
    ];
    for (a, gravity) in cases {
      // The accelerometer measures the opposite of the local gravity
      // direction `a`.
      let batch = stationary_batch(10, -a, Vector3d::zeros());
      let pose = estimate_initial_orientation(&batch, &gravity, false).unwrap();

      assert_eq!(pose.translation, Vector3d::zeros());
      let aligned = pose.rotation * a;
      assert!((aligned.normalize() - gravity.normalize()).norm() < TOL);
    }
  }

  #[test]
  fn test_rounding_filters_perturbation() {
    for gravity in [
      Vector3d::new(0., -9.8, 0.),
      Vector3d::new(0., 0., 9.8),
    ] {
      for a in [
        Vector3d::new(0., -9.8, 0.),
        Vector3d::new(0., 0., -9.8),
        Vector3d::new(9.8, 0., 0.),
      ] {
        let batch = stationary_batch(10, -a, Vector3d::zeros());
        let plain = estimate_initial_orientation(&batch, &gravity, false).unwrap();

        // Rounding does not change the result for an exactly aligned target.
        let rounded = estimate_initial_orientation(&batch, &gravity, true).unwrap();
        assert!(so3_log(&(plain.rotation.inverse() * rounded.rotation)).norm() < TOL);

        // A perturbed target is filtered out when rounding...
        let perturbed = gravity + Vector3d::new(-0.1, 0.1, 0.3);
        let filtered = estimate_initial_orientation(&batch, &perturbed, true).unwrap();
        assert!(so3_log(&(plain.rotation.inverse() * filtered.rotation)).norm() < TOL);

        // ...and visible without it.
        let unfiltered = estimate_initial_orientation(&batch, &perturbed, false).unwrap();
        assert!(so3_log(&(plain.rotation.inverse() * unfiltered.rotation)).norm() > 1e-3);
      }
    }
  }

  #[test]
  fn test_bias_closed_form_on_seeded_random_batch() {
    use rand::Rng;
    use rand::SeedableRng;
    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(0);
    let gravity = Vector3d::new(1.1, 2.2, 3.3);

    let n = 100;
    let samples: Vec<InertialSample> = (0..n).map(|i| InertialSample {
      time: (i as Timestamp + 1) * 1_000_000,
      accel: Vector3d::new(rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0)),
      gyro: Vector3d::new(rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0)),
    }).collect();

    let mut accel_mean = Vector3d::zeros();
    let mut gyro_mean = Vector3d::zeros();
    for s in &samples {
      accel_mean += s.accel;
      gyro_mean += s.gyro;
    }
    accel_mean /= n as f64;
    gyro_mean /= n as f64;

    let bias = estimate_initial_bias(&samples, &gravity).unwrap();
    assert!((bias.accel - (accel_mean + gravity)).norm() < TOL);
    assert!((bias.gyro - gyro_mean).norm() < TOL);
  }

  #[test]
  fn test_empty_batches_are_errors() {
    let gravity = Vector3d::new(0., 0., -9.81);
    assert!(estimate_initial_orientation(&[], &gravity, false).is_err());
    assert!(estimate_initial_bias(&[], &gravity).is_err());
  }
}
