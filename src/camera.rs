use crate::all::*;

// Rectified stereo pinhole pair. The right camera sits at `baseline` along
// the positive x axis of the left one, so a world point projects to the same
// vertical coordinate in both images.
pub struct StereoCamera {
  pub fx: f64,
  pub fy: f64,
  pub cx: f64,
  pub cy: f64,
  // Meters.
  pub baseline: f64,
  // Fixed extrinsic from the body (IMU) frame to the left rectified camera.
  pub body_to_camera: RigidPose,
}

impl StereoCamera {
  pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, baseline: f64) -> StereoCamera {
    assert!(fx > 0. && fy > 0. && baseline > 0.);
    StereoCamera {
      fx, fy, cx, cy, baseline,
      body_to_camera: RigidPose::identity(),
    }
  }

  pub fn with_extrinsics(mut self, body_to_camera: RigidPose) -> StereoCamera {
    self.body_to_camera = body_to_camera;
    self
  }

  // World pose of the left camera given the body pose.
  pub fn camera_pose(&self, world_from_body: &RigidPose) -> RigidPose {
    world_from_body.compose(&self.body_to_camera)
  }

  // Projects a world point through both cameras. `None` when the point is
  // behind the image plane.
  pub fn project(&self, world_from_body: &RigidPose, point: &Vector3d) -> Option<StereoObservation> {
    let local = self.camera_pose(world_from_body).inverse().transform(point);
    if local[2] <= 0. { return None }
    let iz = 1. / local[2];
    Some(StereoObservation {
      left_x: self.fx * local[0] * iz + self.cx,
      right_x: self.fx * (local[0] - self.baseline) * iz + self.cx,
      y: self.fy * local[1] * iz + self.cy,
    })
  }

  // View rays of one stereo observation in world coordinates, paired with
  // the camera centers they emanate from.
  fn observation_rays(
    &self,
    world_from_body: &RigidPose,
    observation: &StereoObservation,
  ) -> [(Vector3d, Vector3d); 2] {
    let camera = self.camera_pose(world_from_body);
    let yn = (observation.y - self.cy) / self.fy;
    let left = Vector3d::new((observation.left_x - self.cx) / self.fx, yn, 1.);
    let right = Vector3d::new((observation.right_x - self.cx) / self.fx, yn, 1.);
    [
      (camera.translation, (camera.rotation * left).normalize()),
      (
        camera.transform(&Vector3d::new(self.baseline, 0., 0.)),
        (camera.rotation * right).normalize(),
      ),
    ]
  }

  // Linear multi-view triangulation over all rays of a track: each ray
  // contributes the projector onto its orthogonal complement. `None` when
  // the ray system is (near-)degenerate.
  pub fn triangulate(
    &self,
    observations: &[(&RigidPose, StereoObservation)],
  ) -> Option<Vector3d> {
    let mut s = Matrix3d::zeros();
    let mut t = Vector3d::zeros();
    for (world_from_body, observation) in observations {
      for (center, ray) in self.observation_rays(world_from_body, observation) {
        let a = Matrix3d::identity() - ray * ray.transpose();
        s += a;
        t += a * center;
      }
    }
    let inv_s = s.try_inverse()?;
    let point = inv_s * t;
    if !point.iter().all(|x| x.is_finite()) { return None }
    Some(point)
  }
}
