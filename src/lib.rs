// Sliding-window stereo visual-inertial odometry back end: a time-indexed
// inertial measurement buffer, a preintegration engine with bias
// recentering, a factor-graph estimator over a horizon of keyframes, and the
// stationary bootstrap routines that precede it.

pub mod all;
pub mod camera;
pub mod estimator;
pub mod factor_graph;
pub mod imu_buffer;
pub mod init;
pub mod math;
pub mod optimize;
pub mod parameters;
pub mod preintegration;
pub mod types;
