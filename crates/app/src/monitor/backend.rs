//! Construction of the heavy capture and inference backends.
//!
//! Both are behind cargo features; a build without them still runs the rest of
//! the monitor but fails at startup with a clear message.

use anyhow::Result;
use ml_core::PoseEstimator;
use video_ingest::CaptureDevice;

use crate::monitor::config::MonitorConfig;

#[cfg(feature = "opencv")]
pub(crate) fn open_capture(config: &MonitorConfig) -> Result<Box<dyn CaptureDevice>> {
    let camera = video_ingest::OpenCvCamera::new(config.source.clone(), (config.width, config.height));
    tracing::debug!(source = %config.source, "capture backend: OpenCV");
    Ok(Box::new(camera))
}

#[cfg(not(feature = "opencv"))]
pub(crate) fn open_capture(config: &MonitorConfig) -> Result<Box<dyn CaptureDevice>> {
    anyhow::bail!(
        "cannot open camera `{}`: built without the `opencv` feature (rebuild with --features opencv)",
        config.source
    )
}

#[cfg(feature = "with-tch")]
pub(crate) fn load_pose_estimator(config: &MonitorConfig) -> Result<Box<dyn PoseEstimator>> {
    use anyhow::Context;
    use ml_core::tch::{Cuda, Device};

    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    tracing::debug!(
        "CUDA available: {} (devices: {})",
        Cuda::is_available(),
        Cuda::device_count()
    );

    let size = config.detector_size as i64;
    let detector = ml_core::TorchPoseDetector::new(&config.model_path, device, (size, size))
        .with_context(|| format!("Failed to initialise pose detector on {device:?}"))?;
    tracing::info!(model = %config.model_path.display(), device = ?device, "pose model loaded");
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
pub(crate) fn load_pose_estimator(config: &MonitorConfig) -> Result<Box<dyn PoseEstimator>> {
    anyhow::bail!(
        "cannot load pose model {}: built without the `with-tch` feature (rebuild with --features with-tch)",
        config.model_path.display()
    )
}
