use std::{convert::TryFrom, path::Path};

use anyhow::{Context, Result};
use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use crate::{
    pose::{
        BoundingBox, ImageView, KEYPOINT_COUNT, Keypoint, PoseDetection, PoseError,
        PoseEstimator, PoseQuery, non_max_suppression,
    },
    tracker::IouTracker,
};

/// Box (4) + score (1) + 17 keypoints * (x, y, conf).
const POSE_CHANNELS: i64 = 5 + (KEYPOINT_COUNT as i64) * 3;
const MAX_DETECTIONS: usize = 128;

/// TorchScript YOLOv8-pose export wrapped as a [`PoseEstimator`].
pub struct TorchPoseDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    nms_iou: f32,
    tracker: IouTracker,
}

impl TorchPoseDetector {
    /// Load a TorchScript module onto `device`. `input_size` is the (width,
    /// height) the model was exported with.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self> {
        let path = model_path.as_ref();
        let module = tch::CModule::load_on_device(path, device)
            .with_context(|| format!("failed to load pose model {}", path.display()))?;
        Ok(Self {
            module,
            device,
            input_size,
            nms_iou: 0.45,
            tracker: IouTracker::default(),
        })
    }

    pub fn with_nms_iou(mut self, iou: f32) -> Self {
        self.nms_iou = iou;
        self
    }

    /// Packed BGR8 frame into a normalized RGB NCHW tensor at the model input size.
    fn bgr_to_tensor(&self, image: &ImageView<'_>) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(image.data)
            .to_device(self.device)
            .view([image.height as i64, image.width as i64, 3])
            .flip([2])
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            / 255.0;
        if (image.width as i64, image.height as i64) == (in_w, in_h) {
            tensor
        } else {
            tensor.upsample_bilinear2d([in_h, in_w], false, None, None)
        }
    }

    fn decode(
        &self,
        output: &Tensor,
        image: &ImageView<'_>,
        threshold: f32,
    ) -> Result<Vec<PoseDetection>, PoseError> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < POSE_CHANNELS {
            return Err(PoseError::MalformedOutput(format!(
                "expected [1, {POSE_CHANNELS}, N], got {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> =
            Vec::<Vec<f32>>::try_from(&preds).map_err(|e| PoseError::Backend(e.into()))?;

        let sx = image.width as f32 / self.input_size.0 as f32;
        let sy = image.height as f32 / self.input_size.1 as f32;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < POSE_CHANNELS as usize {
                continue;
            }
            let score = row[4];
            if !score.is_finite() || score < threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy);
            let mut detection = PoseDetection::new(bbox, score);
            for (k, slot) in detection.keypoints.iter_mut().enumerate() {
                let base = 5 + k * 3;
                *slot = Keypoint::new(row[base] * sx, row[base + 1] * sy, row[base + 2]);
            }
            detection.sanitize(image.width, image.height);
            detections.push(detection);
        }

        let mut kept = non_max_suppression(detections, self.nms_iou);
        kept.truncate(MAX_DETECTIONS);
        Ok(kept)
    }
}

impl PoseEstimator for TorchPoseDetector {
    fn estimate(
        &mut self,
        image: &ImageView<'_>,
        query: &PoseQuery,
    ) -> Result<Vec<PoseDetection>, PoseError> {
        let input = tch::no_grad(|| self.bgr_to_tensor(image));
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|e| PoseError::Backend(e.into()))?;
        let mut detections = self.decode(&output, image, query.confidence_threshold)?;

        if query.persist_tracks {
            self.tracker.update(&mut detections);
        } else {
            self.tracker.reset();
        }
        debug!(count = detections.len(), "pose inference complete");
        Ok(detections)
    }
}
