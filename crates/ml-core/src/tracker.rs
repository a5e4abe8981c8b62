//! Frame-to-frame identity for detections using box overlap.

use crate::pose::{BoundingBox, PoseDetection};

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    missed: u32,
}

/// Greedy IoU tracker. A detection inherits the id of the live track it
/// overlaps most (above `iou_threshold`); unmatched detections open new
/// tracks and tracks unmatched for more than `max_missed` calls are dropped.
#[derive(Clone, Debug)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u64,
    iou_threshold: f32,
    max_missed: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(0.3, 30)
    }
}

impl IouTracker {
    pub fn new(iou_threshold: f32, max_missed: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_missed,
        }
    }

    /// Stamp `track_id` on every detection.
    pub fn update(&mut self, detections: &mut [PoseDetection]) {
        let mut pairs = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];
        for (_, ti, di) in pairs {
            if track_taken[ti] || det_taken[di] {
                continue;
            }
            track_taken[ti] = true;
            det_taken[di] = true;
            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.missed = 0;
            detections[di].track_id = Some(track.id);
        }

        for (track, taken) in self.tracks.iter_mut().zip(&track_taken) {
            if !taken {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracks.retain(|t| t.missed <= max_missed);

        for (det, taken) in detections.iter_mut().zip(det_taken) {
            if taken {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            det.track_id = Some(id);
            self.tracks.push(Track {
                id,
                bbox: det.bbox,
                missed: 0,
            });
        }
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}
