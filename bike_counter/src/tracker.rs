// THEORY:
// The `tracker` module adds object permanence to the pipeline. It takes the
// stateless list of `Detection`s from a single frame and associates them with the
// objects it was tracking in previous frames, handing out stable `TrackId`s.
//
// The pipeline only consumes the `Tracker` contract. `IouTracker` is the built-in
// implementation used when no other tracker is plugged in:
// 1.  **Matching**: Greedy association on IoU. Every live track, best-first, claims
//     the unmatched detection it overlaps most, provided `1 - IoU` stays below
//     `max_iou_distance`.
// 2.  **Lifecycle**: An unmatched detection gives birth to a tentative track. A
//     tentative track becomes confirmed after `n_init` consecutive hits, and dies
//     on its first miss. A confirmed track survives up to `max_age` missed frames.
// 3.  **Identity**: IDs start at 1 and are never reused within one tracker, which
//     is what makes the session registry count unique objects.

use std::collections::HashSet;
use std::sync::Arc;

use image::RgbImage;

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::types::{BoundingBox, Detection, Track, TrackId};

pub trait Tracker: Send {
    /// Feed the detections of the current frame and get the live tracks back.
    fn update(&mut self, frame: &RgbImage, detections: &[Detection]) -> Result<Vec<Track>, TrackerError>;
}

/// Builds a fresh tracker for every new session.
pub type TrackerFactory = Arc<dyn Fn() -> Box<dyn Tracker> + Send + Sync>;

/// Factory producing [`IouTracker`]s with the given configuration.
pub fn iou_tracker_factory(config: TrackerConfig) -> TrackerFactory {
    Arc::new(move || Box::new(IouTracker::new(config.clone())) as Box<dyn Tracker>)
}

#[derive(Debug, Clone)]
struct TrackState {
    id: TrackId,
    bbox: BoundingBox,
    /// Consecutive frames this track has been matched.
    hits: u32,
    /// Frames since the track was last matched.
    frames_since_seen: u32,
    confirmed: bool,
}

impl TrackState {
    fn new(id: TrackId, bbox: BoundingBox, n_init: u32) -> Self {
        Self {
            id,
            bbox,
            hits: 1,
            frames_since_seen: 0,
            confirmed: n_init <= 1,
        }
    }

    fn hit(&mut self, bbox: BoundingBox, n_init: u32) {
        self.bbox = bbox;
        self.hits += 1;
        self.frames_since_seen = 0;
        if self.hits >= n_init {
            self.confirmed = true;
        }
    }

    fn to_track(&self) -> Track {
        Track {
            id: self.id,
            bbox: self.bbox,
            confirmed: self.confirmed,
        }
    }
}

pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<TrackState>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    fn associate(&self, detections: &[Detection]) -> Vec<(usize, usize)> {
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (i, track) in self.tracks.iter().enumerate() {
            for (j, det) in detections.iter().enumerate() {
                let distance = 1.0 - track.bbox.iou(&det.bbox);
                if distance < self.config.max_iou_distance {
                    candidates.push((distance, i, j));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_tracks = HashSet::new();
        let mut used_detections = HashSet::new();
        let mut matches = Vec::new();
        for (_, i, j) in candidates {
            if used_tracks.contains(&i) || used_detections.contains(&j) {
                continue;
            }
            used_tracks.insert(i);
            used_detections.insert(j);
            matches.push((i, j));
        }
        matches
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, _frame: &RgbImage, detections: &[Detection]) -> Result<Vec<Track>, TrackerError> {
        let n_init = self.config.n_init;
        let matches = self.associate(detections);

        // --- 1. Matched tracks ---
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_detections = vec![false; detections.len()];
        for &(i, j) in &matches {
            self.tracks[i].hit(detections[j].bbox, n_init);
            matched_tracks[i] = true;
            matched_detections[j] = true;
        }

        // --- 2. Misses: tentative tracks die at once, confirmed ones age out ---
        let max_age = self.config.max_age;
        let mut survivors = Vec::with_capacity(self.tracks.len());
        for (i, mut track) in std::mem::take(&mut self.tracks).into_iter().enumerate() {
            if !matched_tracks[i] {
                track.frames_since_seen += 1;
                track.hits = 0;
                if !track.confirmed || track.frames_since_seen > max_age {
                    continue;
                }
            }
            survivors.push(track);
        }

        // --- 3. Births ---
        for (j, det) in detections.iter().enumerate() {
            if !matched_detections[j] {
                survivors.push(TrackState::new(TrackId(self.next_id), det.bbox, n_init));
                self.next_id += 1;
            }
        }

        self.tracks = survivors;
        Ok(self.tracks.iter().map(TrackState::to_track).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32) -> Detection {
        Detection::new(BoundingBox::new(x, 10.0, x + 40.0, 60.0), 0.9, 0)
    }

    fn frame() -> RgbImage {
        RgbImage::new(8, 8)
    }

    fn confirmed_ids(tracks: &[Track]) -> Vec<u64> {
        tracks.iter().filter(|t| t.confirmed).map(|t| t.id.0).collect()
    }

    #[test]
    fn confirms_after_n_init_hits() {
        let mut tracker = IouTracker::new(TrackerConfig::default());
        let t1 = tracker.update(&frame(), &[det(0.0)]).unwrap();
        let t2 = tracker.update(&frame(), &[det(2.0)]).unwrap();
        assert!(confirmed_ids(&t1).is_empty());
        assert!(confirmed_ids(&t2).is_empty());
        let t3 = tracker.update(&frame(), &[det(4.0)]).unwrap();
        assert_eq!(confirmed_ids(&t3), vec![1]);
    }

    #[test]
    fn tentative_track_dies_on_first_miss() {
        let mut tracker = IouTracker::new(TrackerConfig::default());
        tracker.update(&frame(), &[det(0.0)]).unwrap();
        let tracks = tracker.update(&frame(), &[]).unwrap();
        assert!(tracks.is_empty());
        // Reappearing object gets a fresh identity.
        let tracks = tracker.update(&frame(), &[det(0.0)]).unwrap();
        assert_eq!(tracks[0].id, TrackId(2));
    }

    #[test]
    fn confirmed_track_survives_up_to_max_age() {
        let config = TrackerConfig {
            max_age: 2,
            n_init: 1,
            ..Default::default()
        };
        let mut tracker = IouTracker::new(config);
        assert_eq!(confirmed_ids(&tracker.update(&frame(), &[det(0.0)]).unwrap()), vec![1]);
        assert_eq!(tracker.update(&frame(), &[]).unwrap().len(), 1);
        assert_eq!(tracker.update(&frame(), &[]).unwrap().len(), 1);
        assert!(tracker.update(&frame(), &[]).unwrap().is_empty());
    }

    #[test]
    fn separate_objects_get_distinct_ids() {
        let config = TrackerConfig {
            n_init: 1,
            ..Default::default()
        };
        let mut tracker = IouTracker::new(config);
        let tracks = tracker.update(&frame(), &[det(0.0), det(200.0)]).unwrap();
        let mut ids = confirmed_ids(&tracks);
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        // Same objects, slightly moved: identities are kept.
        let tracks = tracker.update(&frame(), &[det(203.0), det(3.0)]).unwrap();
        let mut ids = confirmed_ids(&tracks);
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn factory_builds_independent_trackers() {
        let factory = iou_tracker_factory(TrackerConfig {
            n_init: 1,
            ..Default::default()
        });
        let mut a = factory();
        let mut b = factory();
        a.update(&frame(), &[det(0.0)]).unwrap();
        a.update(&frame(), &[det(300.0)]).unwrap();
        let tracks = b.update(&frame(), &[det(0.0)]).unwrap();
        assert_eq!(tracks[0].id, TrackId(1));
    }
}
