//! Per-device state store
//!
//! Owns every piece of mutable per-device data: the latest status
//! snapshot, the current map raster, the accumulated path trace and the
//! render cache. The telemetry router is the only writer on the socket
//! path; readers (status accessors, map rendering) go through the same
//! mutex so a future second writer cannot race it.
//!
//! Consumers that want push-style updates subscribe to a change channel
//! instead of holding references into the store.

use crate::map::RenderCache;
use crate::protocol::messages::{MapRaster, PathBatch, PathMeta, StatusSnapshot};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// Which part of the device state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Status,
    Map,
    Path,
}

/// Accumulated path trace for the active cleaning run
#[derive(Debug, Default)]
pub struct PathTrace {
    /// Path the held points belong to
    pub path_id: Option<i64>,
    /// Traversed points in device millimeters, arrival order
    pub points: Vec<[f64; 2]>,
    /// Last metadata frame for this path
    pub meta: Option<PathMeta>,
}

/// Mutable snapshot of one device
#[derive(Default)]
pub struct DeviceState {
    status: StatusSnapshot,
    map: Option<MapRaster>,
    path: PathTrace,
    render: RenderCache,
    version: u64,
    subscribers: Vec<Sender<StateEvent>>,
}

/// Shared handle to a device's state store
pub type SharedDeviceState = Arc<Mutex<DeviceState>>;

pub fn shared() -> SharedDeviceState {
    Arc::new(Mutex::new(DeviceState::new()))
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the status snapshot wholesale.
    pub fn apply_status(&mut self, status: StatusSnapshot) {
        self.status = status;
        // Robot position rides on the status frame
        self.render.mark_overlay_dirty();
        self.notify(StateEvent::Status);
    }

    /// Replace the map raster wholesale.
    pub fn apply_map(&mut self, raster: MapRaster) {
        self.map = Some(raster);
        self.render.mark_raster_dirty();
        self.notify(StateEvent::Map);
    }

    /// Replace the path metadata, leaving the points untouched.
    pub fn apply_path_meta(&mut self, meta: PathMeta) {
        if let Some(id) = meta.path_id {
            self.path.path_id.get_or_insert(id);
        }
        self.path.meta = Some(meta);
        self.notify(StateEvent::Path);
    }

    /// Append a path batch under the idempotent-append rule.
    ///
    /// A new path id clears the trace first. The batch only lands when its
    /// declared start offset equals the held point count exactly; anything
    /// else is a duplicate or out-of-order delivery and is discarded
    /// without touching the trace.
    pub fn apply_path_batch(&mut self, batch: PathBatch) {
        if batch.points.is_empty() {
            return;
        }
        if self.path.path_id != Some(batch.path_id) {
            self.path.points.clear();
            self.path.path_id = Some(batch.path_id);
            self.render.mark_overlay_dirty();
        }
        if batch.start_pos != self.path.points.len() {
            log::debug!(
                "dropping path batch at offset {} (trace holds {} points)",
                batch.start_pos,
                self.path.points.len()
            );
            return;
        }
        self.path.points.extend_from_slice(&batch.points);
        self.render.mark_overlay_dirty();
        self.notify(StateEvent::Path);
    }

    /// Latest status snapshot.
    pub fn status(&self) -> &StatusSnapshot {
        &self.status
    }

    /// Current map raster, if one has arrived.
    pub fn map(&self) -> Option<&MapRaster> {
        self.map.as_ref()
    }

    /// Accumulated path trace.
    pub fn path(&self) -> &PathTrace {
        &self.path
    }

    /// Monotonic update counter, for poll-style consumers.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Where the next REST path page should start: `(path_id, offset)`.
    ///
    /// Falls back to the raster's path id when no batch has named one yet.
    pub fn path_cursor(&mut self) -> Option<(i64, usize)> {
        if self.path.path_id.is_none() {
            self.path.path_id = self.map.as_ref().and_then(|m| m.path_id);
        }
        self.path.path_id.map(|id| (id, self.path.points.len()))
    }

    /// Render the current map, or the placeholder before the first raster.
    ///
    /// Never fails: a render error is logged and the placeholder served.
    pub fn map_image(&mut self) -> Vec<u8> {
        let robot = self.status.pos;
        match self.render.image(self.map.as_ref(), &self.path.points, robot) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("map render failed: {e}; serving placeholder");
                self.render.placeholder().unwrap_or_default()
            }
        }
    }

    /// Register a change-event subscriber.
    pub fn subscribe(&mut self) -> Receiver<StateEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: StateEvent) {
        self.version = self.version.wrapping_add(1);
        // Prune subscribers that went away; unbounded sends never block
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

/// Convenience for callers holding the shared handle.
pub fn subscribe(state: &SharedDeviceState) -> Receiver<StateEvent> {
    state.lock().subscribe()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::CleanMode;

    fn batch(path_id: i64, start_pos: usize, points: &[[f64; 2]]) -> PathBatch {
        PathBatch {
            path_id,
            start_pos,
            points: points.to_vec(),
        }
    }

    #[test]
    fn test_status_replaced_wholesale() {
        let mut state = DeviceState::new();
        assert_eq!(state.status().mode, CleanMode::Charge);

        state.apply_status(StatusSnapshot {
            mode: CleanMode::Sweep,
            battery: 55,
            fan_speed: Some("strong".into()),
            ..Default::default()
        });
        assert_eq!(state.status().mode, CleanMode::Sweep);
        assert_eq!(state.status().battery, 55);

        // A later frame without fan speed clears it: no field merging
        state.apply_status(StatusSnapshot {
            mode: CleanMode::Pause,
            battery: 54,
            ..Default::default()
        });
        assert_eq!(state.status().fan_speed, None);
    }

    #[test]
    fn test_path_append_requires_exact_offset() {
        let mut state = DeviceState::new();
        state.apply_path_batch(batch(1, 0, &[[0.0, 0.0], [10.0, 0.0]]));
        assert_eq!(state.path().points.len(), 2);

        // Behind the trace: duplicate delivery, dropped
        state.apply_path_batch(batch(1, 1, &[[99.0, 99.0]]));
        assert_eq!(state.path().points.len(), 2);
        assert_eq!(state.path().points[1], [10.0, 0.0]);

        // Ahead of the trace: out-of-order delivery, dropped
        state.apply_path_batch(batch(1, 5, &[[99.0, 99.0]]));
        assert_eq!(state.path().points.len(), 2);

        // Exact offset appends in order
        state.apply_path_batch(batch(1, 2, &[[20.0, 0.0], [30.0, 0.0]]));
        assert_eq!(state.path().points.len(), 4);
        assert_eq!(state.path().points[3], [30.0, 0.0]);
    }

    #[test]
    fn test_new_path_id_clears_trace() {
        let mut state = DeviceState::new();
        state.apply_path_batch(batch(1, 0, &[[0.0, 0.0], [10.0, 0.0]]));

        state.apply_path_batch(batch(2, 0, &[[5.0, 5.0]]));
        assert_eq!(state.path().path_id, Some(2));
        assert_eq!(state.path().points, vec![[5.0, 5.0]]);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut state = DeviceState::new();
        state.apply_path_batch(batch(1, 0, &[[0.0, 0.0]]));
        state.apply_path_batch(batch(2, 0, &[]));
        // An empty batch must not even switch the path id
        assert_eq!(state.path().path_id, Some(1));
        assert_eq!(state.path().points.len(), 1);
    }

    #[test]
    fn test_path_cursor_falls_back_to_raster() {
        let mut state = DeviceState::new();
        assert_eq!(state.path_cursor(), None);

        state.apply_map(MapRaster {
            map: String::new(),
            width: 1,
            height: 1,
            x_min: 0.0,
            y_min: 0.0,
            resolution: 0.05,
            path_id: Some(9),
        });
        assert_eq!(state.path_cursor(), Some((9, 0)));

        state.apply_path_batch(batch(9, 0, &[[0.0, 0.0]]));
        assert_eq!(state.path_cursor(), Some((9, 1)));
    }

    #[test]
    fn test_change_events_and_version() {
        let mut state = DeviceState::new();
        let rx = state.subscribe();
        let v0 = state.version();

        state.apply_status(StatusSnapshot::default());
        state.apply_path_batch(batch(1, 0, &[[0.0, 0.0]]));
        // Dropped batch: no event, no version bump
        state.apply_path_batch(batch(1, 7, &[[1.0, 1.0]]));

        assert_eq!(rx.try_recv(), Ok(StateEvent::Status));
        assert_eq!(rx.try_recv(), Ok(StateEvent::Path));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.version(), v0 + 2);
    }

    #[test]
    fn test_dead_subscribers_pruned() {
        let mut state = DeviceState::new();
        let rx = state.subscribe();
        drop(rx);
        state.apply_status(StatusSnapshot::default());
        assert!(state.subscribers.is_empty());
    }

    #[test]
    fn test_map_image_without_raster_is_placeholder() {
        let mut state = DeviceState::new();
        let first = state.map_image();
        let second = state.map_image();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }
}
