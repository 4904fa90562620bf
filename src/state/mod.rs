use crate::model::{now_unix_ms, Device, DeviceId, DeviceState};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Per-device accumulated state. Merge and snapshot take the same lock, so a
/// reader sees either the map before a partial update or after it.
#[derive(Debug, Default)]
pub struct DeviceStateStore {
    devices: RwLock<HashMap<DeviceId, DeviceState>>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_partial(&self, device_id: DeviceId, fields: &Map<String, Value>) -> DeviceState {
        let mut devices = write(&self.devices);
        let state = devices
            .entry(device_id)
            .or_insert_with(|| DeviceState::new(device_id));
        for (key, value) in fields {
            state.fields.insert(key.clone(), value.clone());
        }
        state.last_updated_unix_ms = now_unix_ms();
        state.clone()
    }

    pub fn snapshot(&self, device_id: DeviceId) -> Option<DeviceState> {
        read(&self.devices).get(&device_id).cloned()
    }

    pub fn snapshots(&self) -> Vec<DeviceState> {
        let mut states: Vec<DeviceState> = read(&self.devices).values().cloned().collect();
        states.sort_by_key(|s| s.device_id);
        states
    }

    pub fn len(&self) -> usize {
        read(&self.devices).len()
    }
}

/// Device catalog from the latest directory response; replaced wholesale.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    devices: RwLock<Vec<Device>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, devices: Vec<Device>) {
        *write(&self.devices) = devices;
    }

    pub fn list(&self) -> Vec<Device> {
        read(&self.devices).clone()
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Device> {
        read(&self.devices)
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
    }
}

/// One-shot "devices ready" condition.
#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that flipped the signal.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn partial_updates_merge_last_write_wins() {
        let store = DeviceStateStore::new();
        let updates = [
            json!({ "guard": "SafeGuardOff", "speed": 0, "geo": { "lat": 1.0, "lon": 2.0 } }),
            json!({ "speed": 42, "alarm": "None" }),
            json!({ "guard": "SafeGuardOn", "geo": { "lat": 3.0, "lon": 4.0 } }),
        ];

        let mut expected = Map::new();
        for update in &updates {
            let update = fields(update.clone());
            store.apply_partial(7, &update);
            for (k, v) in update {
                expected.insert(k, v);
            }
        }

        let snapshot = store.snapshot(7).unwrap();
        assert_eq!(snapshot.fields, expected);
        assert_eq!(snapshot.field_str("guard"), Some("SafeGuardOn"));
        assert_eq!(snapshot.field("speed"), Some(&json!(42)));
        assert_eq!(snapshot.field("geo.lat"), Some(&json!(3.0)));
        assert!(snapshot.last_updated_unix_ms > 0);
    }

    #[test]
    fn unknown_device_starts_empty_and_empty_update_still_touches() {
        let store = DeviceStateStore::new();
        assert!(store.snapshot(3).is_none());

        let merged = store.apply_partial(3, &Map::new());
        assert!(merged.fields.is_empty());
        assert!(merged.last_updated_unix_ms > 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn apply_partial_returns_merged_snapshot() {
        let store = DeviceStateStore::new();
        store.apply_partial(1, &fields(json!({ "a": 1 })));
        let merged = store.apply_partial(1, &fields(json!({ "b": 2 })));
        assert_eq!(merged.fields, fields(json!({ "a": 1, "b": 2 })));
    }

    #[test]
    fn concurrent_readers_never_see_half_merged_maps() {
        let store = Arc::new(DeviceStateStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    store.apply_partial(1, &fields(json!({ "x": i, "y": i })));
                }
            })
        };
        for _ in 0..500 {
            if let Some(snapshot) = store.snapshot(1) {
                assert_eq!(snapshot.field("x"), snapshot.field("y"));
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn directory_is_replaced_wholesale() {
        let directory = DeviceDirectory::new();
        directory.replace(vec![
            Device { device_id: 1, name: Some("A".into()), model: None },
            Device { device_id: 2, name: None, model: None },
        ]);
        directory.replace(vec![Device { device_id: 3, name: None, model: None }]);
        assert_eq!(directory.list().len(), 1);
        assert!(directory.get(1).is_none());
        assert!(directory.get(3).is_some());
    }

    #[tokio::test]
    async fn ready_signal_sets_once() {
        let ready = ReadySignal::new();
        assert!(!ready.is_set());
        assert!(ready.set());
        assert!(!ready.set());
        assert!(ready.is_set());
        assert!(ready.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_wait_times_out_when_unset() {
        let ready = ReadySignal::new();
        assert!(!ready.wait(Duration::from_secs(30)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_wait_wakes_when_set_later() {
        let ready = std::sync::Arc::new(ReadySignal::new());
        let waiter = {
            let ready = ready.clone();
            tokio::spawn(async move { ready.wait(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(ready.set());
        assert!(waiter.await.unwrap());
    }
}
