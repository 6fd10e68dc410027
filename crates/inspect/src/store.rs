//! Persisted per-camera overrides.

use {
    crate::PersistError,
    camera::{CameraId, OverrideMap, ParameterOverrides},
    std::{
        collections::BTreeMap,
        fs,
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

/// Key-value store of operator overrides, read at session configuration and written back on
/// every live change.
pub trait OverrideStore: Send + Sync {
    fn load(&self) -> Result<OverrideMap, PersistError>;

    /// Merge `overrides` into what is stored for `camera`.
    fn save(&self, camera: &CameraId, overrides: &ParameterOverrides) -> Result<(), PersistError>;
}

#[derive(Debug, Default)]
pub struct MemoryOverrideStore {
    map: Mutex<OverrideMap>,
}

impl MemoryOverrideStore {
    pub fn new(map: OverrideMap) -> Self {
        Self { map: Mutex::new(map) }
    }
}

impl OverrideStore for MemoryOverrideStore {
    fn load(&self) -> Result<OverrideMap, PersistError> {
        Ok(self.map.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, camera: &CameraId, overrides: &ParameterOverrides) -> Result<(), PersistError> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        let merged = map.get(camera).cloned().unwrap_or_default().merged(overrides);
        map.insert(camera.clone(), merged);
        Ok(())
    }
}

/// A JSON object keyed by camera id. A missing file is an empty store.
#[derive(Debug)]
pub struct JsonOverrideStore {
    path: PathBuf,
    // serializes read-modify-write in save
    lock: Mutex<()>,
}

impl JsonOverrideStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<OverrideMap, PersistError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(OverrideMap::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn write(&self, map: &OverrideMap) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let sorted: BTreeMap<&CameraId, &ParameterOverrides> = map.iter().collect();
        let json = serde_json::to_vec_pretty(&sorted)?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, json)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

impl OverrideStore for JsonOverrideStore {
    fn load(&self) -> Result<OverrideMap, PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    fn save(&self, camera: &CameraId, overrides: &ParameterOverrides) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read()?;
        let merged = map.get(camera).cloned().unwrap_or_default().merged(overrides);
        map.insert(camera.clone(), merged);
        self.write(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(value: f64) -> ParameterOverrides {
        ParameterOverrides {
            exposure: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let path = std::env::temp_dir().join(format!("inspect_store_missing_{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        assert!(JsonOverrideStore::new(&path).load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_save_merges_and_persists() {
        let path = std::env::temp_dir().join(format!("inspect_store_{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        let store = JsonOverrideStore::new(&path);
        let camera = CameraId::from("a");

        store.save(&camera, &exposure(1000.0)).unwrap();
        store
            .save(
                &camera,
                &ParameterOverrides {
                    gain: Some(4.0),
                    ..Default::default()
                },
            )
            .unwrap();

        let reopened = JsonOverrideStore::new(&path).load().unwrap();
        assert_eq!(reopened[&camera].exposure, Some(1000.0));
        assert_eq!(reopened[&camera].gain, Some(4.0));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let path = std::env::temp_dir().join(format!("inspect_store_bad_{}.json", std::process::id()));
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            JsonOverrideStore::new(&path).load(),
            Err(PersistError::Serialize(_))
        ));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_memory_store_round() {
        let store = MemoryOverrideStore::default();
        store.save(&CameraId::from("b"), &exposure(20.0)).unwrap();
        assert_eq!(store.load().unwrap()[&CameraId::from("b")].exposure, Some(20.0));
    }
}
