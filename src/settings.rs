//! Persisted settings: last parameter snapshot and device selections.
//!
//! The store is a flat key-value map of JSON values. Values are restored by
//! merging over defaults field by field, so snapshots written by older
//! versions (missing fields, renamed fields) still load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Key of the effect parameter snapshot.
pub const PARAMS_KEY: &str = "micdeck.params";
/// Key of the selected input device id.
pub const INPUT_DEVICE_KEY: &str = "micdeck.device.input";
/// Key of the selected main output device id.
pub const OUTPUT_DEVICE_KEY: &str = "micdeck.device.output";
/// Key of the selected monitor output device id.
pub const MONITOR_DEVICE_KEY: &str = "micdeck.device.monitor";

/// A key-value settings backend.
pub trait SettingsStore {
    /// Value stored under `key`, if any.
    fn load(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`.
    fn save(&mut self, key: &str, value: Value) -> Result<()>;

    /// Remove `key`.
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Settings kept in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: BTreeMap<String, Value>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn save(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Settings persisted to a single JSON file.
///
/// The whole file is rewritten on every save. A missing file starts empty; a
/// corrupt one is logged and replaced on the next save.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl JsonFileSettings {
    /// Open (or prepare to create) the settings file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(values) => values,
                Err(err) => {
                    warn!(path = %path.display(), %err, "ignoring unreadable settings file");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(Error::settings_io(&path, err)),
        };
        debug!(path = %path.display(), keys = values.len(), "settings loaded");
        Ok(Self { path, values })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| Error::settings_io(dir, e))?;
        }
        let text = serde_json::to_string_pretty(&self.values)?;
        fs::write(&self.path, text).map_err(|e| Error::settings_io(&self.path, e))
    }
}

impl SettingsStore for JsonFileSettings {
    fn load(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn save(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_owned(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// Overlay the fields of `stored` onto `T::default()`.
///
/// Only fields the default carries are taken, and only when their JSON type
/// matches; everything else keeps its default.
pub fn merge_over_defaults<T>(stored: Option<&Value>) -> T
where
    T: Serialize + DeserializeOwned + Default,
{
    let Ok(Value::Object(mut base)) = serde_json::to_value(T::default()) else {
        return T::default();
    };
    if let Some(Value::Object(stored)) = stored {
        for (key, slot) in base.iter_mut() {
            match stored.get(key) {
                Some(v) if same_kind(slot, v) => *slot = v.clone(),
                Some(v) => warn!(field = %key, value = %v, "ignoring stored setting of the wrong type"),
                None => {}
            }
        }
    }
    serde_json::from_value(Value::Object(base)).unwrap_or_default()
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

/// Read a string setting.
pub fn load_string(store: &impl SettingsStore, key: &str) -> Option<String> {
    match store.load(key)? {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}
