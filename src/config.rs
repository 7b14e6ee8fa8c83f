//! Persistent application settings.
//!
//! Values live in a flat map of `group/key` entries serialised as a JSON
//! object. A [`Config`] opened on a path writes the file after every
//! mutation; an in-memory one never touches the disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::enums::Colormap;

pub const MAX_RECENT_FILES: usize = 10;
const RECENT_FILES: &str = "recentFiles";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config file {0} does not hold a JSON object")]
    NotAnObject(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSettings {
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
    pub maximized: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
            x: 100,
            y: 100,
            maximized: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderingSettings {
    /// RGB in `0..=1`.
    pub background: [f64; 3],
    pub interpolate: bool,
    pub max_texture_size: u32,
}

impl Default for RenderingSettings {
    fn default() -> Self {
        Self {
            background: [0.0, 0.0, 0.0],
            interpolate: true,
            max_texture_size: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessingSettings {
    pub default_window_width: f64,
    pub default_window_level: f64,
    pub default_colormap: Colormap,
    /// Size of the processing thread pool; 0 lets rayon decide.
    pub worker_threads: usize,
}

impl Default for ImageProcessingSettings {
    fn default() -> Self {
        Self {
            default_window_width: 400.0,
            default_window_level: 40.0,
            default_colormap: Colormap::Gray,
            worker_threads: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    values: BTreeMap<String, Value>,
    path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Config {
    store: Mutex<Store>,
}

impl Default for Config {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Config {
    /// Defaults only, never persisted.
    pub fn in_memory() -> Self {
        let mut store = Store::default();
        ensure_defaults(&mut store.values);
        Self {
            store: Mutex::new(store),
        }
    }

    /// Opens the store at `path`, creating it with defaults when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut values = if path.exists() {
            read_values(&path)?
        } else {
            BTreeMap::new()
        };
        ensure_defaults(&mut values);
        write_values(&path, &values)?;
        debug!("config opened at {}", path.display());
        Ok(Self {
            store: Mutex::new(Store {
                values,
                path: Some(path),
            }),
        })
    }

    /// `$MEDIMG_CONFIG`, else `$XDG_CONFIG_HOME/medimg/config.json`, else
    /// `$HOME/.config/medimg/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        let var = |name: &str| std::env::var_os(name).filter(|v| !v.is_empty());
        if let Some(path) = var("MEDIMG_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let base = var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| var("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("medimg").join("config.json"))
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    pub fn set_value(&self, key: &str, value: impl Into<Value>) -> Result<(), ConfigError> {
        self.mutate(|values| {
            values.insert(key.to_string(), value.into());
        })
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().values.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Result<(), ConfigError> {
        self.mutate(|values| {
            values.remove(key);
        })
    }

    pub fn clear(&self) -> Result<(), ConfigError> {
        self.mutate(BTreeMap::clear)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().values.keys().cloned().collect()
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.value(key) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.value(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(b),
            _ => default,
        }
    }

    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        match self.value(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.value(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn window_settings(&self) -> WindowSettings {
        self.group("window")
    }

    pub fn set_window_settings(&self, settings: &WindowSettings) -> Result<(), ConfigError> {
        self.set_group("window", settings)
    }

    pub fn rendering_settings(&self) -> RenderingSettings {
        self.group("rendering")
    }

    pub fn set_rendering_settings(&self, settings: &RenderingSettings) -> Result<(), ConfigError> {
        self.set_group("rendering", settings)
    }

    pub fn image_processing_settings(&self) -> ImageProcessingSettings {
        self.group("imageProcessing")
    }

    pub fn set_image_processing_settings(
        &self,
        settings: &ImageProcessingSettings,
    ) -> Result<(), ConfigError> {
        self.set_group("imageProcessing", settings)
    }

    /// Most recent first.
    pub fn recent_files(&self) -> Vec<String> {
        match self.value(RECENT_FILES) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn add_recent_file(&self, path: &str) -> Result<(), ConfigError> {
        let mut files = self.recent_files();
        files.retain(|file| file != path);
        files.insert(0, path.to_string());
        files.truncate(MAX_RECENT_FILES);
        self.set_value(RECENT_FILES, files)
    }

    pub fn clear_recent_files(&self) -> Result<(), ConfigError> {
        self.set_value(RECENT_FILES, Vec::<String>::new())
    }

    /// Replaces every value with the contents of `path`, which becomes the
    /// write-through target.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let mut values = read_values(path)?;
        ensure_defaults(&mut values);
        let mut store = self.lock();
        store.values = values;
        store.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let store = self.lock();
        write_values(path.as_ref(), &store.values)
    }

    pub fn load_defaults(&self) -> Result<(), ConfigError> {
        self.mutate(|values| {
            values.clear();
            ensure_defaults(values);
        })
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, change: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<(), ConfigError> {
        let mut store = self.lock();
        let mut values = store.values.clone();
        change(&mut values);
        if let Some(path) = &store.path {
            write_values(path, &values)?;
        }
        store.values = values;
        Ok(())
    }

    /// Reads the fields of `T` from `prefix/field` keys; missing or
    /// malformed fields keep their defaults.
    fn group<T: Default + Serialize + DeserializeOwned>(&self, prefix: &str) -> T {
        let Ok(Value::Object(mut fields)) = serde_json::to_value(T::default()) else {
            return T::default();
        };
        let store = self.lock();
        for (field, value) in fields.iter_mut() {
            if let Some(stored) = store.values.get(&format!("{prefix}/{field}")) {
                *value = stored.clone();
            }
        }
        drop(store);
        serde_json::from_value(Value::Object(fields)).unwrap_or_else(|err| {
            warn!("invalid {prefix} settings, using defaults: {err}");
            T::default()
        })
    }

    fn set_group<T: Serialize>(&self, prefix: &str, settings: &T) -> Result<(), ConfigError> {
        let Ok(Value::Object(fields)) = serde_json::to_value(settings) else {
            return Ok(());
        };
        self.mutate(|values| {
            for (field, value) in fields {
                values.insert(format!("{prefix}/{field}"), value);
            }
        })
    }
}

fn flatten<T: Serialize>(prefix: &str, settings: &T, values: &mut BTreeMap<String, Value>) {
    if let Ok(Value::Object(fields)) = serde_json::to_value(settings) {
        for (field, value) in fields {
            values.entry(format!("{prefix}/{field}")).or_insert(value);
        }
    }
}

fn ensure_defaults(values: &mut BTreeMap<String, Value>) {
    flatten("window", &WindowSettings::default(), values);
    flatten("rendering", &RenderingSettings::default(), values);
    flatten("imageProcessing", &ImageProcessingSettings::default(), values);
}

fn read_values(path: &Path) -> Result<BTreeMap<String, Value>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match parsed {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(ConfigError::NotAnObject(path.to_path_buf())),
    }
}

fn write_values(path: &Path, values: &BTreeMap<String, Value>) -> Result<(), ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let text = serde_json::to_string_pretty(values).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, text).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_present() {
        let config = Config::in_memory();
        assert_eq!(config.window_settings(), WindowSettings::default());
        assert_eq!(config.get_int("window/width", 0), 1200);
        assert_eq!(config.rendering_settings().max_texture_size, 2048);
        assert_eq!(config.image_processing_settings().default_window_level, 40.0);
        assert_eq!(config.get_string("imageProcessing/default_colormap", ""), "Gray");
    }

    #[test]
    fn typed_getters_fall_back() {
        let config = Config::in_memory();
        config.set_value("a", "12").unwrap();
        config.set_value("b", true).unwrap();
        config.set_value("c", 2.5).unwrap();
        assert_eq!(config.get_int("a", 0), 12);
        assert!(config.get_bool("b", false));
        assert_eq!(config.get_double("c", 0.0), 2.5);
        assert_eq!(config.get_int("c", 0), 2);
        assert_eq!(config.get_string("missing", "x"), "x");

        config.remove("a").unwrap();
        assert!(!config.contains("a"));
        config.clear().unwrap();
        assert!(config.keys().is_empty());
    }

    #[test]
    fn groups_round_trip_and_tolerate_bad_values() {
        let config = Config::in_memory();
        let settings = ImageProcessingSettings {
            default_colormap: Colormap::Hot,
            worker_threads: 4,
            ..ImageProcessingSettings::default()
        };
        config.set_image_processing_settings(&settings).unwrap();
        assert_eq!(config.image_processing_settings(), settings);

        config.set_value("window/width", "wide").unwrap();
        assert_eq!(config.window_settings(), WindowSettings::default());
    }

    #[test]
    fn recent_files_are_unique_and_capped() {
        let config = Config::in_memory();
        for i in 0..12 {
            config.add_recent_file(&format!("/data/{i}.nii")).unwrap();
        }
        config.add_recent_file("/data/5.nii").unwrap();
        let files = config.recent_files();
        assert_eq!(files.len(), MAX_RECENT_FILES);
        assert_eq!(files[0], "/data/5.nii");
        assert_eq!(files.iter().filter(|f| *f == "/data/5.nii").count(), 1);
        assert_eq!(files[1], "/data/11.nii");

        config.clear_recent_files().unwrap();
        assert!(config.recent_files().is_empty());
    }

    #[test]
    fn opened_store_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = Config::open(&path).unwrap();
        config.set_value("viewer/last", "scan.nii").unwrap();

        let reopened = Config::open(&path).unwrap();
        assert_eq!(reopened.get_string("viewer/last", ""), "scan.nii");
        assert_eq!(reopened.window_settings().height, 800);
    }

    #[test]
    fn save_load_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let exported = dir.path().join("export.json");
        let config = Config::in_memory();
        config.set_value("rendering/max_texture_size", 512).unwrap();
        config.save_to_file(&exported).unwrap();

        let other = Config::in_memory();
        other.load_from_file(&exported).unwrap();
        assert_eq!(other.rendering_settings().max_texture_size, 512);
        assert_eq!(other.path().as_deref(), Some(exported.as_path()));

        other.load_defaults().unwrap();
        assert_eq!(other.rendering_settings().max_texture_size, 2048);
        let on_disk = Config::open(&exported).unwrap();
        assert_eq!(on_disk.rendering_settings().max_texture_size, 2048);
    }

    #[test]
    fn malformed_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(Config::open(&path), Err(ConfigError::NotAnObject(_))));
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            Config::in_memory().load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn failed_write_leaves_values_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::open(&path).unwrap();
        config.set_value("kept", 1).unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(config.set_value("kept", 2), Err(ConfigError::Io { .. })));
        assert!(matches!(config.remove("kept"), Err(ConfigError::Io { .. })));
        assert_eq!(config.get_int("kept", 0), 1);
    }
}
