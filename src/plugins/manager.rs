use std::collections::BTreeMap;
use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::{
    GaussianSmoothingPlugin, MipPlugin, Plugin, PluginError, PluginKind, StatisticsPlugin,
};
use crate::signal::Signal;

pub type PluginFactory = fn() -> Box<dyn Plugin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Loaded(String),
    Unloaded(String),
    Error { name: String, message: String },
}

struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    source: Option<PathBuf>,
}

/// Owns plugin instances keyed by name.
///
/// Instances are created from registered providers. A plugin file on disk
/// only selects a provider: `libstatistics.so` loads the `statistics`
/// provider.
pub struct PluginManager {
    providers: BTreeMap<String, PluginFactory>,
    loaded: BTreeMap<String, LoadedPlugin>,
    directories: Vec<PathBuf>,
    last_error: Option<String>,
    pub events: Signal<PluginEvent>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("loaded", &self.loaded.keys().collect::<Vec<_>>())
            .field("directories", &self.directories)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl PluginManager {
    /// An empty manager searching `plugins/` and `extensions/` next to the
    /// executable.
    pub fn new() -> Self {
        let directories = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .map(|dir| vec![dir.join("plugins"), dir.join("extensions")])
            .unwrap_or_default();
        Self {
            providers: BTreeMap::new(),
            loaded: BTreeMap::new(),
            directories,
            last_error: None,
            events: Signal::new(),
        }
    }

    pub fn with_builtin_providers() -> Self {
        let mut manager = Self::new();
        manager.register_provider(GaussianSmoothingPlugin::NAME, || {
            Box::new(GaussianSmoothingPlugin::default())
        });
        manager.register_provider(MipPlugin::NAME, || Box::new(MipPlugin::default()));
        manager.register_provider(StatisticsPlugin::NAME, || {
            Box::new(StatisticsPlugin::default())
        });
        manager
    }

    pub fn register_provider(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.providers.insert(name.into(), factory);
    }

    pub fn providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Instantiates and initializes the provider `name`.
    pub fn load(&mut self, name: &str) -> Result<(), PluginError> {
        let result = self.instantiate(name, None);
        self.record(name, result)
    }

    /// Loads the plugin selected by the library file at `path`.
    pub fn load_plugin(&mut self, path: impl AsRef<Path>) -> Result<(), PluginError> {
        let path = path.as_ref();
        let name = plugin_name(path);
        let result = if path.is_file() {
            self.instantiate(&name, Some(path.to_path_buf()))
        } else {
            Err(PluginError::FileNotFound(path.to_path_buf()))
        };
        self.record(&name, result)
    }

    /// Loads every library in `directory`. Returns how many loaded; failures
    /// are reported through events and [`PluginManager::last_error`].
    pub fn load_plugins_from_directory(
        &mut self,
        directory: impl AsRef<Path>,
    ) -> Result<usize, PluginError> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            let error = PluginError::DirectoryNotFound(directory.to_path_buf());
            self.last_error = Some(error.to_string());
            return Err(error);
        }
        let loaded = self
            .available_plugins(directory)
            .into_iter()
            .filter(|path| self.load_plugin(path).is_ok())
            .count();
        debug!("loaded {loaded} plugin(s) from {}", directory.display());
        Ok(loaded)
    }

    /// Library files in `directory` with the platform's extension.
    pub fn available_plugins(&self, directory: impl AsRef<Path>) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(directory) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|ext| ext == DLL_EXTENSION)
            })
            .collect();
        paths.sort();
        paths
    }

    /// Finalizes and drops `name`. Unknown names are ignored.
    pub fn unload(&mut self, name: &str) {
        let Some(mut entry) = self.loaded.remove(name) else {
            return;
        };
        if entry.plugin.is_initialized() {
            entry.plugin.finalize();
        }
        info!("plugin unloaded: {name}");
        self.events.emit(&PluginEvent::Unloaded(name.to_string()));
    }

    pub fn unload_all(&mut self) {
        let names: Vec<String> = self.loaded.keys().cloned().collect();
        for name in names {
            self.unload(&name);
        }
    }

    /// Unloads `name` and loads it again from the same source.
    pub fn reload(&mut self, name: &str) -> Result<(), PluginError> {
        let Some(entry) = self.loaded.get(name) else {
            return Err(PluginError::NotLoaded(name.to_string()));
        };
        let source = entry.source.clone();
        self.unload(name);
        match source {
            Some(path) => self.load_plugin(path),
            None => self.load(name),
        }
    }

    /// Loads from every search directory that exists. Returns the number of
    /// newly loaded plugins.
    pub fn refresh(&mut self) -> usize {
        let directories: Vec<PathBuf> = self
            .directories
            .iter()
            .filter(|dir| dir.is_dir())
            .cloned()
            .collect();
        directories
            .iter()
            .filter_map(|dir| self.load_plugins_from_directory(dir).ok())
            .sum()
    }

    pub fn add_plugin_directory(&mut self, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        if !self.directories.contains(&directory) {
            self.directories.push(directory);
        }
    }

    pub fn remove_plugin_directory(&mut self, directory: impl AsRef<Path>) {
        self.directories.retain(|dir| dir != directory.as_ref());
    }

    pub fn plugin_directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        self.loaded.keys().cloned().collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    pub fn plugin(&self, name: &str) -> Option<&dyn Plugin> {
        self.loaded.get(name).map(|entry| entry.plugin.as_ref())
    }

    pub fn plugin_mut(&mut self, name: &str) -> Option<&mut (dyn Plugin + 'static)> {
        self.loaded.get_mut(name).map(|entry| entry.plugin.as_mut())
    }

    pub fn plugins_of_kind(&self, kind: PluginKind) -> Vec<String> {
        self.loaded
            .iter()
            .filter(|(_, entry)| entry.plugin.metadata().kind == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn processing_plugins(&self) -> Vec<String> {
        self.plugins_of_kind(PluginKind::Processing)
    }

    pub fn visualization_plugins(&self) -> Vec<String> {
        self.plugins_of_kind(PluginKind::Visualization)
    }

    pub fn measurement_plugins(&self) -> Vec<String> {
        self.plugins_of_kind(PluginKind::Measurement)
    }

    /// Multi-line description of a loaded plugin.
    pub fn plugin_info(&self, name: &str) -> Option<String> {
        self.plugin(name).map(|plugin| plugin.metadata().to_string())
    }

    pub fn plugin_version(&self, name: &str) -> Option<String> {
        self.plugin(name).map(|plugin| plugin.metadata().version)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    fn instantiate(&mut self, name: &str, source: Option<PathBuf>) -> Result<(), PluginError> {
        if self.loaded.contains_key(name) {
            return Err(PluginError::AlreadyLoaded(name.to_string()));
        }
        let factory = self
            .providers
            .get(name)
            .ok_or_else(|| PluginError::UnknownProvider(name.to_string()))?;
        let mut plugin = factory();
        plugin.initialize()?;
        self.loaded.insert(name.to_string(), LoadedPlugin { plugin, source });
        Ok(())
    }

    fn record(&mut self, name: &str, result: Result<(), PluginError>) -> Result<(), PluginError> {
        match &result {
            Ok(()) => {
                info!("plugin loaded: {name}");
                self.events.emit(&PluginEvent::Loaded(name.to_string()));
            }
            Err(error) => {
                let message = error.to_string();
                warn!("{message}");
                self.last_error = Some(message.clone());
                self.events.emit(&PluginEvent::Error {
                    name: name.to_string(),
                    message,
                });
            }
        }
        result
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        for entry in self.loaded.values_mut() {
            if entry.plugin.is_initialized() {
                entry.plugin.finalize();
            }
        }
    }
}

/// File stem without the platform's library prefix.
fn plugin_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.strip_prefix(DLL_PREFIX) {
        Some(name) if !DLL_PREFIX.is_empty() && !name.is_empty() => name.to_string(),
        _ => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginMetadata;
    use crate::signal::EventLog;
    use crate::volume::Volume;
    use ndarray::Array3;

    struct Broken;

    impl Plugin for Broken {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                name: "broken".into(),
                version: "0.0.1".into(),
                description: "never initializes".into(),
                author: "tests".into(),
                kind: PluginKind::Processing,
            }
        }

        fn initialize(&mut self) -> Result<(), PluginError> {
            Err(PluginError::InitializationFailed {
                name: "broken".into(),
                reason: "missing resource".into(),
            })
        }

        fn finalize(&mut self) {}

        fn is_initialized(&self) -> bool {
            false
        }

        fn process(&mut self, volume: &Volume) -> Result<Volume, PluginError> {
            Ok(volume.clone())
        }
    }

    fn library(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(format!("{DLL_PREFIX}{name}.{DLL_EXTENSION}"));
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn loads_builtin_by_name_and_rejects_duplicates() {
        let mut manager = PluginManager::with_builtin_providers();
        let log = EventLog::new();
        log.attach(&mut manager.events);

        manager.load(StatisticsPlugin::NAME).unwrap();
        assert!(manager.is_loaded("statistics"));
        assert!(matches!(
            manager.load("statistics"),
            Err(PluginError::AlreadyLoaded(_))
        ));
        assert!(manager.has_error());

        let events = log.drain();
        assert_eq!(events[0], PluginEvent::Loaded("statistics".into()));
        assert!(matches!(events[1], PluginEvent::Error { .. }));
    }

    #[test]
    fn missing_file_sets_last_error() {
        let mut manager = PluginManager::with_builtin_providers();
        let result = manager.load_plugin("/nonexistent/libmip.so");
        assert!(matches!(result, Err(PluginError::FileNotFound(_))));
        assert!(manager.last_error().unwrap().contains("does not exist"));
        assert!(manager.loaded_plugins().is_empty());
    }

    #[test]
    fn directory_scan_loads_matching_libraries() {
        let dir = tempfile::tempdir().unwrap();
        library(dir.path(), "mip");
        library(dir.path(), "statistics");
        library(dir.path(), "unknown");
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let mut manager = PluginManager::with_builtin_providers();
        assert_eq!(manager.available_plugins(dir.path()).len(), 3);
        assert_eq!(manager.load_plugins_from_directory(dir.path()).unwrap(), 2);
        assert_eq!(manager.loaded_plugins(), vec!["mip", "statistics"]);
        assert_eq!(manager.visualization_plugins(), vec!["mip"]);
        assert!(manager.last_error().unwrap().contains("unknown"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let mut manager = PluginManager::new();
        assert!(matches!(
            manager.load_plugins_from_directory("/nonexistent/plugins"),
            Err(PluginError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn failed_initialization_is_not_kept() {
        let mut manager = PluginManager::new();
        manager.register_provider("broken", || Box::new(Broken));
        let err = manager.load("broken").unwrap_err();
        assert!(matches!(err, PluginError::InitializationFailed { .. }));
        assert!(!manager.is_loaded("broken"));
        assert!(manager.last_error().unwrap().contains("missing resource"));
    }

    #[test]
    fn unload_and_reload_keep_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = library(dir.path(), "gaussian-smoothing");
        let mut manager = PluginManager::with_builtin_providers();
        let log = EventLog::new();
        log.attach(&mut manager.events);

        manager.load_plugin(&path).unwrap();
        manager.reload("gaussian-smoothing").unwrap();
        assert!(manager.is_loaded("gaussian-smoothing"));
        assert_eq!(
            log.drain(),
            vec![
                PluginEvent::Loaded("gaussian-smoothing".into()),
                PluginEvent::Unloaded("gaussian-smoothing".into()),
                PluginEvent::Loaded("gaussian-smoothing".into()),
            ]
        );

        manager.unload("gaussian-smoothing");
        manager.unload("gaussian-smoothing");
        assert!(log.drain().len() == 1);
        assert!(matches!(
            manager.reload("gaussian-smoothing"),
            Err(PluginError::NotLoaded(_))
        ));
    }

    #[test]
    fn directories_are_unique_and_refresh_scans_them() {
        let dir = tempfile::tempdir().unwrap();
        library(dir.path(), "mip");
        let mut manager = PluginManager::with_builtin_providers();
        manager.add_plugin_directory(dir.path());
        manager.add_plugin_directory(dir.path());
        let count = manager
            .plugin_directories()
            .iter()
            .filter(|d| d.as_path() == dir.path())
            .count();
        assert_eq!(count, 1);

        assert_eq!(manager.refresh(), 1);
        manager.remove_plugin_directory(dir.path());
        assert!(!manager.plugin_directories().contains(&dir.path().to_path_buf()));
    }

    #[test]
    fn info_and_dispatch_through_loaded_plugins() {
        let mut manager = PluginManager::with_builtin_providers();
        manager.load(StatisticsPlugin::NAME).unwrap();
        let info = manager.plugin_info("statistics").unwrap();
        assert!(info.starts_with("name: statistics\nversion: "));
        assert_eq!(
            manager.plugin_version("statistics").as_deref(),
            Some(env!("CARGO_PKG_VERSION"))
        );

        let volume = Volume::new(Array3::from_elem((2, 2, 2), 3.0), (1.0, 1.0, 1.0));
        let measurement = manager
            .plugin_mut("statistics")
            .and_then(|plugin| plugin.as_measurement_mut())
            .unwrap();
        assert_eq!(measurement.perform_measurement("mean", &volume).unwrap(), 3.0);
    }

    #[test]
    fn library_prefix_is_stripped() {
        let path = PathBuf::from(format!("/plugins/{DLL_PREFIX}mip.{DLL_EXTENSION}"));
        assert_eq!(plugin_name(&path), "mip");
    }
}
