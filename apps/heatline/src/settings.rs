//! Engine-side configuration: where the engine binary lives and the
//! symbol/module options it is told about after every (re)connect.
//! A `SettingsHub` publishes live updates over a watch channel; the
//! connection supervisor re-sends the engine notifications on change.

use std::env;
use std::path::PathBuf;

use engine_proto::ModuleFilterMode;
use tokio::sync::watch;

#[cfg(windows)]
const ENGINE_BINARY: &str = "heatline-engine.exe";
#[cfg(not(windows))]
const ENGINE_BINARY: &str = "heatline-engine";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    /// Explicit engine executable; overrides the install-dir lookup.
    pub executable: Option<PathBuf>,
    /// Directory holding the bundled engine binary.
    pub install_dir: Option<PathBuf>,
    /// Working directory for the spawned engine.
    pub working_dir: Option<PathBuf>,
    pub debug: bool,

    pub symbol_search_dirs: Vec<String>,
    pub symbol_cache_dir: Option<String>,
    pub symbol_server_urls: Vec<String>,
    pub no_default_urls: bool,

    pub dwarf_search_dirs: Vec<String>,
    pub debuginfod_urls: Vec<String>,
    pub debuginfod_cache_dir: Option<String>,

    /// Prefix rewrites applied to engine-reported source paths, and
    /// forwarded to the engine for its own module resolution.
    pub module_path_maps: Vec<(String, String)>,
    pub module_filter_mode: ModuleFilterMode,
    pub module_include: Vec<String>,
    pub module_exclude: Vec<String>,
}

impl EngineSettings {
    /// Load configuration from `HEATLINE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            executable: env::var_os("HEATLINE_ENGINE").map(PathBuf::from),
            install_dir: env::var_os("HEATLINE_ENGINE_DIR").map(PathBuf::from),
            working_dir: env::var_os("HEATLINE_ENGINE_CWD").map(PathBuf::from),
            debug: env_truthy("HEATLINE_ENGINE_DEBUG"),
            symbol_search_dirs: env_path_list("HEATLINE_SYMBOL_PATHS"),
            symbol_cache_dir: env_string("HEATLINE_SYMBOL_CACHE"),
            symbol_server_urls: env_list("HEATLINE_SYMBOL_SERVERS"),
            no_default_urls: env_truthy("HEATLINE_NO_DEFAULT_URLS"),
            dwarf_search_dirs: env_path_list("HEATLINE_DWARF_PATHS"),
            debuginfod_urls: env_list("HEATLINE_DEBUGINFOD_URLS"),
            debuginfod_cache_dir: env_string("HEATLINE_DEBUGINFOD_CACHE"),
            module_path_maps: env_pair_list("HEATLINE_PATH_MAPS"),
            module_filter_mode: match env_string("HEATLINE_MODULE_FILTER_MODE").as_deref() {
                Some("only_included") => ModuleFilterMode::OnlyIncluded,
                _ => ModuleFilterMode::AllButExcluded,
            },
            module_include: env_list("HEATLINE_MODULE_INCLUDE"),
            module_exclude: env_list("HEATLINE_MODULE_EXCLUDE"),
        }
    }

    /// Resolves the engine executable: explicit override, else the
    /// bundled binary under the install dir, else a bare name for the
    /// platform's path lookup.
    pub fn engine_executable(&self) -> PathBuf {
        if let Some(executable) = &self.executable {
            return executable.clone();
        }
        match &self.install_dir {
            Some(dir) => dir.join(ENGINE_BINARY),
            None => PathBuf::from(ENGINE_BINARY),
        }
    }
}

/// Applies the first matching prefix rewrite to an engine-reported path.
pub fn remap_path(maps: &[(String, String)], path: &str) -> String {
    for (source, target) in maps {
        if let Some(rest) = path.strip_prefix(source.as_str()) {
            return format!("{target}{rest}");
        }
    }
    path.to_string()
}

/// Owns the current settings and fans live updates out to subscribers.
pub struct SettingsHub {
    tx: watch::Sender<EngineSettings>,
}

impl SettingsHub {
    pub fn new(initial: EngineSettings) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSettings> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> EngineSettings {
        self.tx.borrow().clone()
    }

    /// Publishes new settings; subscribers are only woken on real changes.
    pub fn update(&self, settings: EngineSettings) {
        self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false)
}

fn env_list(var: &str) -> Vec<String> {
    env_string(var)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_path_list(var: &str) -> Vec<String> {
    env::var_os(var)
        .map(|value| {
            env::split_paths(&value)
                .map(|path| path.to_string_lossy().into_owned())
                .filter(|path| !path.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `source=target` pairs from a comma-separated list.
fn env_pair_list(var: &str) -> Vec<(String, String)> {
    env_list(var)
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(source, target)| (source.to_string(), target.to_string()))
        })
        .collect()
}
