//! Configuration file loading and change watching

use futures::stream::{self, BoxStream};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use switchboard_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway::GatewayConfig;

/// Configuration change notification
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// When the change was observed
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Version of the configuration after the change
    pub version: u32,
}

pub type ConfigChangeStream = BoxStream<'static, Result<ConfigChange>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Toml,
    Json,
}

impl Format {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Format::Toml,
            Some("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

/// Gateway configuration stored in a file
///
/// The format follows the extension: `.toml` is TOML, `.json` is JSON and
/// anything else is YAML.
#[derive(Debug)]
pub struct FileConfigSource {
    config_path: PathBuf,
    /// Bumped on every observed change
    version: Arc<AtomicU32>,
}

impl FileConfigSource {
    /// Open a configuration file
    ///
    /// A leading `~` is expanded to the home directory.
    ///
    /// # Errors
    /// - `Error::ConfigNotFound` if the file doesn't exist
    /// - `Error::Config` if `~` is used and no home directory is known
    pub fn new(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = expand_home(config_path.into())?;

        if !config_path.exists() {
            return Err(Error::ConfigNotFound);
        }

        info!(path = %config_path.display(), "Opened config file");

        Ok(Self {
            config_path,
            version: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Current configuration version
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Read and parse the file without interpreting it
    pub fn read_raw(&self) -> Result<Value> {
        let contents = std::fs::read_to_string(&self.config_path)?;
        let format = Format::from_path(&self.config_path);

        let parsed = match format {
            Format::Yaml => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
            Format::Json => serde_json::from_str(&contents).map_err(|e| e.to_string()),
            Format::Toml => toml::from_str::<toml::Value>(&contents)
                .map_err(|e| e.to_string())
                .and_then(|value| serde_json::to_value(value).map_err(|e| e.to_string())),
        };

        parsed.map_err(|reason| {
            warn!(path = %self.config_path.display(), ?format, error = %reason, "Config file does not parse");
            Error::Config(format!("{} ({format:?}): {reason}", self.config_path.display()))
        })
    }

    /// Load and validate the gateway configuration
    pub fn load(&self) -> Result<GatewayConfig> {
        let config = GatewayConfig::from_value(self.read_raw()?)?;
        config.validate()?;
        Ok(config)
    }

    /// Stream a notification each time the file is modified or recreated
    ///
    /// Dropping the stream stops the watcher. A watcher that cannot start
    /// yields a single error.
    pub fn watch_changes(&self) -> ConfigChangeStream {
        let (tx, rx) = mpsc::channel(16);
        let version = Arc::clone(&self.version);

        // Runs on the watcher's own thread
        let on_event = move |event: notify::Result<Event>| {
            let item = match event {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    Ok(ConfigChange {
                        timestamp: chrono::Utc::now(),
                        version: version.fetch_add(1, Ordering::SeqCst) + 1,
                    })
                }
                Ok(_) => return,
                Err(e) => Err(Error::Internal(format!("config watcher: {e}"))),
            };
            let _ = tx.blocking_send(item);
        };

        let watcher = notify::recommended_watcher(on_event).and_then(|mut watcher| {
            watcher.watch(&self.config_path, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });

        match watcher {
            Ok(watcher) => {
                debug!(path = %self.config_path.display(), "Config watcher started");
                // The watcher lives as long as the stream
                Box::pin(stream::unfold((rx, watcher), |(mut rx, watcher)| async move {
                    rx.recv().await.map(|item| (item, (rx, watcher)))
                }))
            }
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "Config watcher unavailable");
                let error = Error::Internal(format!("cannot watch {}: {e}", self.config_path.display()));
                Box::pin(stream::once(async move { Err(error) }))
            }
        }
    }
}

fn expand_home(path: PathBuf) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path);
    };
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
    Ok(home.join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{Builder, NamedTempFile};

    fn temp_config(suffix: &str, contents: &str) -> NamedTempFile {
        let file = Builder::new().suffix(suffix).tempfile().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn test_file_not_found() {
        let result = FileConfigSource::new("/nonexistent/switchboard.yaml");
        assert!(matches!(result.unwrap_err(), Error::ConfigNotFound));
    }

    #[test]
    fn test_expand_home() {
        let plain = expand_home(PathBuf::from("/etc/switchboard.yaml")).unwrap();
        assert_eq!(plain, PathBuf::from("/etc/switchboard.yaml"));

        if let Some(home) = dirs::home_dir() {
            let expanded = expand_home(PathBuf::from("~/.switchboard/config.yaml")).unwrap();
            assert_eq!(expanded, home.join(".switchboard/config.yaml"));
        }
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(Format::from_path(Path::new("a.toml")), Format::Toml);
        assert_eq!(Format::from_path(Path::new("a.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("a.yml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("config")), Format::Yaml);
    }

    #[test]
    fn test_read_raw_yaml() {
        let file = temp_config(".yaml", "router:\n  default_route: \"a,b\"\n");
        let source = FileConfigSource::new(file.path()).unwrap();

        let raw = source.read_raw().unwrap();
        assert_eq!(raw["router"]["default_route"], "a,b");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let file = temp_config(".yaml", "router: [unclosed\n");
        let source = FileConfigSource::new(file.path()).unwrap();

        assert!(matches!(source.read_raw(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_error_names_file_and_format() {
        let file = temp_config(".toml", "router = [");
        let source = FileConfigSource::new(file.path()).unwrap();

        let err = source.read_raw().unwrap_err().to_string();
        assert!(err.contains("Toml"));
        assert!(err.contains(&file.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_watch_on_missing_file_yields_error() {
        use futures::StreamExt;

        let file = temp_config(".yaml", "router:\n  default_route: \"a,b\"\n");
        let source = FileConfigSource::new(file.path()).unwrap();
        drop(file);

        let mut changes = source.watch_changes();
        let first = changes.next().await.unwrap();
        assert!(matches!(first, Err(Error::Internal(_))));
        assert!(changes.next().await.is_none());
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let file = temp_config(".json", r#"{"router": {"default_route": ""}}"#);
        let source = FileConfigSource::new(file.path()).unwrap();

        assert!(source.load().is_err());
    }
}
