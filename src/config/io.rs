use std::env::current_exe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to peripheral-tracker.json in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // /opt/peripheral-tracker => /opt/peripheral-tracker.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to peripheral-tracker.json in an os dependent standard directory, such as
// ~/.config on linux.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "peripheral-tracker").map(|dirs| {
        dirs.config_dir().join("peripheral-tracker.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        if path.is_file() {
            return Ok(path);
        }
    }

    get_local_config_path().ok_or(ConfigError::NoConfigPath)
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    // Hold this guard for as long as this process drives the adapter.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    path: PathBuf,
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => get_config_path()?,
        };
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent().filter(|directory| !directory.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(&path)?;

        let inner = ConfigIOInner {
            path,
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn path(&self) -> PathBuf {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        inner.path.clone()
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        let file = inner.file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub async fn load_or_default(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) if err.is_file_not_found_error() => {
            info!("Config file not found, using defaults");
            Config::default()
        },
        Err(err) => {
            warn!("Failed to load config from {}, using defaults: {}", config_io.path().display(), err);
            Config::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("peripheral-tracker-test-{}", std::process::id()))
            .join(name)
    }

    #[tokio::test]
    async fn empty_file_reads_as_default_and_save_round_trips() {
        let path = temp_config_path("roundtrip.json");
        let _ = std::fs::remove_file(&path);
        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();

        assert_eq!(config_io.read().await.unwrap(), Config::default());

        let config = Config { connection_poll_interval_ms: Some(2000), ..Config::default() };
        config_io.save(&config).await.unwrap();
        assert_eq!(config_io.read().await.unwrap(), config);

        let shorter = Config::default();
        config_io.save(&shorter).await.unwrap();
        assert_eq!(config_io.read().await.unwrap(), shorter);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn broken_file_falls_back_to_defaults() {
        let path = temp_config_path("broken.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();
        assert!(matches!(config_io.read().await, Err(ConfigError::JsonError { .. })));
        assert_eq!(load_or_default(&config_io).await, Config::default());

        let _ = std::fs::remove_file(&path);
    }
}
