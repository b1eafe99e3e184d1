use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use livescan_core::{Device, ModelFiles, SessionOptions};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Daemon configuration.
///
/// Values come from an optional TOML file named by `LIVESCAN_CONFIG`, then
/// `LIVESCAN_*` environment variables override individual keys.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the three model artifacts.
    pub model_dir: PathBuf,
    /// Artifact filenames inside `model_dir`.
    pub model_files: ModelFiles,
    /// Compute device for the ONNX sessions.
    pub device: Device,
    /// Intra-op thread count per ONNX session.
    pub onnx_threads: usize,
    /// HTTP / WebSocket listen address.
    pub bind_addr: SocketAddr,
    /// Upper bound on one prediction, including time queued behind other requests.
    pub inference_timeout_secs: u64,
    /// Capacity of the engine request queue.
    pub queue_depth: usize,
}

/// On-disk form; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    device: Option<String>,
    onnx_threads: Option<usize>,
    bind_addr: Option<String>,
    inference_timeout_secs: Option<u64>,
    queue_depth: Option<usize>,
    models: Option<ModelFiles>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: livescan_core::default_model_dir(),
            model_files: ModelFiles::default(),
            device: Device::Auto,
            onnx_threads: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            inference_timeout_secs: 10,
            queue_depth: 8,
        }
    }
}

impl Config {
    /// Load configuration from the optional file plus `LIVESCAN_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`], reading variables through `env`.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = env("LIVESCAN_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }

        if let Some(dir) = env("LIVESCAN_MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        if let Some(device) = env("LIVESCAN_DEVICE") {
            config.device = parse_device(&device)?;
        }
        if let Some(addr) = env("LIVESCAN_BIND") {
            config.bind_addr = parse_addr(&addr)?;
        }
        config.model_files.apply_env(&env);
        config.onnx_threads = env_parse(&env, "LIVESCAN_ONNX_THREADS", config.onnx_threads);
        config.inference_timeout_secs = env_parse(
            &env,
            "LIVESCAN_INFERENCE_TIMEOUT_SECS",
            config.inference_timeout_secs,
        );
        config.queue_depth = env_parse(&env, "LIVESCAN_QUEUE_DEPTH", config.queue_depth);

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(dir) = file.model_dir {
            self.model_dir = dir;
        }
        if let Some(device) = file.device {
            self.device = parse_device(&device)?;
        }
        if let Some(addr) = file.bind_addr {
            self.bind_addr = parse_addr(&addr)?;
        }
        if let Some(models) = file.models {
            self.model_files = models;
        }
        self.onnx_threads = file.onnx_threads.unwrap_or(self.onnx_threads);
        self.inference_timeout_secs = file
            .inference_timeout_secs
            .unwrap_or(self.inference_timeout_secs);
        self.queue_depth = file.queue_depth.unwrap_or(self.queue_depth);
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.onnx_threads == 0 {
            return Err(ConfigError::Invalid {
                key: "onnx_threads",
                message: "must be at least 1".into(),
            });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "queue_depth",
                message: "must be at least 1".into(),
            });
        }
        if self.inference_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "inference_timeout_secs",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            device: self.device,
            intra_threads: self.onnx_threads,
        }
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

fn parse_device(value: &str) -> Result<Device, ConfigError> {
    value
        .parse()
        .map_err(|message| ConfigError::Invalid { key: "device", message })
}

fn parse_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        key: "bind_addr",
        message: e.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_with(env_from(&[])).unwrap();
        assert_eq!(config.device, Device::Auto);
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.inference_timeout(), Duration::from_secs(10));
        assert_eq!(config.model_files, ModelFiles::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::load_with(env_from(&[
            ("LIVESCAN_MODEL_DIR", "/srv/models"),
            ("LIVESCAN_DEVICE", "cuda:1"),
            ("LIVESCAN_BIND", "127.0.0.1:9000"),
            ("LIVESCAN_META_MODEL", "meta.json"),
            ("LIVESCAN_ONNX_THREADS", "4"),
            ("LIVESCAN_INFERENCE_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.device, Device::Cuda(1));
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.model_files.meta_learner, "meta.json");
        assert_eq!(config.session_options().intra_threads, 4);
        assert_eq!(config.inference_timeout_secs, 3);
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_default() {
        let config =
            Config::load_with(env_from(&[("LIVESCAN_QUEUE_DEPTH", "lots")])).unwrap();
        assert_eq!(config.queue_depth, 8);
    }

    #[test]
    fn test_invalid_device_rejected() {
        let err = Config::load_with(env_from(&[("LIVESCAN_DEVICE", "tpu")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "device", .. }));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = Config::load_with(env_from(&[("LIVESCAN_ONNX_THREADS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "onnx_threads", .. }));
    }

    #[test]
    fn test_file_then_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livescan.toml");
        std::fs::write(
            &path,
            r#"
model_dir = "/opt/livescan"
device = "cpu"
queue_depth = 2

[models]
convnet = "effnet.onnx"
"#,
        )
        .unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config = Config::load_with(env_from(&[
            ("LIVESCAN_CONFIG", path_str.as_str()),
            ("LIVESCAN_DEVICE", "cuda"),
        ]))
        .unwrap();

        assert_eq!(config.model_dir, PathBuf::from("/opt/livescan"));
        assert_eq!(config.device, Device::Cuda(0));
        assert_eq!(config.queue_depth, 2);
        assert_eq!(config.model_files.convnet, "effnet.onnx");
        assert_eq!(
            config.model_files.vision_transformer,
            ModelFiles::default().vision_transformer
        );
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livescan.toml");
        std::fs::write(&path, "modle_dir = \"/x\"\n").unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let err = Config::load_with(env_from(&[("LIVESCAN_CONFIG", path_str.as_str())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
