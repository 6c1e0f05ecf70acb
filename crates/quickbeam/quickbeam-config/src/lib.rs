//! Process-wide defaults for quickbeam: where shared-memory segments and
//! rendezvous sockets live, plus the TOML configuration the demo binaries
//! load. There are no hidden singletons: callers resolve a [`RuntimeDir`]
//! once at startup and pass it down.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment override for the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "QUICKBEAM_RUNTIME_DIR";

/// Name of the sentinel file that forces filesystem rendezvous sockets even
/// where the abstract namespace is available.
pub const FORCE_FS_SOCKETS_SENTINEL: &str = "qb-force-filesystem-sockets";

/// The directory holding ring buffer files, rendezvous sockets and the
/// sentinel file.
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    path: PathBuf,
    force_fs_sockets: bool,
}

impl RuntimeDir {
    /// Resolves the runtime directory: the environment override if set, then
    /// `/dev/shm` where it exists, then `/tmp`. The sentinel file is checked
    /// once, here, not per connection.
    pub fn resolve() -> Self {
        let path = std::env::var_os(RUNTIME_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let shm = PathBuf::from("/dev/shm");
                if shm.is_dir() { shm } else { PathBuf::from("/tmp") }
            });
        Self::at(path)
    }

    /// Uses `path` as the runtime directory.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let force_fs_sockets = path.join(FORCE_FS_SOCKETS_SENTINEL).exists();
        Self {
            path,
            force_fs_sockets,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the sentinel file existed at resolution time and rendezvous
    /// sockets must bind filesystem paths.
    pub fn force_fs_sockets(&self) -> bool {
        self.force_fs_sockets
    }

    /// Filesystem path of the rendezvous socket for `service`.
    pub fn socket_path(&self, service: &str) -> PathBuf {
        self.path.join(format!("qb-{service}"))
    }
}

impl Default for RuntimeDir {
    fn default() -> Self {
        Self::resolve()
    }
}

/// Configuration for the echo demo binaries.
#[derive(Deserialize, Debug)]
pub struct EchoConfig {
    #[serde(default = "defaults::service_name")]
    pub service_name: String,
    #[serde(default = "defaults::max_msg_size")]
    pub max_msg_size: usize,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Overrides [`RuntimeDir::resolve`] when set.
    #[serde(default)]
    pub runtime_dir: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The path names nothing. Reported separately so a wrong `--config`
    /// argument is distinguishable from an unreadable file.
    #[error("config file {0:?} does not exist")]
    NotFound(PathBuf),

    #[error("could not read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bad config in {path:?}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

mod defaults {
    pub fn service_name() -> String {
        "echo".into()
    }

    pub fn max_msg_size() -> usize {
        1 << 16 // 65536
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl EchoConfig {
    /// Loads and parses the TOML file at `path`. Every error names the
    /// offending path, since demo invocations commonly point at the wrong
    /// runtime directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
            .and_then(|text| {
                toml::from_str(&text).map_err(|source| ConfigError::Toml {
                    path: path.to_path_buf(),
                    source,
                })
            })
    }

    /// `load` when a path was given, the built-in defaults otherwise.
    pub fn load_or_default(path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn runtime_dir(&self) -> RuntimeDir {
        match &self.runtime_dir {
            Some(dir) => RuntimeDir::at(dir.clone()),
            None => RuntimeDir::resolve(),
        }
    }
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            service_name: defaults::service_name(),
            max_msg_size: defaults::max_msg_size(),
            log_level: defaults::log_level(),
            runtime_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EchoConfig = toml::from_str("").unwrap();
        assert_eq!(config.service_name, "echo");
        assert_eq!(config.max_msg_size, 65536);
        assert_eq!(config.log_level, "info");
        assert!(config.runtime_dir.is_none());
    }

    #[test]
    fn explicit_fields_win() {
        let config: EchoConfig = toml::from_str(
            "service_name = \"metrics\"\nmax_msg_size = 4096\nruntime_dir = \"/tmp\"\n",
        )
        .unwrap();
        assert_eq!(config.service_name, "metrics");
        assert_eq!(config.max_msg_size, 4096);
        assert_eq!(config.runtime_dir.as_deref(), Some("/tmp"));
    }

    #[test]
    fn missing_config_file_is_reported_as_such() {
        let path = format!("/tmp/quickbeam-no-such-config-{}.toml", std::process::id());
        assert!(matches!(
            EchoConfig::load(&path),
            Err(ConfigError::NotFound(_))
        ));
        // And the fallback path serves the defaults.
        let config = EchoConfig::load_or_default(None::<&str>).unwrap();
        assert_eq!(config.service_name, "echo");
    }

    #[test]
    fn sentinel_flips_socket_mode() {
        let dir = format!("/tmp/quickbeam-config-test-{}", std::process::id());
        std::fs::create_dir_all(&dir).unwrap();
        assert!(!RuntimeDir::at(&*dir).force_fs_sockets());
        std::fs::write(format!("{dir}/{FORCE_FS_SOCKETS_SENTINEL}"), b"").unwrap();
        assert!(RuntimeDir::at(&*dir).force_fs_sockets());
        let rd = RuntimeDir::at(&*dir);
        assert_eq!(
            rd.socket_path("echo"),
            PathBuf::from(format!("{dir}/qb-echo"))
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
