/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const BACKEND_FILE: &str = "backend.json";
const DEFAULT_DATA_DIR: &str = ".whatschat";
const DEFAULT_PROFILES_TABLE: &str = "profilesMSP";
const DEFAULT_MESSAGES_TABLE: &str = "messages";

/// Images wider than this are scaled down before being embedded
pub const DEFAULT_MAX_IMAGE_WIDTH: u32 = 800;
pub const DEFAULT_IMAGE_QUALITY: u8 = 70;

/// Which backend implementation the client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Hosted backend-as-a-service (auth + tables + realtime)
    Supabase,
    /// Embedded store in the data directory, single machine only
    Local,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the persisted backend details, session and local store
    pub data_dir: PathBuf,

    pub backend: BackendKind,

    /// Table holding one profile row per account
    pub profiles_table: String,

    /// Table holding direct messages
    pub messages_table: String,

    /// Snapshot polling interval while the realtime feed is unavailable
    pub poll_interval: Duration,

    /// Upper bound for the resubscribe backoff
    pub max_backoff: Duration,

    pub max_image_width: u32,

    /// JPEG quality factor (1-100) for embedded images
    pub image_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            backend: BackendKind::Supabase,
            profiles_table: DEFAULT_PROFILES_TABLE.to_string(),
            messages_table: DEFAULT_MESSAGES_TABLE.to_string(),
            poll_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            max_image_width: DEFAULT_MAX_IMAGE_WIDTH,
            image_quality: DEFAULT_IMAGE_QUALITY,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--local" => {
                    config.backend = BackendKind::Local;
                    i += 1;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = PathBuf::from(path);
                    i += 2;
                }
                "--poll-secs" => {
                    let s = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--poll-secs requires a number".to_string())
                    })?;
                    let secs = s.parse::<u64>().map_err(|_| {
                        ChatError::Config("--poll-secs must be a positive number".to_string())
                    })?;
                    if secs == 0 {
                        return Err(ChatError::Config(
                            "--poll-secs must be a positive number".to_string(),
                        ));
                    }
                    config.poll_interval = Duration::from_secs(secs);
                    i += 2;
                }
                "--profiles-table" => {
                    let t = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--profiles-table requires a name".to_string())
                    })?;
                    config.profiles_table = t.clone();
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!(
                        "Unknown argument: {}\nUsage: {} [--local] [--data-dir <path>] [--poll-secs <n>] [--profiles-table <name>]",
                        other,
                        args.first().map(String::as_str).unwrap_or("whatschat")
                    )));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("WHATSCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = std::env::var("WHATSCHAT_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            config.poll_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Connection details for the hosted backend, persisted between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub key: String,
}

impl BackendConfig {
    /// Validate and normalize user-entered connection details
    pub fn new(url: &str, key: &str) -> Result<Self> {
        let url = url.trim().trim_end_matches('/');
        let key = key.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ChatError::Config(format!(
                "Backend URL must start with http:// or https://, got {:?}",
                url
            )));
        }
        if key.is_empty() {
            return Err(ChatError::Config("Backend key must not be empty".to_string()));
        }
        Ok(Self {
            url: url.to_string(),
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BackendFileV1 {
    version: u8,
    url: String,
    key: String,
}

fn backend_path(data_dir: &Path) -> PathBuf {
    data_dir.join(BACKEND_FILE)
}

/// Load the persisted backend details.
///
/// Falls back to `SUPABASE_URL` / `SUPABASE_ANON_KEY` when nothing was saved.
/// `Ok(None)` means the user still has to go through setup.
pub fn load_backend_config(data_dir: &Path) -> Result<Option<BackendConfig>> {
    let path = backend_path(data_dir);
    if path.exists() {
        let raw = fs::read_to_string(&path).map_err(ChatError::Io)?;
        let parsed: BackendFileV1 =
            serde_json::from_str(&raw).map_err(ChatError::Serialization)?;
        if parsed.version != 1 {
            return Err(ChatError::Config(format!(
                "Unsupported backend file version: {}",
                parsed.version
            )));
        }
        debug!("Loaded backend config from {:?}", path);
        return BackendConfig::new(&parsed.url, &parsed.key).map(Some);
    }

    match (std::env::var("SUPABASE_URL"), std::env::var("SUPABASE_ANON_KEY")) {
        (Ok(url), Ok(key)) => BackendConfig::new(&url, &key).map(Some),
        _ => Ok(None),
    }
}

pub fn save_backend_config(data_dir: &Path, config: &BackendConfig) -> Result<()> {
    fs::create_dir_all(data_dir).map_err(ChatError::Io)?;
    let file = BackendFileV1 {
        version: 1,
        url: config.url.clone(),
        key: config.key.clone(),
    };
    let json = serde_json::to_string_pretty(&file).map_err(ChatError::Serialization)?;
    let path = backend_path(data_dir);
    fs::write(&path, json).map_err(ChatError::Io)?;

    // Best-effort file permissions (0600)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
    }

    info!("Saved backend config for {}", config.url);
    Ok(())
}

/// Forget the backend details ("disconnect"). Missing file is not an error.
pub fn clear_backend_config(data_dir: &Path) -> Result<()> {
    let path = backend_path(data_dir);
    if path.exists() {
        fs::remove_file(&path).map_err(ChatError::Io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_defaults() {
        let config = Config::from_args(&args(&["whatschat"])).unwrap();
        assert_eq!(config.backend, BackendKind::Supabase);
        assert_eq!(config.max_image_width, 800);
        assert_eq!(config.profiles_table, "profilesMSP");
    }

    #[test]
    fn test_from_args_flags() {
        let config = Config::from_args(&args(&[
            "whatschat",
            "--local",
            "--data-dir",
            "/tmp/wc",
            "--poll-secs",
            "2",
        ]))
        .unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/wc"));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_from_args_rejects_bad_values() {
        assert!(Config::from_args(&args(&["whatschat", "--poll-secs", "zero"])).is_err());
        assert!(Config::from_args(&args(&["whatschat", "--data-dir"])).is_err());
        assert!(Config::from_args(&args(&["whatschat", "--bogus"])).is_err());
    }

    #[test]
    fn test_backend_config_validation() {
        let cfg = BackendConfig::new(" https://abc.supabase.co/ ", " key ").unwrap();
        assert_eq!(cfg.url, "https://abc.supabase.co");
        assert_eq!(cfg.key, "key");

        assert!(BackendConfig::new("abc.supabase.co", "key").is_err());
        assert!(BackendConfig::new("https://abc.supabase.co", "  ").is_err());
    }

    #[test]
    fn test_backend_config_roundtrip_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = BackendConfig::new("https://abc.supabase.co", "anon").unwrap();

        save_backend_config(temp_dir.path(), &cfg).unwrap();
        let loaded = load_backend_config(temp_dir.path()).unwrap();
        assert_eq!(loaded, Some(cfg));

        clear_backend_config(temp_dir.path()).unwrap();
        assert!(!backend_path(temp_dir.path()).exists());
        // Clearing twice is fine
        clear_backend_config(temp_dir.path()).unwrap();
    }

    #[test]
    fn test_unsupported_backend_file_version() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            backend_path(temp_dir.path()),
            r#"{"version":2,"url":"https://x.supabase.co","key":"k"}"#,
        )
        .unwrap();
        let err = load_backend_config(temp_dir.path()).unwrap_err();
        assert!(err.is_fatal());
    }
}
