use std::path::{Path, PathBuf};
use transfer_core::TransferConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    pub transfer: TransferConfig,
    /// Signing key for restore unlock tokens; a random one is used when unset
    pub unlock_secret: Option<String>,
    pub cookie_secure: bool,
    /// Period of the scheduled purge; disabled when unset or zero
    pub purge_interval_secs: Option<u64>,
}

impl AppConfig {
    /// Read the process environment (and `.env`). `transfer_config`
    /// takes the place of `TRANSFER_CONFIG` when given.
    pub fn from_env(transfer_config: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let file = transfer_config.map(|p| p.to_string_lossy().into_owned());
        Self::from_lookup(|key| match (key, &file) {
            ("TRANSFER_CONFIG", Some(path)) => Some(path.clone()),
            _ => std::env::var(key).ok(),
        })
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "./data".into()));

        let mut transfer = match var("TRANSFER_CONFIG") {
            Some(path) => TransferConfig::from_file(Path::new(&path))?,
            None => TransferConfig::with_root(data_dir.join("backups")),
        };
        if let Some(root) = var("ARCHIVE_ROOT") {
            transfer.archive_root = PathBuf::from(root);
        }
        if let Some(keep) = parsed(&var, "RETENTION_KEEP")? {
            transfer.retention.keep = keep;
        }
        if let Some(ttl) = parsed(&var, "UNLOCK_TTL_SECS")? {
            transfer.unlock.ttl_secs = ttl;
        }
        transfer.validate()?;

        Ok(Self {
            port: parsed(&var, "PORT")?.unwrap_or(3000),
            db_path: data_dir.join("transfer-server.db"),
            data_dir,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            transfer,
            unlock_secret: var("RESTORE_UNLOCK_SECRET").filter(|s| !s.is_empty()),
            cookie_secure: var("COOKIE_SECURE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            purge_interval_secs: parsed::<u64>(&var, "PURGE_INTERVAL_SECS")?.filter(|secs| *secs > 0),
        })
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", key, raw, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_lookup(lookup(&[]))?;
        assert_eq!(config.port, 3000);
        assert_eq!(config.transfer.archive_root, PathBuf::from("./data/backups"));
        assert_eq!(config.transfer.retention.keep, 7);
        assert!(config.unlock_secret.is_none());
        assert!(!config.cookie_secure);
        assert_eq!(config.purge_interval_secs, None);
        Ok(())
    }

    #[test]
    fn test_env_overrides() -> anyhow::Result<()> {
        let config = AppConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("ARCHIVE_ROOT", "/srv/archives"),
            ("RETENTION_KEEP", "3"),
            ("UNLOCK_TTL_SECS", "60"),
            ("RESTORE_UNLOCK_SECRET", "0123456789abcdef0123"),
            ("COOKIE_SECURE", "true"),
            ("PURGE_INTERVAL_SECS", "3600"),
        ]))?;
        assert_eq!(config.port, 8080);
        assert_eq!(config.transfer.archive_root, PathBuf::from("/srv/archives"));
        assert_eq!(config.transfer.retention.keep, 3);
        assert_eq!(config.transfer.unlock.ttl_secs, 60);
        assert!(config.unlock_secret.is_some());
        assert!(config.cookie_secure);
        assert_eq!(config.purge_interval_secs, Some(3600));
        Ok(())
    }

    #[test]
    fn test_config_file_then_env() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let file = dir.path().join("transfer.toml");
        std::fs::write(&file, "archive_root = \"/srv/from-file\"\n[retention]\nkeep = 4\n")?;
        let file = file.to_string_lossy().into_owned();

        let config = AppConfig::from_lookup(lookup(&[
            ("TRANSFER_CONFIG", file.as_str()),
            ("RETENTION_KEEP", "9"),
        ]))?;
        assert_eq!(config.transfer.archive_root, PathBuf::from("/srv/from-file"));
        assert_eq!(config.transfer.retention.keep, 9);
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(AppConfig::from_lookup(lookup(&[("PORT", "http")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("RETENTION_KEEP", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("RETENTION_KEEP", "-1")])).is_err());
    }
}
