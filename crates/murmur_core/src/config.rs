use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "MURMUR_HOME";

/// On-disk layout of murmur's data directory.
///
/// ```text
/// ~/.murmur/
///   config.json        network settings
///   audit.db           relay server audit log
///   logs/              daily rolling log files
///   storage/<peer>/    received attachments
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MurmurConfig {
    base: PathBuf,
}

impl MurmurConfig {
    /// `$MURMUR_HOME` if set, otherwise `~/.murmur`.
    pub fn resolve() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::at(PathBuf::from(home)));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::at(home.join(".murmur")))
    }

    /// Use `base` as the data directory.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Returns the config file path: `<base>/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Returns the logs directory: `<base>/logs/`
    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Returns the audit database path: `<base>/audit.db`
    pub fn db_path(&self) -> PathBuf {
        self.base.join("audit.db")
    }

    /// Root of all received attachments: `<base>/storage/`
    pub fn storage_root(&self) -> PathBuf {
        self.base.join("storage")
    }

    /// Attachments received from `peer`: `<base>/storage/<peer>/`
    pub fn storage_dir(&self, peer: &str) -> PathBuf {
        self.storage_root().join(crate::media::sanitize_component(peer))
    }

    /// Ensures the base, logs and storage directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.base.clone(), self.logs_dir(), self.storage_root()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key files
// ---------------------------------------------------------------------------

/// Read a 32-byte key stored as hex text.
pub fn load_key_file(path: &Path) -> Result<[u8; 32]> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    let bytes = hex::decode(text.trim())
        .with_context(|| format!("Key file is not valid hex: {}", path.display()))?;
    let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!(
            "Key file {} holds {} bytes, expected 32",
            path.display(),
            bytes.len()
        );
    };
    Ok(key)
}

/// Generate a random key and write it to `path` as hex. Refuses to
/// overwrite an existing file.
pub fn generate_key_file(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Key file already exists: {}", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let key: [u8; 32] = rand::random();
    std::fs::write(path, format!("{}\n", hex::encode(key)))
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict key file: {}", path.display()))?;
    }

    info!("Wrote new key to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let config = MurmurConfig::at("/data/murmur");
        assert_eq!(config.config_path(), PathBuf::from("/data/murmur/config.json"));
        assert_eq!(config.logs_dir(), PathBuf::from("/data/murmur/logs"));
        assert_eq!(config.db_path(), PathBuf::from("/data/murmur/audit.db"));
        assert_eq!(
            config.storage_dir("alice"),
            PathBuf::from("/data/murmur/storage/alice")
        );
    }

    #[test]
    fn test_storage_dir_cannot_escape() {
        let config = MurmurConfig::at("/data/murmur");
        let dir = config.storage_dir("../../etc");
        assert!(dir.starts_with("/data/murmur/storage"));
        assert_eq!(dir.components().count(), config.storage_root().components().count() + 1);
    }

    #[test]
    fn test_ensure_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MurmurConfig::at(tmp.path().join("home"));
        config.ensure_dirs().unwrap();
        assert!(config.logs_dir().is_dir());
        assert!(config.storage_root().is_dir());
    }

    #[test]
    fn test_key_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keys").join("chat.key");

        generate_key_file(&path).unwrap();
        let key = load_key_file(&path).unwrap();
        assert_eq!(load_key_file(&path).unwrap(), key);

        // A second generate must not clobber the key.
        assert!(generate_key_file(&path).is_err());
        assert_eq!(load_key_file(&path).unwrap(), key);
    }

    #[test]
    fn test_key_file_rejects_bad_content() {
        let tmp = tempfile::tempdir().unwrap();

        let short = tmp.path().join("short.key");
        std::fs::write(&short, "abcd").unwrap();
        let err = load_key_file(&short).unwrap_err();
        assert!(err.to_string().contains("expected 32"));

        let garbage = tmp.path().join("garbage.key");
        std::fs::write(&garbage, "not hex at all").unwrap();
        assert!(load_key_file(&garbage).is_err());

        assert!(load_key_file(&tmp.path().join("missing.key")).is_err());
    }

    #[test]
    fn test_key_file_tolerates_whitespace() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("spaced.key");
        std::fs::write(&path, format!("  {}\n\n", "ab".repeat(32))).unwrap();
        assert_eq!(load_key_file(&path).unwrap(), [0xAB; 32]);
    }
}
