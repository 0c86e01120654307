use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, KeelResult};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// A memory budget in bytes, written as `64MB`, `512KB`, `1GB` or a bare
/// byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> u64 {
        self.0
    }
}

impl Default for MemorySize {
    fn default() -> Self {
        Self(64 * MB)
    }
}

impl FromStr for MemorySize {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeelError::InvalidMemorySpec(s.to_string());
        let spec = s.trim();

        if let Ok(bytes) = spec.parse::<u64>() {
            return Ok(Self(bytes));
        }
        if spec.len() < 3 || !spec.is_char_boundary(spec.len() - 2) {
            return Err(invalid());
        }

        let (number, unit) = spec.split_at(spec.len() - 2);
        let unit = match unit.to_ascii_uppercase().as_str() {
            "KB" => KB,
            "MB" => MB,
            "GB" => GB,
            _ => return Err(invalid()),
        };
        let number: u64 = number.trim().parse().map_err(|_| invalid())?;
        number.checked_mul(unit).map(Self).ok_or_else(invalid)
    }
}

impl TryFrom<String> for MemorySize {
    type Error = KeelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemorySize> for String {
    fn from(size: MemorySize) -> Self {
        size.to_string()
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes != 0 && bytes % GB == 0 {
            write!(f, "{}GB", bytes / GB)
        } else if bytes != 0 && bytes % MB == 0 {
            write!(f, "{}MB", bytes / MB)
        } else if bytes != 0 && bytes % KB == 0 {
            write!(f, "{}KB", bytes / KB)
        } else {
            write!(f, "{}", bytes)
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base path; the database files are `<path>.xid`, `<path>.db` and
    /// `<path>.log`
    pub path: PathBuf,
    /// Page cache budget
    #[serde(default)]
    pub memory: MemorySize,
}

impl Config {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            memory: MemorySize::default(),
        }
    }

    pub fn with_memory(mut self, memory: MemorySize) -> Self {
        self.memory = memory;
        self
    }

    /// Load a JSON config file. `KEEL_MEM` overrides the memory budget.
    pub fn load<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            KeelError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&text)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> KeelResult<()> {
        if let Ok(mem) = env::var("KEEL_MEM") {
            self.memory = mem.parse()?;
        }
        Ok(())
    }

    /// Transaction ledger file
    pub fn ledger_path(&self) -> PathBuf {
        self.with_suffix(".xid")
    }

    /// Page file
    pub fn db_path(&self) -> PathBuf {
        self.with_suffix(".db")
    }

    /// Log file
    pub fn log_path(&self) -> PathBuf {
        self.with_suffix(".log")
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_memory_size_parse() {
        assert_eq!("64MB".parse::<MemorySize>().unwrap().as_bytes(), 64 * MB);
        assert_eq!("512KB".parse::<MemorySize>().unwrap().as_bytes(), 512 * KB);
        assert_eq!("2gb".parse::<MemorySize>().unwrap().as_bytes(), 2 * GB);
        assert_eq!("81920".parse::<MemorySize>().unwrap().as_bytes(), 81920);
        assert_eq!(MemorySize::default().as_bytes(), 64 * MB);

        for bad in ["", "MB", "12TB", "x1MB", "-1MB", "99999999999999GB"] {
            assert!(
                matches!(bad.parse::<MemorySize>(), Err(KeelError::InvalidMemorySpec(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_memory_size_display() {
        assert_eq!(MemorySize::bytes(64 * MB).to_string(), "64MB");
        assert_eq!(MemorySize::bytes(3 * KB).to_string(), "3KB");
        assert_eq!(MemorySize::bytes(1000).to_string(), "1000");
    }

    #[test]
    fn test_file_names() {
        let config = Config::new("/tmp/data/mydb");
        assert_eq!(config.ledger_path(), PathBuf::from("/tmp/data/mydb.xid"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/data/mydb.db"));
        assert_eq!(config.log_path(), PathBuf::from("/tmp/data/mydb.log"));
    }

    #[test]
    fn test_load_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("keel.json");
        fs::write(&file, r#"{ "path": "/var/lib/keel/main", "memory": "16MB" }"#).unwrap();

        let config = Config::load(&file).unwrap();
        assert_eq!(config.path, PathBuf::from("/var/lib/keel/main"));
        assert_eq!(config.memory.as_bytes(), 16 * MB);

        fs::write(&file, r#"{ "path": "x", "memory": "lots" }"#).unwrap();
        assert!(matches!(Config::load(&file), Err(KeelError::Config(_))));

        fs::write(&file, r#"{ "path": "x" }"#).unwrap();
        assert_eq!(Config::load(&file).unwrap().memory, MemorySize::default());
    }
}
