use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};

fn default_backoff_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_data_dir() -> String {
    "data".into()
}

fn default_state_dir() -> String {
    "state".into()
}

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned.try_into().map_err(|e| {
            Error::msg(format!(
                "failed to deserialize config at '{}' in {}: {e}",
                path,
                self.path.display()
            ))
        })?;
        Ok(Some(parsed))
    }

    /// Directory relative paths in the document are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupTier {
    #[default]
    Free,
    Paid,
}

/// Read-only knobs a run consults. Owned by the user, never written by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupSettings {
    pub backs_up_media: bool,
    pub optimize_storage: bool,
    pub backup_tier: BackupTier,
    pub cellular_allowed: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    pub artifact_dir: Option<String>,
    pub backs_up_media: bool,
    pub optimize_storage: bool,
    pub backup_tier: BackupTier,
    pub cellular_allowed: bool,
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub key: Option<String>,
    pub key_env: Option<String>,
    pub plaintext: bool,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_dir: default_state_dir(),
            artifact_dir: None,
            backs_up_media: false,
            optimize_storage: false,
            backup_tier: BackupTier::Free,
            cellular_allowed: false,
            default_backoff_secs: default_backoff_secs(),
            max_attempts: default_max_attempts(),
            key: None,
            key_env: None,
            plaintext: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSection {
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            base_url_env: None,
            token: None,
            token_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupConfig {
    pub base_dir: PathBuf,
    pub backup: BackupSection,
    pub remote: RemoteSection,
}

impl BackupConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let backup: BackupSection = doc.deserialize_path("backup")?.unwrap_or_default();
        let remote: RemoteSection = doc.deserialize_path("remote")?.unwrap_or_default();
        if backup.max_attempts == 0 {
            return Err(Error::msg(format!(
                "[backup].max_attempts must be at least 1 in {}",
                doc.path.display()
            )));
        }
        Ok(Self {
            base_dir: doc.base_dir(),
            backup,
            remote,
        })
    }

    pub fn settings(&self) -> BackupSettings {
        BackupSettings {
            backs_up_media: self.backup.backs_up_media,
            optimize_storage: self.backup.optimize_storage,
            backup_tier: self.backup.backup_tier,
            cellular_allowed: self.backup.cellular_allowed,
        }
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.backup.default_backoff_secs)
    }

    fn resolve(&self, p: &str) -> PathBuf {
        let p = PathBuf::from(p);
        if p.is_absolute() {
            p
        } else {
            self.base_dir.join(p)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.backup.data_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.backup.state_dir)
    }

    pub fn artifact_dir(&self) -> PathBuf {
        match self.backup.artifact_dir.as_deref() {
            Some(p) => self.resolve(p),
            None => self.state_dir().join("tmp"),
        }
    }

    pub fn backup_key(&self) -> Result<BackupKey> {
        let raw = resolve_required_string_field(
            "backup.key",
            self.backup.key.as_deref(),
            self.backup.key_env.as_deref(),
        )?;
        BackupKey::from_base64(&raw)
    }
}

pub(crate) fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    let key = env_key?.trim();
    if key.is_empty() {
        return None;
    }
    let v = std::env::var(key).ok()?;
    let v = v.trim().to_string();
    if v.is_empty() { None } else { Some(v) }
}

pub(crate) fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    resolve_env_ref(env_key).or_else(|| {
        literal
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

pub(crate) fn resolve_required_string_field(
    name: &str,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    resolve_string_field(literal, env_key).ok_or_else(|| match env_key {
        Some(k) => Error::msg(format!("{name} is not set (checked env '{k}' and literal)")),
        None => Error::msg(format!("{name} is not set")),
    })
}

/// 32-byte symmetric key that seals backup artifacts.
#[derive(Clone, PartialEq, Eq)]
pub struct BackupKey([u8; 32]);

impl BackupKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(raw: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| Error::msg(format!("backup key is not valid base64: {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::msg(format!("backup key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BackupKey(<redacted>)")
    }
}
