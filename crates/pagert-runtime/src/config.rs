use std::path::{Path, PathBuf};
use std::time::Duration;

use pagert_contracts::SITE_CONFIG_SCHEMA_VERSION;
use serde::Deserialize;

fn default_request_timeout_seconds() -> u64 {
    30
}

const MAX_REQUEST_TIMEOUT_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub schema_version: String,
    pub name: String,
    pub content_root: PathBuf,
    #[serde(default)]
    pub allow_executable_extensions_in_operations: bool,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

impl SiteConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("site config is not valid JSON: {e}"))
    }

    pub fn validate_basic(&self) -> Result<(), String> {
        if self.schema_version.trim() != SITE_CONFIG_SCHEMA_VERSION {
            return Err(format!(
                "site.schema_version mismatch: expected {} got {:?}",
                SITE_CONFIG_SCHEMA_VERSION, self.schema_version
            ));
        }
        if self.name.trim().is_empty() {
            return Err("site.name must be non-empty".to_string());
        }
        if self.name.contains('\n') || self.name.contains('\0') {
            return Err("site.name must not contain newlines or NUL".to_string());
        }
        if self.content_root.as_os_str().is_empty() {
            return Err("site.content_root must be non-empty".to_string());
        }
        if self.request_timeout_seconds > MAX_REQUEST_TIMEOUT_SECONDS {
            return Err(format!(
                "site.request_timeout_seconds must be 0..{MAX_REQUEST_TIMEOUT_SECONDS} (got {})",
                self.request_timeout_seconds
            ));
        }
        if let Some(dir) = &self.upload_dir {
            if dir.as_os_str().is_empty() {
                return Err("site.upload_dir must be non-empty when set".to_string());
            }
        }
        Ok(())
    }

    /// Resolves relative paths against `base` (usually the config file's directory).
    pub fn resolve(&self, base: &Path) -> SiteSettings {
        let content_root = absolutize(base, &self.content_root);
        let content_root = std::fs::canonicalize(&content_root).unwrap_or(content_root);
        let upload_dir = match &self.upload_dir {
            Some(dir) => absolutize(base, dir),
            None => std::env::temp_dir(),
        };
        SiteSettings {
            name: self.name.trim().to_string(),
            content_root,
            allow_executable_extensions: self.allow_executable_extensions_in_operations,
            request_timeout_seconds: self.request_timeout_seconds,
            upload_dir,
        }
    }
}

fn absolutize(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// The parts of a site's configuration the request engine consumes.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub name: String,
    pub content_root: PathBuf,
    pub allow_executable_extensions: bool,
    /// `0` disables the request timeout.
    pub request_timeout_seconds: u64,
    pub upload_dir: PathBuf,
}

impl SiteSettings {
    pub fn new(name: impl Into<String>, content_root: impl Into<PathBuf>) -> Self {
        SiteSettings {
            name: name.into(),
            content_root: content_root.into(),
            allow_executable_extensions: false,
            request_timeout_seconds: default_request_timeout_seconds(),
            upload_dir: std::env::temp_dir(),
        }
    }

    pub fn with_allow_executable_extensions(mut self, allow: bool) -> Self {
        self.allow_executable_extensions = allow;
        self
    }

    pub fn with_request_timeout_seconds(mut self, seconds: u64) -> Self {
        self.request_timeout_seconds = seconds;
        self
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_seconds))
        }
    }
}
