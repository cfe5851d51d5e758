use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use pagert_contracts::PAGERT_HOST_REPORT_SCHEMA_VERSION;
use pagert_runtime::{
    CompiledPage, Failure, MemoryLogger, PageCompiler as _, PageEngine, PageRequest, SiteConfig,
    SiteSettings, TracingLogger,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub mod program;

pub use program::{compile_program, CompileError, ProgramCompiler, ProgramPage};

/// Reads, validates and resolves a site config. Relative paths in the config are
/// taken relative to the config file's directory.
pub fn load_site(config_path: &Path) -> Result<SiteSettings> {
    let bytes = std::fs::read(config_path)
        .with_context(|| format!("read site config: {}", config_path.display()))?;
    let config = SiteConfig::from_json(&bytes)
        .map_err(|e| anyhow::anyhow!("{}: {e}", config_path.display()))?;
    config
        .validate_basic()
        .map_err(|e| anyhow::anyhow!("invalid site config {}: {e}", config_path.display()))?;

    let base = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = if base.is_absolute() {
        base
    } else {
        std::env::current_dir()
            .context("get current directory")?
            .join(base)
    };
    let settings = config.resolve(&base);
    if !settings.content_root.is_dir() {
        anyhow::bail!(
            "site content_root is not a directory: {}",
            settings.content_root.display()
        );
    }
    Ok(settings)
}

/// Reads and compiles a page program.
pub fn load_page(page_path: &Path) -> Result<CompiledPage> {
    let page_path = std::fs::canonicalize(page_path)
        .with_context(|| format!("resolve page: {}", page_path.display()))?;
    let source = std::fs::read(&page_path)
        .with_context(|| format!("read page program: {}", page_path.display()))?;
    ProgramCompiler
        .compile(&page_path, &source)
        .with_context(|| format!("compile page program: {}", page_path.display()))
}

/// Builds a request from CLI-style parts. Headers are `Name: value`.
pub fn build_request(
    method: &str,
    url: &str,
    headers: &[String],
    body: Option<Vec<u8>>,
) -> Result<PageRequest> {
    if method.trim().is_empty() {
        anyhow::bail!("--method must be non-empty");
    }
    if !url.starts_with('/') {
        anyhow::bail!("--url must start with '/', got {url:?}");
    }
    let mut request = PageRequest::new(method.trim(), url);
    for header in headers {
        let Some((name, value)) = header.split_once(':') else {
            anyhow::bail!("--header must be NAME:VALUE, got {header:?}");
        };
        if name.trim().is_empty() {
            anyhow::bail!("--header name must be non-empty, got {header:?}");
        }
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(body) = body {
        request = request.with_body(std::io::Cursor::new(body));
    }
    Ok(request)
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: &'static str,
    pub message: String,
    pub location: Option<String>,
}

impl From<&Failure> for FailureReport {
    fn from(f: &Failure) -> Self {
        FailureReport {
            kind: f.kind.as_str(),
            message: f.message.clone(),
            location: f.location.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogReport {
    pub level: &'static str,
    pub line: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub schema_version: &'static str,
    pub site: String,
    pub page: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body_b64: String,
    pub body_sha256: String,
    pub timed_out: bool,
    pub bad_request: bool,
    pub failure: Option<FailureReport>,
    pub operations: u64,
    pub pending_at_finalize: usize,
    pub uploads: usize,
    pub log: Vec<LogReport>,
}

/// Serves a single request and summarizes the outcome. Log lines are both
/// captured into the report and forwarded to `tracing`.
pub async fn serve_once(
    site: SiteSettings,
    page: &CompiledPage,
    request: PageRequest,
) -> HostReport {
    let site_name = site.name.clone();
    let logger = MemoryLogger::forwarding_to(Arc::new(TracingLogger));
    let engine = PageEngine::new(site).with_logger(Arc::new(logger.clone()));
    let (response, report) = engine.respond(page, request).await;

    let b64 = base64::engine::general_purpose::STANDARD;
    HostReport {
        schema_version: PAGERT_HOST_REPORT_SCHEMA_VERSION,
        site: site_name,
        page: page.path.display().to_string(),
        status: response.status,
        headers: response.headers,
        body_b64: b64.encode(&response.body),
        body_sha256: hex_lower(&Sha256::digest(&response.body)),
        timed_out: report.timed_out,
        bad_request: report.bad_request,
        failure: report.failure.as_ref().map(FailureReport::from),
        operations: report.operations,
        pending_at_finalize: report.pending_at_finalize,
        uploads: report.uploads,
        log: logger
            .lines()
            .into_iter()
            .map(|l| LogReport {
                level: l.level.as_str(),
                line: l.line,
            })
            .collect(),
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0F) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_lower_matches_known_digest() {
        assert_eq!(
            hex_lower(&Sha256::digest(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn build_request_parses_headers() {
        let request = build_request(
            "post",
            "/form.page?x=1",
            &["Content-Type: text/plain".to_string(), "X-A:b".to_string()],
            Some(b"hi".to_vec()),
        )
        .expect("request");
        assert_eq!(request.method, "POST");
        assert_eq!(request.content_type(), Some("text/plain"));
        assert_eq!(request.header("x-a"), Some("b"));
        assert_eq!(request.query(), Some("x=1"));
    }

    #[test]
    fn build_request_rejects_malformed_input() {
        assert!(build_request("GET", "/", &["nocolon".to_string()], None).is_err());
        assert!(build_request("GET", "relative", &[], None).is_err());
        assert!(build_request(" ", "/", &[], None).is_err());
    }
}
