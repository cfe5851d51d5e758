//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O: site configs, page programs and host reports.

pub const SITE_CONFIG_SCHEMA_VERSION: &str = "pagert.site@0.1.0";
pub const PAGE_PROGRAM_SCHEMA_VERSION: &str = "pagert.page@0.1.0";
pub const PAGERT_HOST_REPORT_SCHEMA_VERSION: &str = "pagert-host.report@0.1.0";

/// File extensions (lowercase, without the dot) of page and module sources.
///
/// Files with these extensions inside a site's content root are access-guarded
/// for filesystem operations issued by pages.
pub const EXECUTABLE_EXTENSIONS: [&str; 2] = ["page", "pmod"];
