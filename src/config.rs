use serde::Deserialize;

/// Application configuration loaded from environment variables via `envy`.
///
/// Field names map directly to environment variable names (uppercased by
/// envy), so `PRIVATE`, `PORT`, `DOMAIN`, … are the canonical override
/// surface. Provide defaults via `.env` for local development; override via
/// real env vars in production / Docker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite connection string.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Filesystem root for uploaded files. Chunk sessions, thumbnails and
    /// album archives live in subdirectories of this root.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,

    /// Public base URL used when constructing file links.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Base URL of the landing pages, when served from a different host.
    #[serde(default)]
    pub home_domain: Option<String>,

    /// Honor `X-Forwarded-For` when resolving the client IP.
    #[serde(default)]
    pub trust_proxy: bool,

    /// When true, uploads require a valid token.
    #[serde(rename = "private", default)]
    pub private_uploads: bool,

    /// Allow new account registration.
    #[serde(default = "default_true")]
    pub enable_user_accounts: bool,

    /// Serve committed files from this process (with Content-Disposition
    /// support). Turn off when a reverse proxy serves the uploads root.
    #[serde(default = "default_true")]
    pub serve_files_with_server: bool,

    /// Per-file upload cap in MiB.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Chunk size advertised to chunked-upload clients, in MiB.
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,

    /// Upper bound on chunks per session; finalize rejects sessions outside
    /// `2..=max_chunks`.
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,

    /// Idle chunk sessions are discarded after this many seconds.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,

    /// Default public identifier length for files.
    #[serde(default = "default_identifier_length")]
    pub file_identifier_length: usize,

    /// Bounds for the client-requested `filelength` header.
    #[serde(default = "default_identifier_min")]
    pub file_identifier_min: usize,
    #[serde(default = "default_identifier_max")]
    pub file_identifier_max: usize,

    /// Album identifiers are always this long.
    #[serde(default = "default_identifier_length")]
    pub album_identifier_length: usize,

    /// Attempts the identifier allocator makes before giving up.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Probe identifier uniqueness against the uploads directory instead of
    /// the database. The database probe is the default because it catches
    /// identifier collisions across different extensions.
    #[serde(default)]
    pub filesystem_identifier_check: bool,

    /// Reject zero-byte uploads.
    #[serde(default = "default_true")]
    pub filter_empty_file: bool,

    /// `blacklist` or `whitelist`.
    #[serde(default = "default_filter_mode")]
    pub extension_filter_mode: String,

    /// Extensions (with leading dot) the filter applies to.
    #[serde(default = "default_extension_filter")]
    pub extension_filter: Vec<String>,

    /// Hard cap on files per multipart request.
    #[serde(default = "default_max_files_per_upload")]
    pub max_files_per_upload: usize,

    /// Hard cap on non-file fields per multipart request.
    #[serde(default = "default_max_fields_per_upload")]
    pub max_fields_per_upload: usize,

    /// Store the uploader's IP on file rows.
    #[serde(default = "default_true")]
    pub store_ip: bool,

    /// Derive the MIME type from the extension when the client omits it,
    /// instead of defaulting to application/octet-stream.
    #[serde(default)]
    pub mime_from_extension: bool,

    // ── Retention periods, hours, per usergroup ──────────────────────────
    //
    // 0 means permanent. The first element of a group's list is that
    // group's default; higher groups inherit the union of all lower
    // groups' lists (see services::retention).
    #[serde(default = "default_retention_anonymous")]
    pub retention_anonymous: Vec<f64>,
    #[serde(default = "default_retention_user")]
    pub retention_user: Vec<f64>,
    #[serde(default)]
    pub retention_moderator: Vec<f64>,
    #[serde(default)]
    pub retention_admin: Vec<f64>,
    #[serde(default)]
    pub retention_superadmin: Vec<f64>,

    // ── URL uploads ──────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub url_uploads_enabled: bool,

    /// Size cap for remote downloads in MiB, checked against Content-Length
    /// before transfer and against actual bytes after.
    #[serde(default = "default_url_max_size_mb")]
    pub url_max_size_mb: u64,

    /// Total budget for HEAD + GET of one remote URL, seconds. Deliberately
    /// short so upstream proxies do not evict the idle socket mid-fetch.
    #[serde(default = "default_url_fetch_timeout_secs")]
    pub url_fetch_timeout_secs: u64,

    /// Optional proxy template; `{url}` is replaced with the
    /// percent-encoded target.
    #[serde(default)]
    pub url_proxy: Option<String>,

    /// Separate extension filter for URL uploads. Falls back to the main
    /// filter when unset.
    #[serde(default)]
    pub url_extension_filter_mode: Option<String>,
    #[serde(default)]
    pub url_extension_filter: Option<Vec<String>>,

    // ── Tag stripping ────────────────────────────────────────────────────
    /// Allow clients to request metadata stripping via the `striptags`
    /// header.
    #[serde(default)]
    pub strip_tags_enabled: bool,

    /// Extensions that are never rewritten even when stripping is on.
    #[serde(default)]
    pub strip_tags_blacklist: Vec<String>,

    // ── Virus scanning (clamd) ───────────────────────────────────────────
    /// Host of the clamd daemon; scanning is disabled when unset.
    #[serde(default)]
    pub clamd_host: Option<String>,
    #[serde(default = "default_clamd_port")]
    pub clamd_port: u16,

    /// Users at or above this permission rank skip scanning.
    #[serde(default = "default_scan_bypass_rank")]
    pub scan_bypass_rank: i64,

    /// Files larger than this many MiB skip scanning. 0 disables the cap.
    #[serde(default)]
    pub scan_max_size_mb: u64,

    /// Extensions that skip scanning.
    #[serde(default)]
    pub scan_whitelist_extensions: Vec<String>,

    // ── Album archives ───────────────────────────────────────────────────
    /// Refuse ZIP generation when member sizes sum past this many MiB.
    #[serde(default = "default_zip_max_total_size_mb")]
    pub zip_max_total_size_mb: u64,

    // ── Thumbnails ───────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub thumbnails_enabled: bool,

    // ── Listing ──────────────────────────────────────────────────────────
    /// Rows per page for list endpoints.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    // ── Cloudflare cache purge ───────────────────────────────────────────
    #[serde(default)]
    pub cf_zone_id: Option<String>,
    #[serde(default)]
    pub cf_api_token: Option<String>,
    #[serde(default)]
    pub cf_user_service_key: Option<String>,
    #[serde(default)]
    pub cf_api_key: Option<String>,
    #[serde(default)]
    pub cf_email: Option<String>,
}

fn default_port() -> u16 {
    9999
}

fn default_database_url() -> String {
    "sqlite:database/db.sqlite3?mode=rwc".into()
}

fn default_uploads_dir() -> String {
    "uploads".into()
}

fn default_domain() -> String {
    "http://127.0.0.1:9999".into()
}

fn default_true() -> bool {
    true
}

fn default_max_size_mb() -> u64 {
    512
}

fn default_chunk_size_mb() -> u64 {
    10
}

fn default_max_chunks() -> u32 {
    512
}

fn default_chunk_timeout_secs() -> u64 {
    1800
}

fn default_identifier_length() -> usize {
    8
}

fn default_identifier_min() -> usize {
    4
}

fn default_identifier_max() -> usize {
    32
}

fn default_max_tries() -> u32 {
    16
}

fn default_filter_mode() -> String {
    "blacklist".into()
}

fn default_extension_filter() -> Vec<String> {
    [".exe", ".bat", ".cmd", ".msi", ".sh", ".jar", ".scr", ".com"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_files_per_upload() -> usize {
    20
}

fn default_max_fields_per_upload() -> usize {
    6
}

fn default_retention_anonymous() -> Vec<f64> {
    vec![0.0]
}

fn default_retention_user() -> Vec<f64> {
    vec![0.0, 24.0, 168.0, 720.0]
}

fn default_url_max_size_mb() -> u64 {
    32
}

fn default_url_fetch_timeout_secs() -> u64 {
    10
}

fn default_clamd_port() -> u16 {
    3310
}

fn default_scan_bypass_rank() -> i64 {
    75
}

fn default_zip_max_total_size_mb() -> u64 {
    512
}

fn default_page_size() -> usize {
    25
}

impl Config {
    /// Load configuration from the current process environment.
    ///
    /// Panics with a clear message if any variable fails to parse.
    pub fn from_env() -> Self {
        envy::from_env::<Config>().unwrap_or_else(|err| {
            panic!("configuration error: {err}\nCheck the environment variables against .env.example.");
        })
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn url_max_size_bytes(&self) -> u64 {
        self.url_max_size_mb * 1024 * 1024
    }

    pub fn zip_max_total_size_bytes(&self) -> u64 {
        self.zip_max_total_size_mb * 1024 * 1024
    }

    /// Scan size cap in bytes; `None` when uncapped.
    pub fn scan_max_size_bytes(&self) -> Option<u64> {
        match self.scan_max_size_mb {
            0 => None,
            mb => Some(mb * 1024 * 1024),
        }
    }

    /// Clamp a client-requested identifier length into the configured
    /// bounds, falling back to the default when absent.
    pub fn clamp_identifier_length(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(len) => len.clamp(self.file_identifier_min, self.file_identifier_max),
            None => self.file_identifier_length,
        }
    }
}

#[cfg(test)]
impl Config {
    /// A fully-defaulted configuration for tests, without touching the
    /// process environment.
    pub fn test_defaults() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are complete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_length_clamps_to_bounds() {
        let config = Config::test_defaults();
        assert_eq!(config.clamp_identifier_length(None), 8);
        assert_eq!(config.clamp_identifier_length(Some(2)), 4);
        assert_eq!(config.clamp_identifier_length(Some(64)), 32);
        assert_eq!(config.clamp_identifier_length(Some(12)), 12);
    }

    #[test]
    fn scan_cap_zero_means_uncapped() {
        let mut config = Config::test_defaults();
        assert_eq!(config.scan_max_size_bytes(), None);
        config.scan_max_size_mb = 1;
        assert_eq!(config.scan_max_size_bytes(), Some(1024 * 1024));
    }
}
