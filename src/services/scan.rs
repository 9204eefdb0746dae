//! Malware scanning through a clamd daemon.
//!
//! Files are streamed to clamd over TCP with the `INSTREAM` command, either
//! inline while the upload is being written (passthrough) or post-hoc from
//! disk. Both paths end in one [`ScanVerdict`].

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected(Vec<String>),
    /// clamd answered something that is neither OK nor FOUND, e.g. its
    /// stream size limit was exceeded.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Scanner {
    host: String,
    port: u16,
    bypass_rank: i64,
    max_size: Option<u64>,
    whitelist: Vec<String>,
}

impl Scanner {
    /// Returns `None` when no clamd host is configured; the ingest pipeline
    /// treats an absent scanner as "scanning disabled".
    pub fn from_config(config: &Config) -> Option<Self> {
        let host = config.clamd_host.clone()?;
        Some(Self {
            host,
            port: config.clamd_port,
            bypass_rank: config.scan_bypass_rank,
            max_size: config.scan_max_size_bytes(),
            whitelist: config
                .scan_whitelist_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        })
    }

    /// Bypass policy: trusted group, whitelisted extension, or a file past
    /// the configured scan size cap.
    pub fn should_bypass(&self, rank: Option<i64>, extension: &str, size: u64) -> bool {
        if rank.is_some_and(|r| r >= self.bypass_rank) {
            return true;
        }
        if self.whitelist.contains(&extension.to_ascii_lowercase()) {
            return true;
        }
        if let Some(cap) = self.max_size {
            if size > cap {
                return true;
            }
        }
        false
    }

    /// Opens a passthrough stream: callers feed the upload body as it is
    /// written and collect the verdict with [`ScanStream::finish`].
    pub async fn begin_stream(&self) -> AppResult<ScanStream> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                tracing::error!("clamd connect failed: {e}");
                AppError::ScannerUnavailable
            })?;
        stream.write_all(b"zINSTREAM\0").await.map_err(|e| {
            tracing::error!("clamd handshake failed: {e}");
            AppError::ScannerUnavailable
        })?;
        Ok(ScanStream { stream })
    }

    /// Scans a finished file from disk.
    pub async fn scan_path(&self, path: &Path) -> AppResult<ScanVerdict> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| AppError::Internal(format!("scan open failed: {e}")))?;

        let mut scan = self.begin_stream().await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| AppError::Internal(format!("scan read failed: {e}")))?;
            if n == 0 {
                break;
            }
            scan.update(&buf[..n]).await?;
        }
        scan.finish().await
    }
}

/// One in-flight INSTREAM conversation. Chunks are length-prefixed; a
/// zero-length chunk terminates the stream and clamd answers with a single
/// NUL-terminated line.
pub struct ScanStream {
    stream: TcpStream,
}

impl ScanStream {
    pub async fn update(&mut self, chunk: &[u8]) -> AppResult<()> {
        // clamd frames are capped at u32; uploads feed much smaller buffers.
        let len = u32::try_from(chunk.len())
            .map_err(|_| AppError::Internal("scan chunk too large".into()))?;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(scan_io_err)?;
        self.stream.write_all(chunk).await.map_err(scan_io_err)?;
        Ok(())
    }

    pub async fn finish(mut self) -> AppResult<ScanVerdict> {
        self.stream
            .write_all(&0u32.to_be_bytes())
            .await
            .map_err(scan_io_err)?;

        let mut reader = BufReader::new(self.stream);
        let mut response = Vec::new();
        reader
            .read_to_end(&mut response)
            .await
            .map_err(scan_io_err)?;

        Ok(parse_verdict(&String::from_utf8_lossy(&response)))
    }
}

fn scan_io_err(e: std::io::Error) -> AppError {
    tracing::error!("clamd stream error: {e}");
    AppError::ScannerUnavailable
}

/// clamd answers `stream: OK`, `stream: <name> FOUND`, or an ERROR line.
fn parse_verdict(response: &str) -> ScanVerdict {
    let line = response.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if line.ends_with("OK") {
        return ScanVerdict::Clean;
    }
    if let Some(found) = line.strip_suffix(" FOUND") {
        let name = found.rsplit(": ").next().unwrap_or(found).to_string();
        return ScanVerdict::Infected(vec![name]);
    }
    ScanVerdict::Unknown
}

/// Collapses per-file verdicts into one request-level rejection message, or
/// `None` when everything is clean. Infections dominate; unscannable files
/// only surface when nothing was infected.
pub fn aggregate_verdicts(results: &[(String, ScanVerdict)]) -> Option<String> {
    let mut threats: Vec<&str> = Vec::new();
    let mut unscannable: Vec<&str> = Vec::new();

    for (name, verdict) in results {
        match verdict {
            ScanVerdict::Clean => {}
            ScanVerdict::Infected(viruses) => {
                threats.push(viruses.first().map(String::as_str).unwrap_or("malware"));
            }
            ScanVerdict::Unknown => unscannable.push(name.as_str()),
        }
    }

    if let Some(first) = threats.first() {
        let suffix = if threats.len() > 1 { ", and more" } else { "" };
        return Some(format!("Threat detected: {first}{suffix}"));
    }
    if let Some(first) = unscannable.first() {
        let suffix = if unscannable.len() > 1 { ", and more" } else { "" };
        return Some(format!("Unable to scan: {first}{suffix}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parsing_covers_clamd_responses() {
        assert_eq!(parse_verdict("stream: OK\0"), ScanVerdict::Clean);
        assert_eq!(
            parse_verdict("stream: Eicar-Test-Signature FOUND\0"),
            ScanVerdict::Infected(vec!["Eicar-Test-Signature".into()])
        );
        assert_eq!(
            parse_verdict("INSTREAM size limit exceeded. ERROR\0"),
            ScanVerdict::Unknown
        );
        assert_eq!(parse_verdict(""), ScanVerdict::Unknown);
    }

    #[test]
    fn bypass_policy() {
        let scanner = Scanner {
            host: "localhost".into(),
            port: 3310,
            bypass_rank: 75,
            max_size: Some(1024),
            whitelist: vec![".pdf".into()],
        };

        assert!(scanner.should_bypass(Some(75), ".bin", 10));
        assert!(!scanner.should_bypass(Some(50), ".bin", 10));
        assert!(!scanner.should_bypass(None, ".bin", 10));
        assert!(scanner.should_bypass(None, ".pdf", 10));
        assert!(scanner.should_bypass(None, ".PDF", 10));
        assert!(scanner.should_bypass(None, ".bin", 4096));
    }

    #[test]
    fn aggregation_prefers_threats_over_unscannable() {
        let clean = vec![("a.bin".to_string(), ScanVerdict::Clean)];
        assert_eq!(aggregate_verdicts(&clean), None);

        let infected = vec![
            ("a.bin".to_string(), ScanVerdict::Infected(vec!["Eicar".into()])),
            ("b.bin".to_string(), ScanVerdict::Unknown),
            ("c.bin".to_string(), ScanVerdict::Infected(vec!["Worm".into()])),
        ];
        assert_eq!(
            aggregate_verdicts(&infected),
            Some("Threat detected: Eicar, and more".into())
        );

        let unknown = vec![
            ("a.bin".to_string(), ScanVerdict::Unknown),
            ("b.bin".to_string(), ScanVerdict::Clean),
        ];
        assert_eq!(
            aggregate_verdicts(&unknown),
            Some("Unable to scan: a.bin".into())
        );
    }
}
