use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::AppError;

/// Extract the domain key used for rate limiting and robots caching.
///
/// This is the lowercased host, plus `:port` when the URL carries a
/// non-default port.
/// Example: `"https://Example.com:8443/a"` → `"example.com:8443"`
pub fn domain_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    match url.port() {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host),
    }
}

/// Parse a URL and extract its domain key in one go.
pub fn parse_domain(url: &str) -> Result<(Url, String), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{url}: {e}")))?;
    let domain =
        domain_key(&parsed).ok_or_else(|| AppError::InvalidUrl(format!("{url}: missing host")))?;
    Ok((parsed, domain))
}

/// Read a newline-delimited list (proxies, user agents).
///
/// Blank lines and lines starting with `#` are skipped; entries are trimmed.
pub fn read_list_file(path: &Path) -> Result<Vec<String>, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("Failed to read list file {}: {e}", path.display()))
    })?;
    Ok(parse_list(&content))
}

pub(crate) fn parse_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_domain_key_strips_default_port() {
        let url = Url::parse("https://Example.com/path?q=1").unwrap();
        assert_eq!(domain_key(&url).as_deref(), Some("example.com"));

        let url = Url::parse("https://example.com:443/").unwrap();
        assert_eq!(domain_key(&url).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_domain_key_keeps_explicit_port() {
        let url = Url::parse("http://127.0.0.1:8080/page").unwrap();
        assert_eq!(domain_key(&url).as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn test_parse_domain_rejects_garbage() {
        assert!(matches!(
            parse_domain("not-a-url"),
            Err(AppError::InvalidUrl(_))
        ));
        assert!(parse_domain("data:text/plain,hello").is_err());
    }

    #[test]
    fn test_read_list_file_skips_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# proxies").unwrap();
        writeln!(file, "http://10.0.0.1:8080").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  http://10.0.0.2:8080  ").unwrap();
        file.flush().unwrap();

        let list = read_list_file(file.path()).unwrap();
        assert_eq!(list, vec!["http://10.0.0.1:8080", "http://10.0.0.2:8080"]);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_returns_early() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let start = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &cancel).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(sleep_or_cancel(Duration::from_millis(1), &CancellationToken::new()).await);
    }

    #[test]
    fn test_read_list_file_missing() {
        assert!(read_list_file(Path::new("/nonexistent/list.txt")).is_err());
    }
}
