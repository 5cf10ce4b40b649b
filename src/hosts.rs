//! Allow/deny/preload host lists and other line-delimited input files.

use std::path::Path;

use tracing::warn;
use url::Url;

/// Reads a file and returns its non-empty lines.
pub fn read_file_lines<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;

    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Parses a host file: one host per line, optional scheme. Lines without a
/// scheme expand into both `http://host` and `https://host`. Unparsable
/// lines are logged and skipped; the load itself never fails.
pub fn parse_hosts_file(path: &str) -> Vec<Url> {
    if path.is_empty() {
        return Vec::new();
    }

    let lines = match read_file_lines(path) {
        Ok(lines) => lines,
        Err(e) => {
            warn!(error = %e, path, "Can not read hosts file.");
            return Vec::new();
        }
    };

    let mut hosts = Vec::new();

    for line in lines {
        if !line.starts_with("http://") && !line.starts_with("https://") {
            for scheme in ["http://", "https://"] {
                let candidate = format!("{scheme}{line}");

                match Url::parse(&candidate) {
                    Ok(url) => hosts.push(url),
                    Err(e) => warn!(error = %e, host = %candidate, "Host can not be parsed as a valid URL."),
                }
            }
        } else {
            match Url::parse(&line) {
                Ok(url) => hosts.push(url),
                Err(e) => warn!(error = %e, host = %line, "Host can not be parsed as a valid URL."),
            }
        }
    }

    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn hosts_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file creation failed");
        file.write_all(content.as_bytes()).expect("write failed");
        file
    }

    #[test]
    fn bare_host_expands_to_both_schemes() {
        let file = hosts_file("example.com\n");

        let hosts = parse_hosts_file(file.path().to_str().expect("path"));

        let rendered: Vec<String> = hosts.iter().map(|u| u.to_string()).collect();
        assert_eq!(rendered, vec!["http://example.com/", "https://example.com/"]);
    }

    #[test]
    fn schemed_host_stays_single() {
        let file = hosts_file("https://x.com\n");

        let hosts = parse_hosts_file(file.path().to_str().expect("path"));

        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].scheme(), "https");
    }

    #[test]
    fn blank_lines_are_discarded() {
        let file = hosts_file("\n\nexample.com\n\nhttps://y.test\n\n");

        let hosts = parse_hosts_file(file.path().to_str().expect("path"));

        assert_eq!(hosts.len(), 3);
    }

    #[test]
    fn unparsable_lines_are_skipped() {
        let file = hosts_file("https://ok.test\nhttp://\n");

        let hosts = parse_hosts_file(file.path().to_str().expect("path"));

        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn missing_file_yields_empty_list() {
        assert!(parse_hosts_file("/definitely/not/here.txt").is_empty());
        assert!(parse_hosts_file("").is_empty());
    }
}
