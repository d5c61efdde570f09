use std::io::Write as _;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result, bail};
use filetime::FileTime;

use crate::{
    BANNED_USER_FILE, BLOCKED_USER_FILE, DIRECT_DOMAINS_FILE, DIRECT_ROUTES_FILE,
    IGNORED_USER_FILE, PROXY_DOMAINS_FILE,
};

const DIRECT_DOMAINS_URL: &str =
    "https://raw.githubusercontent.com/felixonmars/dnsmasq-china-list/master/accelerated-domains.china.conf";
const PROXY_DOMAINS_URL: &str =
    "https://raw.githubusercontent.com/pexcn/daily/gh-pages/gfwlist/gfwlist.txt";
const DIRECT_ROUTES_URL: &str = "https://ftp.apnic.net/stats/apnic/delegated-apnic-latest";

/// The registry region whose routes make up the direct zone.
const REGION: &str = "CN";

/// Extended attribute carrying the upstream ETag of a downloaded list.
const ETAG_XATTR: &str = "user.splitgate.etag";

/// Hard ceiling for a single list download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// A transformed list smaller than this cannot be real data.
const MIN_PLAUSIBLE_SIZE: u64 = 1 << 10;

/// Refreshes all three remote lists and seeds missing user files.
///
/// Any transport, parse or rename error aborts the whole update: readers never
/// observe a partially written list because the replacement is an atomic
/// rename within the config directory.
pub async fn update_all(config_dir: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    for source in sources() {
        tracing::info!(file = source.file, "Refreshing rule list");
        source
            .refresh(&client, config_dir)
            .await
            .with_context(|| format!("Failed to refresh `{}`", source.file))?;
    }

    seed_user_defaults(config_dir)?;

    Ok(())
}

/// Writes the compiled-in baseline for each user file that does not exist yet.
///
/// Existing files are never touched; they belong to the user.
pub fn seed_user_defaults(config_dir: &Path) -> Result<()> {
    const DEFAULTS: &[(&str, &str)] = &[
        (BANNED_USER_FILE, include_str!("defaults/banned.default.txt")),
        (
            IGNORED_USER_FILE,
            include_str!("defaults/ignored.default.txt"),
        ),
        (
            BLOCKED_USER_FILE,
            include_str!("defaults/blocked.default.txt"),
        ),
    ];

    for (name, content) in DEFAULTS {
        let path = config_dir.join(name);
        if path.exists() {
            continue;
        }

        tracing::info!(file = name, "Seeding default user list");
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;
    }

    Ok(())
}

struct Source {
    url: &'static str,
    file: &'static str,
    transform: Transform,
}

fn sources() -> [Source; 3] {
    [
        Source {
            url: DIRECT_DOMAINS_URL,
            file: DIRECT_DOMAINS_FILE,
            transform: Transform::DirectDomains,
        },
        Source {
            url: PROXY_DOMAINS_URL,
            file: PROXY_DOMAINS_FILE,
            transform: Transform::Verbatim,
        },
        Source {
            url: DIRECT_ROUTES_URL,
            file: DIRECT_ROUTES_FILE,
            transform: Transform::RegionalRoutes,
        },
    ]
}

impl Source {
    async fn refresh(&self, client: &reqwest::Client, config_dir: &Path) -> Result<()> {
        let dest = config_dir.join(self.file);

        let mut response = client
            .get(self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("GET {} failed", self.url))?;

        let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED)
            .and_then(|s| httpdate::parse_http_date(&s).ok());
        let etag = header_string(&response, reqwest::header::ETAG);

        if is_unchanged(&dest, last_modified, etag.as_deref()) {
            tracing::info!(file = self.file, "Upstream list unchanged, skipping");
            return Ok(());
        }

        // The temporary file lives next to the destination so the final
        // rename stays within one filesystem.
        let mut tmp = tempfile::NamedTempFile::new_in(config_dir)
            .context("Failed to create temporary file")?;

        let mut splitter = LineSplitter::default();
        while let Some(chunk) = response.chunk().await.context("Failed to read body")? {
            for line in splitter.push(&chunk) {
                self.transform.apply(&line, tmp.as_file_mut())?;
            }
        }
        if let Some(line) = splitter.finish() {
            self.transform.apply(&line, tmp.as_file_mut())?;
        }
        tmp.as_file_mut().flush().context("Failed to flush")?;

        let size = tmp.as_file().metadata().context("Failed to stat")?.len();
        if size <= MIN_PLAUSIBLE_SIZE {
            bail!("Transformed list is implausibly small ({size} bytes), keeping the old file");
        }

        tmp.persist(&dest)
            .with_context(|| format!("Failed to replace `{}`", dest.display()))?;

        if let Some(mtime) = last_modified {
            filetime::set_file_mtime(&dest, FileTime::from_system_time(mtime))
                .context("Failed to set mtime")?;
        }
        if let Some(etag) = etag {
            xattr::set(&dest, ETAG_XATTR, etag.as_bytes()).context("Failed to set ETag xattr")?;
        }

        Ok(())
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)?
        .to_str()
        .ok()
        .map(str::to_owned)
}

/// The download is redundant when the server reports the same `Last-Modified`
/// as the file's mtime or the same `ETag` as the one we persisted.
fn is_unchanged(dest: &Path, last_modified: Option<SystemTime>, etag: Option<&str>) -> bool {
    let Ok(metadata) = std::fs::metadata(dest) else {
        return false;
    };

    if let (Some(remote), Ok(local)) = (last_modified, metadata.modified()) {
        let remote = FileTime::from_system_time(remote);
        let local = FileTime::from_system_time(local);
        if remote.unix_seconds() == local.unix_seconds() {
            return true;
        }
    }

    if let (Some(remote), Ok(Some(local))) = (etag, xattr::get(dest, ETAG_XATTR)) {
        if remote.as_bytes() == local.as_slice() {
            return true;
        }
    }

    false
}

#[derive(Clone, Copy)]
enum Transform {
    /// `server=/<name>/<ip>` dnsmasq directives; emit the name.
    DirectDomains,
    /// Already one domain per line.
    Verbatim,
    /// Registry allocation dump; emit CIDRs for [`REGION`].
    RegionalRoutes,
}

impl Transform {
    fn apply(&self, line: &str, out: &mut impl std::io::Write) -> Result<()> {
        let transformed = match self {
            Transform::DirectDomains => direct_domains_line(line),
            Transform::Verbatim => Some(line.to_owned()),
            Transform::RegionalRoutes => regional_routes_line(line),
        };

        if let Some(transformed) = transformed {
            writeln!(out, "{transformed}").context("Failed to write transformed line")?;
        }

        Ok(())
    }
}

fn direct_domains_line(line: &str) -> Option<String> {
    // server=/qq.com/114.114.114.114
    let mut parts = line.split('/');
    let prefix = parts.next()?;
    let name = parts.next()?;
    let upstream = parts.next()?;

    if prefix != "server=" || upstream.is_empty() || parts.next().is_some() {
        return None;
    }

    Some(name.to_owned())
}

fn regional_routes_line(line: &str) -> Option<String> {
    let v4_tag = format!("|{REGION}|ipv4|");
    let v6_tag = format!("|{REGION}|ipv6|");

    if line.contains(&v4_tag) {
        let parts = line.split('|').collect::<Vec<_>>();
        let start = parts.get(3)?;
        let count = parts.get(4)?.parse::<u32>().ok()?;
        if count == 0 {
            return None;
        }

        let bits = 32 - count.ilog2();
        return Some(format!("{start}/{bits}"));
    }

    if line.contains(&v6_tag) {
        let parts = line.split('|').collect::<Vec<_>>();
        let prefix = parts.get(3)?;
        let bits = parts.get(4)?.parse::<u32>().ok()?;
        return Some(format!("{prefix}/{bits}"));
    }

    None
}

/// Splits a byte stream into complete lines across chunk boundaries.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line = self.pending.drain(..=pos).collect::<Vec<_>>();
            line.pop(); // Strip the newline.
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }

        Some(String::from_utf8_lossy(&self.pending).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnsmasq_directives_yield_the_name() {
        assert_eq!(
            direct_domains_line("server=/qq.com/114.114.114.114"),
            Some("qq.com".to_owned())
        );
        assert_eq!(direct_domains_line("# comment"), None);
        assert_eq!(direct_domains_line("server=/broken"), None);
    }

    #[test]
    fn v4_allocations_become_cidrs() {
        assert_eq!(
            regional_routes_line("apnic|CN|ipv4|1.0.1.0|256|20110414|allocated"),
            Some("1.0.1.0/24".to_owned())
        );
        assert_eq!(
            regional_routes_line("apnic|CN|ipv4|36.0.0.0|16777216|20100810|allocated"),
            Some("36.0.0.0/8".to_owned())
        );
    }

    #[test]
    fn v6_allocations_pass_the_prefix_through() {
        assert_eq!(
            regional_routes_line("apnic|CN|ipv6|2001:250::|35|20000426|allocated"),
            Some("2001:250::/35".to_owned())
        );
    }

    #[test]
    fn other_regions_and_summaries_are_dropped() {
        assert_eq!(
            regional_routes_line("apnic|JP|ipv4|1.0.16.0|4096|20110412|allocated"),
            None
        );
        assert_eq!(regional_routes_line("apnic|*|ipv4|*|53557|summary"), None);
    }

    #[test]
    fn line_splitter_handles_chunk_boundaries() {
        let mut splitter = LineSplitter::default();

        assert_eq!(splitter.push(b"foo\nba"), vec!["foo".to_owned()]);
        assert_eq!(splitter.push(b"r\r\nbaz"), vec!["bar".to_owned()]);
        assert_eq!(splitter.finish(), Some("baz".to_owned()));
    }

    #[test]
    fn seeding_never_overwrites_user_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BANNED_USER_FILE), "mine\n").unwrap();

        seed_user_defaults(dir.path()).unwrap();

        let banned = std::fs::read_to_string(dir.path().join(BANNED_USER_FILE)).unwrap();
        assert_eq!(banned, "mine\n");

        for file in [IGNORED_USER_FILE, BLOCKED_USER_FILE] {
            let content = std::fs::read_to_string(dir.path().join(file)).unwrap();
            assert!(!content.is_empty());
        }
    }

    #[test]
    fn missing_file_is_never_unchanged() {
        assert!(!is_unchanged(
            Path::new("/nonexistent/file"),
            Some(SystemTime::now()),
            Some("\"abc\"")
        ));
    }

    #[test]
    fn matching_mtime_skips_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("list.txt");
        std::fs::write(&dest, "data").unwrap();

        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        filetime::set_file_mtime(&dest, FileTime::from_system_time(stamp)).unwrap();

        assert!(is_unchanged(&dest, Some(stamp), None));
        assert!(!is_unchanged(
            &dest,
            Some(stamp + Duration::from_secs(60)),
            None
        ));
    }

    #[test]
    fn matching_etag_skips_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("list.txt");
        std::fs::write(&dest, "data").unwrap();

        if xattr::set(&dest, ETAG_XATTR, b"\"v1\"").is_err() {
            // Filesystem without xattr support; nothing to assert here.
            return;
        }

        assert!(is_unchanged(&dest, None, Some("\"v1\"")));
        assert!(!is_unchanged(&dest, None, Some("\"v2\"")));
    }
}
