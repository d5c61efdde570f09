use std::io::Write as _;
use std::path::Path;

use anyhow::{Context as _, Result};
use tempfile::TempPath;

use crate::file::RuleFile;
use crate::{
    BANNED_USER_FILE, BLOCKED_USER_FILE, DIRECT_DOMAINS_FILE, DIRECT_ROUTES_FILE,
    IGNORED_USER_FILE, PROXY_DOMAINS_FILE,
};

/// The merged classification state, assembled once at startup.
///
/// Baseline lists come from the config directory; imperative additions (the
/// configured resolver addresses) are layered on top before the seed sets and
/// merged files are materialised.
#[derive(Debug)]
pub struct State {
    direct_domains: RuleFile,
    proxy_domains: RuleFile,
    direct_routes: RuleFile,
    banned_user: RuleFile,
    ignored_user: RuleFile,
    blocked_user: RuleFile,

    extra_banned: RuleFile,
    extra_ignored: RuleFile,
}

impl State {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let load = |name: &str| {
            RuleFile::load(config_dir.join(name)).with_context(|| {
                format!("Missing or unreadable rule file `{name}`; run `splitgate update` first")
            })
        };

        Ok(Self {
            direct_domains: load(DIRECT_DOMAINS_FILE)?,
            proxy_domains: load(PROXY_DOMAINS_FILE)?,
            direct_routes: load(DIRECT_ROUTES_FILE)?,
            banned_user: load(BANNED_USER_FILE)?,
            ignored_user: load(IGNORED_USER_FILE)?,
            blocked_user: load(BLOCKED_USER_FILE)?,
            extra_banned: RuleFile::default(),
            extra_ignored: RuleFile::default(),
        })
    }

    /// Addresses that must take the direct path regardless of any list, e.g.
    /// the direct resolver itself.
    pub fn add_ignored_ips<'a>(&mut self, ips: impl IntoIterator<Item = &'a str>) {
        self.extra_ignored.add_ips(ips);
    }

    /// Addresses that must take the proxy path regardless of any list, e.g.
    /// the proxy resolver itself.
    pub fn add_banned_ips<'a>(&mut self, ips: impl IntoIterator<Item = &'a str>) {
        self.extra_banned.add_ips(ips);
    }

    /// Seed entries for the white IPv4 set.
    pub fn white4(&self) -> Vec<String> {
        let mut ips = self.ignored_user.v4.clone();
        ips.extend_from_slice(&self.direct_routes.v4);
        ips.extend_from_slice(&self.extra_ignored.v4);
        ips
    }

    pub fn white6(&self) -> Vec<String> {
        let mut ips = self.ignored_user.v6.clone();
        ips.extend_from_slice(&self.direct_routes.v6);
        ips.extend_from_slice(&self.extra_ignored.v6);
        ips
    }

    pub fn black4(&self) -> Vec<String> {
        let mut ips = self.banned_user.v4.clone();
        ips.extend_from_slice(&self.extra_banned.v4);
        ips
    }

    pub fn black6(&self) -> Vec<String> {
        let mut ips = self.banned_user.v6.clone();
        ips.extend_from_slice(&self.extra_banned.v6);
        ips
    }

    /// Baseline direct domains plus the user's ignored domains, materialised
    /// for the resolver worker. The file lives as long as the returned handle.
    pub fn direct_domains_file(&self) -> Result<TempPath> {
        materialise([&self.direct_domains.domains, &self.ignored_user.domains])
    }

    /// Baseline proxy domains plus the user's banned domains.
    pub fn proxy_domains_file(&self) -> Result<TempPath> {
        materialise([&self.proxy_domains.domains, &self.banned_user.domains])
    }

    pub fn blocked_domains_file(&self) -> Result<TempPath> {
        materialise([&self.blocked_user.domains])
    }

    /// All direct-zone prefixes, both families, one per line.
    pub fn direct_routes_file(&self) -> Result<TempPath> {
        materialise([&self.direct_routes.v4, &self.direct_routes.v6])
    }
}

fn materialise<'a>(sections: impl IntoIterator<Item = &'a Vec<String>>) -> Result<TempPath> {
    let mut file = tempfile::NamedTempFile::new().context("Failed to create temporary file")?;

    for section in sections {
        for line in section {
            writeln!(file, "{line}").context("Failed to write temporary file")?;
        }
    }
    file.as_file_mut()
        .flush()
        .context("Failed to flush temporary file")?;

    Ok(file.into_temp_path())
}
