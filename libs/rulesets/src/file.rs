use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context as _, Result};

/// A parsed rule file, bucketed by what each line can be used for.
///
/// A line may be a domain, a plain IPv4/IPv6 address, or a CIDR of either
/// family. There is no validation beyond parseability: rule files are written
/// by hand and convenience beats strictness here.
#[derive(Debug, Default, Clone)]
pub struct RuleFile {
    pub v4: Vec<String>,
    pub v6: Vec<String>,
    pub domains: Vec<String>,
}

impl RuleFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule file `{}`", path.display()))?;

        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut file = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Anything with a colon can only be IPv6, plain or CIDR.
            if line.contains(':') {
                file.v6.push(line.to_owned());
                continue;
            }

            // A slash without a colon is an IPv4 CIDR.
            if line.contains('/') {
                file.v4.push(line.to_owned());
                continue;
            }

            if line.parse::<IpAddr>().is_ok() {
                file.v4.push(line.to_owned());
            } else {
                file.domains.push(line.to_owned());
            }
        }

        file
    }

    /// Appends bare IP literals, bucketing by family.
    pub fn add_ips<I, S>(&mut self, ips: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for ip in ips {
            let ip = ip.into();
            if ip.contains(':') {
                self.v6.push(ip);
            } else {
                self.v4.push(ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_lines_by_kind() {
        let file = RuleFile::parse(
            "# comment\n\
             \n\
             example.com\n\
             1.2.3.4\n\
             10.0.0.0/8\n\
             240c::6666\n\
             2001:db8::/32\n\
             \t  spaced.example.org  \n",
        );

        assert_eq!(file.domains, vec!["example.com", "spaced.example.org"]);
        assert_eq!(file.v4, vec!["1.2.3.4", "10.0.0.0/8"]);
        assert_eq!(file.v6, vec!["240c::6666", "2001:db8::/32"]);
    }

    #[test]
    fn unparseable_addresses_count_as_domains() {
        let file = RuleFile::parse("999.999.999.999\nlocalhost\n");

        assert!(file.v4.is_empty());
        assert_eq!(file.domains, vec!["999.999.999.999", "localhost"]);
    }

    #[test]
    fn add_ips_buckets_by_family() {
        let mut file = RuleFile::default();

        file.add_ips(["223.5.5.5", "240c::6666"]);

        assert_eq!(file.v4, vec!["223.5.5.5"]);
        assert_eq!(file.v6, vec!["240c::6666"]);
    }
}
