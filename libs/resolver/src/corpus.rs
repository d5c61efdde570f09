use std::collections::HashSet;
use std::net::IpAddr;

use anyhow::{Context as _, Result};
use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use ip_network_table::IpNetworkTable;

/// The classification corpus: which names and prefixes belong to which zone.
///
/// Built once at startup from the merged rule files and never mutated again.
pub struct Corpus {
    direct_suffixes: HashSet<String>,
    proxy_suffixes: HashSet<String>,
    blocked_exact: HashSet<String>,
    direct_routes: IpNetworkTable<()>,
}

/// Where a name belongs according to the suffix lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Direct,
    Proxy,
    Unknown,
}

impl Corpus {
    pub fn new(
        direct_domains: impl IntoIterator<Item = String>,
        proxy_domains: impl IntoIterator<Item = String>,
        blocked_domains: impl IntoIterator<Item = String>,
        direct_routes: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let mut routes = IpNetworkTable::new();
        for line in direct_routes {
            let network = parse_route(&line)
                .with_context(|| format!("Bad route entry `{line}` in direct route list"))?;
            routes.insert(network, ());
        }

        Ok(Self {
            direct_suffixes: direct_domains.into_iter().collect(),
            proxy_suffixes: proxy_domains.into_iter().collect(),
            blocked_exact: blocked_domains.into_iter().collect(),
            direct_routes: routes,
        })
    }

    /// Walks the suffixes of `name` from longest to shortest; the first list
    /// containing a suffix decides. A name on both lists is therefore decided
    /// by whichever holds the longer suffix.
    pub fn classify(&self, name: &str) -> Verdict {
        for suffix in suffixes(name) {
            if self.direct_suffixes.contains(suffix) {
                return Verdict::Direct;
            }
            if self.proxy_suffixes.contains(suffix) {
                return Verdict::Proxy;
            }
        }

        Verdict::Unknown
    }

    /// Exact-match check against the blocked names, trailing dot ignored.
    pub fn is_blocked(&self, name: &str) -> bool {
        self.blocked_exact
            .contains(name.strip_suffix('.').unwrap_or(name))
    }

    /// Does this address belong to the direct region?
    pub fn routes_contain(&self, ip: IpAddr) -> bool {
        self.direct_routes.longest_match(ip).is_some()
    }
}

fn parse_route(line: &str) -> Result<IpNetwork> {
    if line.contains('/') {
        return line.parse::<IpNetwork>().context("Not a CIDR");
    }

    let network = match line.parse::<IpAddr>().context("Not an address")? {
        IpAddr::V4(ip) => Ipv4Network::new(ip, 32).context("Bad IPv4 host route")?.into(),
        IpAddr::V6(ip) => Ipv6Network::new(ip, 128)
            .context("Bad IPv6 host route")?
            .into(),
    };

    Ok(network)
}

/// Yields `a.b.example.com`, `b.example.com`, `example.com`, `com` for
/// `a.b.example.com.`; the trailing root dot is stripped first.
fn suffixes(name: &str) -> impl Iterator<Item = &str> {
    let name = name.strip_suffix('.').unwrap_or(name);

    std::iter::successors((!name.is_empty()).then_some(name), |current| {
        let (_, rest) = current.split_once('.')?;
        (!rest.is_empty()).then_some(rest)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(direct: &[&str], proxy: &[&str]) -> Corpus {
        Corpus::new(
            direct.iter().map(|s| s.to_string()),
            proxy.iter().map(|s| s.to_string()),
            ["ads.example".to_owned()],
            ["1.2.0.0/16".to_owned(), "2001:250::/35".to_owned()],
        )
        .unwrap()
    }

    #[test]
    fn suffix_walk_is_longest_to_shortest() {
        assert_eq!(
            suffixes("xxx.yyy.example.com.").collect::<Vec<_>>(),
            vec!["xxx.yyy.example.com", "yyy.example.com", "example.com", "com"]
        );
    }

    #[test]
    fn subdomains_match_their_suffix() {
        let corpus = corpus(&["example.com"], &[]);

        assert_eq!(corpus.classify("a.b.example.com"), Verdict::Direct);
        assert_eq!(corpus.classify("example.com."), Verdict::Direct);
        assert_eq!(corpus.classify("fooexample.com"), Verdict::Unknown);
    }

    #[test]
    fn longer_suffix_wins_across_lists() {
        let corpus = corpus(&["com"], &["banned.com"]);

        assert_eq!(corpus.classify("www.banned.com"), Verdict::Proxy);
        assert_eq!(corpus.classify("other.com"), Verdict::Direct);
    }

    #[test]
    fn blocked_names_match_exactly() {
        let corpus = corpus(&[], &[]);

        assert!(corpus.is_blocked("ads.example"));
        assert!(corpus.is_blocked("ads.example."));
        assert!(!corpus.is_blocked("sub.ads.example"));
    }

    #[test]
    fn route_table_answers_membership() {
        let corpus = corpus(&[], &[]);

        assert!(corpus.routes_contain("1.2.3.4".parse().unwrap()));
        assert!(!corpus.routes_contain("9.9.9.9".parse().unwrap()));
        assert!(corpus.routes_contain("2001:250::1".parse().unwrap()));
    }

    #[test]
    fn host_routes_without_masks_are_accepted() {
        let corpus = Corpus::new(
            [],
            [],
            [],
            ["223.5.5.5".to_owned(), "240c::6666".to_owned()],
        )
        .unwrap();

        assert!(corpus.routes_contain("223.5.5.5".parse().unwrap()));
        assert!(!corpus.routes_contain("223.5.5.6".parse().unwrap()));
    }

    #[test]
    fn malformed_routes_are_fatal() {
        let result = Corpus::new([], [], [], ["not-a-route".to_owned()]);

        assert!(result.is_err());
    }
}
