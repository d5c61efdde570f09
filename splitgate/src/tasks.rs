use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use netplane::{BLACK_SET_4, BLACK_SET_6, WHITE_SET_4, WHITE_SET_6};
use resolver::{Corpus, KernelIpSets, Resolver, SetNames, Upstreams};
use rulesets::RuleFile;
use tokio::net::UdpSocket;

use crate::commands::runtime;
use crate::envcfg;
use crate::outputs;

/// Entry point for re-exec'd workers. Everything they need arrives through
/// the environment; the parent decides, the worker obeys.
pub(crate) fn run(role: &str, subrole: Option<&str>) -> Result<()> {
    raise_nofile_limit();

    let rt = runtime()?;

    match role {
        "dns" => rt.block_on(run_dns()),
        "outputs" => {
            let kind = subrole.context("The outputs role needs a subrole")?;
            rt.block_on(outputs::run(kind))
        }
        other => bail!("Unknown worker role `{other}`"),
    }
}

/// One socket per in-flight upstream exchange adds up on a busy LAN.
fn raise_nofile_limit() {
    use nix::sys::resource::{Resource, setrlimit};

    if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, 10_000, 10_000) {
        tracing::debug!("Failed to raise RLIMIT_NOFILE: {e}");
    }
}

async fn run_dns() -> Result<()> {
    let port: u16 = envcfg::required_parse("PORT")?;
    let direct_upstream = envcfg::required("CHINA_UPSTREAM")?;
    let proxy_upstream = envcfg::required("BANNED_UPSTREAM")?;

    let direct_domains = RuleFile::load(envcfg::required("CHINA_DOMAINS_FILE")?)?;
    let proxy_domains = RuleFile::load(envcfg::required("BANNED_DOMAINS_FILE")?)?;
    let blocked_domains = RuleFile::load(envcfg::required("BLOCKED_DOMAINS_FILE")?)?;
    let direct_routes = RuleFile::load(envcfg::required("CHINA_ROUTES_FILE")?)?;

    let corpus = Corpus::new(
        direct_domains.domains,
        proxy_domains.domains,
        blocked_domains.domains,
        direct_routes.v4.into_iter().chain(direct_routes.v6),
    )?;

    let resolver = Resolver::new(
        corpus,
        Upstreams::new(&direct_upstream, &proxy_upstream)?,
        SetNames {
            white4: WHITE_SET_4.to_owned(),
            black4: BLACK_SET_4.to_owned(),
            white6: WHITE_SET_6.to_owned(),
            black6: BLACK_SET_6.to_owned(),
        },
        Arc::new(KernelIpSets),
    );

    // The wildcard bind matters: queries REDIRECTed in from the LAN would
    // never reach a loopback-bound socket.
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind UDP port {port}"))?;

    Arc::new(resolver).serve(socket).await
}
