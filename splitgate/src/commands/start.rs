use std::path::Path;

use anyhow::{Result, anyhow};
use netplane::{DNS_PORT, Groups, Host, Plane, Runner, Seeds, ensure_groups};
use rulesets::State;

use crate::admin;
use crate::config::{CONFIG_FILE, Config, OutputVariant};
use crate::signals;
use crate::supervisor::{self, Worker};

use super::{ensure_root, runtime};

/// Direct-zone resolvers: always reachable without the proxy.
const DIRECT_DNS: [&str; 2] = ["223.5.5.5", "240c::6666"];

/// Proxy-zone resolvers: must transit the proxy, or they are poisoned.
const PROXY_DNS: [&str; 2] = ["8.8.8.8", "2001:4860:4860::8888"];

const DIRECT_UPSTREAM: &str = "223.5.5.5";
const PROXY_UPSTREAM: &str = "8.8.8.8";

pub(crate) fn start(config_dir: &Path) -> Result<()> {
    ensure_root()?;

    // Validate the configuration before touching any kernel state.
    let config = Config::load(&config_dir.join(CONFIG_FILE))?;
    let (output_name, output) = config.current_output()?;
    let variant = output.variant()?;
    tracing::info!(output = output_name, "Using configured proxy output");

    let plane = Plane::new(Host)?;
    plane.preflight()?;
    let groups = ensure_groups(&Host)?;

    tracing::info!("Loading classification state");
    let mut state = State::load(config_dir)?;
    state.add_ignored_ips(DIRECT_DNS);
    state.add_banned_ips(PROXY_DNS);

    let seeds = Seeds {
        white4: state.white4(),
        white6: state.white6(),
        black4: state.black4(),
        black6: state.black6(),
    };

    // Leftovers of a crashed run would fight us over ports and rules.
    supervisor::kill_stragglers();

    let result = build_and_run(&plane, &seeds, &state, &groups, variant);

    tracing::info!("Restoring system state");
    if let Err(e) = plane.stop() {
        tracing::warn!("Teardown failed: {e:#}");
    }
    supervisor::kill_stragglers();
    tracing::info!("System state restored");

    result
}

fn build_and_run(
    plane: &Plane<impl Runner>,
    seeds: &Seeds,
    state: &State,
    groups: &Groups,
    variant: OutputVariant,
) -> Result<()> {
    plane.start(seeds)?;

    let rt = runtime()?;
    rt.block_on(async {
        // The merged files stay alive for as long as the workers read them.
        let direct_domains = state.direct_domains_file()?;
        let proxy_domains = state.proxy_domains_file()?;
        let blocked_domains = state.blocked_domains_file()?;
        let direct_routes = state.direct_routes_file()?;

        tracing::info!("Spawning resolver worker");
        let mut dns = supervisor::spawn_worker(
            "dns",
            &["tasks", "dns"],
            groups.direct_gid,
            &[
                ("PORT", DNS_PORT.to_string()),
                ("CHINA_UPSTREAM", DIRECT_UPSTREAM.to_owned()),
                ("BANNED_UPSTREAM", PROXY_UPSTREAM.to_owned()),
                ("CHINA_DOMAINS_FILE", path_string(&direct_domains)),
                ("BANNED_DOMAINS_FILE", path_string(&proxy_domains)),
                ("BLOCKED_DOMAINS_FILE", path_string(&blocked_domains)),
                ("CHINA_ROUTES_FILE", path_string(&direct_routes)),
            ],
        )?;

        tracing::info!("Spawning proxy output worker");
        let mut output = spawn_output(groups, variant)?;

        let (admin_stop, admin_stopped) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(admin_stopped).await {
                tracing::warn!("Admin server failed: {e:#}");
            }
        });

        let mut terminate = signals::Terminate::new()?;

        tracing::info!("All set");

        let result = tokio::select! {
            () = terminate.recv() => {
                tracing::info!("Caught SIGINT / SIGTERM");
                Ok(())
            }
            status = dns.wait() => {
                Err(anyhow!("Resolver worker exited prematurely: {:?}", status))
            }
            status = output.wait() => {
                Err(anyhow!("Proxy output worker exited prematurely: {:?}", status))
            }
        };

        let _ = admin_stop.send(());
        dns.shutdown().await;
        output.shutdown().await;

        result
    })
}

fn spawn_output(groups: &Groups, variant: OutputVariant) -> Result<Worker> {
    let gid = groups.proxy_gid;

    match variant {
        OutputVariant::Http2Socks(c) => supervisor::spawn_worker(
            "outputs/http2socks",
            &["tasks", "outputs", "http2socks"],
            gid,
            &[("SERVER", c.server), ("TOKEN", c.token)],
        ),
        OutputVariant::Trojan(c) => supervisor::spawn_worker(
            "outputs/trojan",
            &["tasks", "outputs", "trojan"],
            gid,
            &[
                ("TROJAN_SERVER", c.server),
                ("TROJAN_PASSWORD", c.password),
                ("TROJAN_INSECURE", c.insecure_skip_verify.to_string()),
                ("TROJAN_SNI", c.sni),
            ],
        ),
        OutputVariant::Ssh(c) => supervisor::spawn_worker(
            "outputs/ssh",
            &["tasks", "outputs", "ssh"],
            gid,
            &[
                ("SSH_USERNAME", c.username),
                ("SSH_PASSWORD", c.password),
                ("SSH_SERVER", c.server),
            ],
        ),
        OutputVariant::Socks5(c) => supervisor::spawn_worker(
            "outputs/socks5",
            &["tasks", "outputs", "socks5"],
            gid,
            &[("SOCKS5_SERVER", c.server)],
        ),
    }
}

fn path_string(path: &tempfile::TempPath) -> String {
    path.to_string_lossy().into_owned()
}
