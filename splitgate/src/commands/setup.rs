use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use netplane::{Cmd, Host, Runner as _};

use super::ensure_root;

/// What we detected the host to be.
#[derive(Debug, PartialEq, Eq)]
enum Distro {
    OpenWrt { major: u32 },
    Ubuntu,
    Debian,
    Alpine,
}

pub(crate) fn setup(config_dir: &Path) -> Result<()> {
    ensure_root()?;

    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("Failed to create `{}`", config_dir.display()))?;
    std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))
        .context("Failed to restrict config dir permissions")?;

    let distro = detect_distro()?;
    tracing::info!(?distro, "Detected distribution");

    match distro {
        // Older releases ship opkg; newer ones switched to apk.
        Distro::OpenWrt { major } if major <= 24 => {
            install(&["opkg", "update"], &["opkg", "install"], OPENWRT_PACKAGES)
        }
        Distro::OpenWrt { .. } => {
            install(&["apk", "update"], &["apk", "add"], OPENWRT_PACKAGES)
        }
        Distro::Ubuntu | Distro::Debian => install(
            &["apt", "update"],
            &["apt-get", "install", "-y"],
            &["iptables", "ipset"],
        ),
        Distro::Alpine => install(
            &["apk", "update"],
            &["apk", "add"],
            // conntrack and friends live in the main iptables package;
            // the legacy one alone is not enough.
            &["iptables", "iptables-legacy", "ipset"],
        ),
    }
}

const OPENWRT_PACKAGES: &[&str] = &[
    "iptables-legacy",
    "ip6tables-legacy",
    "ip6tables-zz-legacy",
    "ipset",
    "kmod-ipt-conntrack",
    "iptables-mod-conntrack-extra",
    "iptables-mod-extra", // for addrtype
    "kmod-ipt-nat",
    "kmod-ipt-nat6",
    "shadow-groupadd",
    "iptables-mod-tproxy",
];

fn install(update: &[&str], install: &[&str], packages: &[&str]) -> Result<()> {
    run_logged(&Cmd::new(update[0]).args(&update[1..]))?;

    for package in packages {
        tracing::info!(package, "Installing");
        run_logged(&Cmd::new(install[0]).args(&install[1..]).arg(package))?;
    }

    Ok(())
}

fn run_logged(cmd: &Cmd) -> Result<()> {
    let output = Host.run(cmd)?;
    if !output.trim().is_empty() {
        tracing::info!("{}", output.trim());
    }

    Ok(())
}

fn detect_distro() -> Result<Distro> {
    if let Ok(release) = std::fs::read_to_string("/etc/openwrt_release") {
        let major = openwrt_major(&release).context("Cannot parse /etc/openwrt_release")?;
        return Ok(Distro::OpenWrt { major });
    }

    let os_release = std::fs::read_to_string("/etc/os-release")
        .context("Cannot determine the distribution: /etc/os-release is unreadable")?;

    match os_release_id(&os_release).as_deref() {
        Some("ubuntu") => Ok(Distro::Ubuntu),
        Some("debian") => Ok(Distro::Debian),
        Some("alpine") => Ok(Distro::Alpine),
        Some(other) => bail!("Unsupported distribution `{other}`; install iptables, ipset manually"),
        None => bail!("Cannot determine the distribution"),
    }
}

fn openwrt_major(release: &str) -> Option<u32> {
    for line in release.lines() {
        let Some(version) = line.strip_prefix("DISTRIB_RELEASE=") else {
            continue;
        };

        let version = version.trim().trim_matches('\'').trim_matches('"');
        return version.split('.').next()?.parse().ok();
    }

    None
}

fn os_release_id(content: &str) -> Option<String> {
    for line in content.lines() {
        let Some(id) = line.strip_prefix("ID=") else {
            continue;
        };

        return Some(id.trim().trim_matches('"').to_owned());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openwrt_release() {
        let release = "DISTRIB_ID='OpenWrt'\nDISTRIB_RELEASE='24.10.5'\n";

        assert_eq!(openwrt_major(release), Some(24));
    }

    #[test]
    fn parses_os_release_id() {
        assert_eq!(
            os_release_id("NAME=\"Ubuntu\"\nID=ubuntu\n").as_deref(),
            Some("ubuntu")
        );
        assert_eq!(
            os_release_id("ID=\"alpine\"\n").as_deref(),
            Some("alpine")
        );
    }
}
