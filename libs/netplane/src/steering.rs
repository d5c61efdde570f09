use anyhow::Result;

use crate::chains::{OUTPUT, POSTROUTING, PREROUTING, QUIC, RULE};
use crate::cmd::{Cmd, Runner};
use crate::{DIRECT_GROUP, DNS_PORT, Family, PROXY_GROUP, TPROXY_MARK, TPROXY_PORT};

/// Redirects every DNS lookup on the host and the LAN into the resolver.
///
/// Locally originated lookups are exempted for the two worker groups: the
/// resolver's own upstream queries and the proxy's lookups must reach the
/// real upstreams or nothing ever resolves.
pub(crate) fn proxy_dns(runner: &impl Runner, iptables: &str, family: Family) -> Result<()> {
    let port = DNS_PORT.to_string();
    let lo = family.loopback();

    runner.run(&Cmd::new(iptables).args([
        "-t", "nat", "-A", OUTPUT,
        "-p", "tcp", "-m", "tcp", "--dport", "53", "--syn",
        "-m", "owner", "!", "--gid-owner", PROXY_GROUP,
        "-m", "owner", "!", "--gid-owner", DIRECT_GROUP,
        "-j", "REDIRECT", "--to-ports", port.as_str(),
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "nat", "-A", OUTPUT,
        "-p", "udp", "-m", "udp", "--dport", "53",
        "-m", "conntrack", "--ctstate", "NEW",
        "-m", "owner", "!", "--gid-owner", PROXY_GROUP,
        "-m", "owner", "!", "--gid-owner", DIRECT_GROUP,
        "-j", "REDIRECT", "--to-ports", port.as_str(),
    ]))?;

    // Replies to redirected local lookups must come from the loopback
    // address the client sent to, or it discards them.
    runner.run(&Cmd::new(iptables).args([
        "-t", "nat", "-A", POSTROUTING,
        "-d", lo, "!", "-s", lo,
        "-j", "SNAT", "--to-source", lo,
    ]))?;

    runner.run(&Cmd::new(iptables).args([
        "-t", "nat", "-A", PREROUTING,
        "-p", "tcp", "-m", "tcp", "--dport", "53", "--syn",
        "-m", "addrtype", "!", "--src-type", "LOCAL",
        "-j", "REDIRECT", "--to-ports", port.as_str(),
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "nat", "-A", PREROUTING,
        "-p", "udp", "-m", "udp", "--dport", "53",
        "-m", "conntrack", "--ctstate", "NEW",
        "-m", "addrtype", "!", "--src-type", "LOCAL",
        "-j", "REDIRECT", "--to-ports", port.as_str(),
    ]))?;

    Ok(())
}

/// Marks proxy-bound flows and hands them to the TPROXY target.
pub(crate) fn tproxy(runner: &impl Runner, iptables: &str, family: Family) -> Result<()> {
    let white = family.white_set();
    let black = family.black_set();

    // The verdict chain: direct-and-not-banned destinations pass, everything
    // else is marked for diversion.
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", RULE,
        "-m", "set", "--match-set", white, "dst",
        "-m", "set", "!", "--match-set", black, "dst",
        "-j", "RETURN",
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", RULE,
        "-j", "CONNMARK", "--set-mark", TPROXY_MARK,
    ]))?;

    // Locally originated traffic.
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-m", "addrtype", "--dst-type", "LOCAL",
        "-j", "RETURN",
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-m", "conntrack", "--ctdir", "REPLY",
        "-j", "RETURN",
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-m", "owner", "--gid-owner", PROXY_GROUP,
        "-j", "RETURN",
    ]))?;

    // Port-53 traffic from anyone but the resolver group is already handled
    // by the nat redirect; the resolver's own upstream queries fall through
    // to the verdict chain so a banned upstream is reached via the proxy.
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-p", "tcp", "-m", "tcp", "--dport", "53",
        "-m", "owner", "!", "--gid-owner", DIRECT_GROUP,
        "-j", "RETURN",
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-p", "udp", "-m", "udp", "--dport", "53",
        "-m", "owner", "!", "--gid-owner", DIRECT_GROUP,
        "-j", "RETURN",
    ]))?;

    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-p", "tcp", "-m", "tcp", "--syn",
        "-j", RULE,
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-p", "udp", "-m", "conntrack", "--ctstate", "NEW,RELATED",
        "-j", RULE,
    ]))?;

    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-m", "connmark", "--mark", TPROXY_MARK,
        "-j", "MARK", "--set-mark", TPROXY_MARK,
    ]))?;

    // Forwarded traffic from the LAN.
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", PREROUTING,
        "-m", "addrtype", "--dst-type", "LOCAL",
        "-j", "RETURN",
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", PREROUTING,
        "-m", "conntrack", "--ctdir", "REPLY",
        "-j", "RETURN",
    ]))?;

    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", PREROUTING,
        "-p", "tcp", "-m", "tcp", "--syn", "!", "--dport", "53",
        "-m", "addrtype", "!", "--src-type", "LOCAL",
        "-j", RULE,
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", PREROUTING,
        "-p", "udp", "-m", "udp", "!", "--dport", "53",
        "-m", "conntrack", "--ctstate", "NEW,RELATED",
        "-m", "addrtype", "!", "--src-type", "LOCAL",
        "-j", RULE,
    ]))?;

    let port = TPROXY_PORT.to_string();
    for proto in ["tcp", "udp"] {
        runner.run(&Cmd::new(iptables).args([
            "-t", "mangle", "-A", PREROUTING,
            "-p", proto,
            "-m", "connmark", "--mark", TPROXY_MARK,
            "-j", "TPROXY",
            "--on-ip", family.loopback(),
            "--on-port", port.as_str(),
            "--tproxy-mark", TPROXY_MARK,
        ]))?;
    }

    Ok(())
}

/// Drops QUIC towards proxied destinations.
///
/// QUIC would bypass the TCP-based proxy output entirely; dropping UDP/443
/// makes clients fall back to TCP/443, which the TPROXY rules do divert.
pub(crate) fn drop_quic(runner: &impl Runner, iptables: &str, family: Family) -> Result<()> {
    let white = family.white_set();
    let black = family.black_set();

    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", QUIC,
        "-m", "set", "--match-set", white, "dst",
        "-m", "set", "!", "--match-set", black, "dst",
        "-j", "RETURN",
    ]))?;
    runner.run(&Cmd::new(iptables).args(["-t", "mangle", "-A", QUIC, "-j", "DROP"]))?;

    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", OUTPUT,
        "-p", "udp", "-m", "udp", "--dport", "443",
        "-m", "conntrack", "--ctdir", "ORIGINAL",
        "-m", "addrtype", "!", "--dst-type", "LOCAL",
        "-m", "owner", "!", "--gid-owner", PROXY_GROUP,
        "-j", QUIC,
    ]))?;
    runner.run(&Cmd::new(iptables).args([
        "-t", "mangle", "-A", PREROUTING,
        "-p", "udp", "-m", "udp", "--dport", "443",
        "-m", "conntrack", "--ctdir", "ORIGINAL",
        "-m", "addrtype", "!", "--dst-type", "LOCAL",
        "-j", QUIC,
    ]))?;

    Ok(())
}
