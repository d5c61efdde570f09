use anyhow::Result;

use crate::CHAIN_PREFIX;
use crate::cmd::{Cmd, Runner};

pub(crate) const PREROUTING: &str = "SPLIT_PREROUTING";
pub(crate) const OUTPUT: &str = "SPLIT_OUTPUT";
pub(crate) const POSTROUTING: &str = "SPLIT_POSTROUTING";
pub(crate) const RULE: &str = "SPLIT_RULE";
pub(crate) const QUIC: &str = "SPLIT_QUIC";

/// (table, chain), in creation order.
const CHAINS: &[(&str, &str)] = &[
    ("mangle", PREROUTING),
    ("mangle", OUTPUT),
    ("mangle", RULE),
    ("mangle", QUIC),
    ("nat", PREROUTING),
    ("nat", OUTPUT),
    ("nat", POSTROUTING),
];

/// (table, built-in hook, our chain): the jumps that splice us into the
/// kernel's built-in chains.
const ENTRYPOINTS: &[(&str, &str, &str)] = &[
    ("mangle", "PREROUTING", PREROUTING),
    ("mangle", "OUTPUT", OUTPUT),
    ("nat", "PREROUTING", PREROUTING),
    ("nat", "OUTPUT", OUTPUT),
    ("nat", "POSTROUTING", POSTROUTING),
];

/// Creates all chains, then splices them into the built-in hooks.
///
/// Creation must complete before any splice: a jump into a chain that does
/// not exist yet fails, and a partially spliced ruleset steers live traffic.
pub(crate) fn create(runner: &impl Runner, iptables: &str) -> Result<()> {
    for &(table, chain) in CHAINS {
        runner.run(&Cmd::new(iptables).args(["-t", table, "-N", chain]))?;
    }

    for &(table, hook, chain) in ENTRYPOINTS {
        runner.run(&Cmd::new(iptables).args(["-t", table, "-A", hook, "-j", chain]))?;
    }

    Ok(())
}

/// Removes the splices, then every chain carrying our prefix.
///
/// Works from the live ruleset rather than [`CHAINS`]: a previous version may
/// have created chains this build no longer knows about.
pub(crate) fn delete(runner: &impl Runner, iptables: &str) -> Result<()> {
    for &(table, hook, chain) in ENTRYPOINTS.iter().rev() {
        runner.run(
            &Cmd::new(iptables)
                .args(["-t", table, "-D", hook, "-j", chain])
                .benign(&["Couldn't load target", "No chain/target/match by that name"]),
        )?;
    }

    for table in ["mangle", "nat"] {
        let listing = runner.run(&Cmd::new(iptables).args(["-t", table, "-S"]).tolerant())?;

        for chain in owned_chains(&listing) {
            // Flush before delete; a non-empty chain cannot be removed.
            runner.run(&Cmd::new(iptables).args(["-t", table, "-F", chain.as_str()]))?;
            runner.run(&Cmd::new(iptables).args(["-t", table, "-X", chain.as_str()]))?;
        }
    }

    Ok(())
}

fn owned_chains(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.strip_prefix("-N "))
        .map(|rest| rest.split_whitespace().next().unwrap_or(rest))
        .filter(|name| name.starts_with(CHAIN_PREFIX))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_prefixed_chains_are_ours() {
        let listing = "-P PREROUTING ACCEPT\n\
                       -N SPLIT_PREROUTING\n\
                       -N DOCKER\n\
                       -N SPLIT_RULE\n\
                       -A PREROUTING -j SPLIT_PREROUTING\n";

        assert_eq!(owned_chains(listing), vec!["SPLIT_PREROUTING", "SPLIT_RULE"]);
    }
}
