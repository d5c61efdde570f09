use anyhow::{Context as _, Result};

use crate::cmd::Runner;
use crate::{Family, chains, detect, route, sets, steering, sysctl};

/// Seed entries for the four IP sets, as accepted by `ipset add`.
#[derive(Debug, Default, Clone)]
pub struct Seeds {
    pub white4: Vec<String>,
    pub white6: Vec<String>,
    pub black4: Vec<String>,
    pub black6: Vec<String>,
}

/// Handle over the whole kernel-side state.
///
/// Constructing one resolves which iptables binaries to use; every operation
/// goes through the handle so there is exactly one mutator of the kernel
/// plane in the process.
pub struct Plane<R> {
    runner: R,
    ip4tables: String,
    ip6tables: String,
}

impl<R: Runner> Plane<R> {
    pub fn new(runner: R) -> Result<Self> {
        let (ip4tables, ip6tables) = detect::find_iptables(&runner)?;

        Ok(Self {
            runner,
            ip4tables,
            ip6tables,
        })
    }

    /// Checks for the commands, matches and tables the build needs.
    pub fn preflight(&self) -> Result<()> {
        detect::check_requirements(&self.runner, &self.ip4tables)
    }

    /// Builds the complete steering state, in dependency order.
    ///
    /// Safe to call after an unclean crash: it tears down whatever is left of
    /// a previous run first.
    pub fn start(&self, seeds: &Seeds) -> Result<()> {
        self.stop().context("Pre-start cleanup failed")?;

        tracing::info!("Setting kernel parameters");
        sysctl::apply(&self.runner, true, true)?;

        tracing::info!("Creating chains");
        for iptables in [&self.ip4tables, &self.ip6tables] {
            chains::create(&self.runner, iptables)?;
        }

        tracing::info!("Creating IP sets");
        sets::create_all(&self.runner, seeds)?;

        tracing::info!("Adding policy routes");
        for family in Family::ALL {
            route::create(&self.runner, family)?;
        }

        tracing::info!("Dropping QUIC towards proxied destinations");
        self.per_family(steering::drop_quic)?;

        tracing::info!("Redirecting DNS to the resolver");
        self.per_family(steering::proxy_dns)?;

        tracing::info!("Diverting TCP/UDP flows to TPROXY");
        self.per_family(steering::tproxy)?;

        Ok(())
    }

    /// Removes every piece of state this crate may ever have created.
    ///
    /// Idempotent, and always covers both families: a previous run may have
    /// been configured differently than this one.
    pub fn stop(&self) -> Result<()> {
        chains::delete(&self.runner, &self.ip4tables)?;
        chains::delete(&self.runner, &self.ip6tables)?;

        for family in Family::ALL {
            route::delete(&self.runner, family)?;
        }

        sets::destroy_all(&self.runner)?;

        Ok(())
    }

    fn per_family(
        &self,
        build: impl Fn(&R, &str, Family) -> Result<()>,
    ) -> Result<()> {
        build(&self.runner, &self.ip4tables, Family::V4)?;
        build(&self.runner, &self.ip6tables, Family::V6)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;
    use crate::cmd::Cmd;

    /// Records every command; canned outputs are keyed by rendered line.
    #[derive(Default)]
    struct Recorder {
        log: RefCell<Vec<String>>,
        outputs: HashMap<String, String>,
    }

    impl Recorder {
        fn with_output(mut self, line: &str, output: &str) -> Self {
            self.outputs.insert(line.to_owned(), output.to_owned());
            self
        }

        fn lines(&self) -> Vec<String> {
            self.log.borrow().clone()
        }

        fn position(&self, needle: &str) -> usize {
            self.lines()
                .iter()
                .position(|line| line.contains(needle))
                .unwrap_or_else(|| panic!("no command matching `{needle}`"))
        }
    }

    impl Runner for Recorder {
        fn run(&self, cmd: &Cmd) -> Result<String> {
            let line = cmd.line();
            self.log.borrow_mut().push(line.clone());

            Ok(self.outputs.get(&line).cloned().unwrap_or_default())
        }
    }

    fn plane(runner: Recorder) -> Plane<Recorder> {
        Plane {
            runner,
            ip4tables: "iptables-legacy".to_owned(),
            ip6tables: "ip6tables-legacy".to_owned(),
        }
    }

    #[test]
    fn chains_are_created_before_they_are_spliced() {
        let plane = plane(Recorder::default());

        plane.start(&Seeds::default()).unwrap();

        let recorder = &plane.runner;
        for (chain, hook) in [
            ("SPLIT_PREROUTING", "PREROUTING"),
            ("SPLIT_OUTPUT", "OUTPUT"),
        ] {
            let created = recorder.position(&format!("-t mangle -N {chain}"));
            let spliced = recorder.position(&format!("-A {hook} -j {chain}"));
            assert!(created < spliced, "{chain} spliced before creation");
        }
    }

    #[test]
    fn start_begins_with_a_full_teardown() {
        let plane = plane(Recorder::default());

        plane.start(&Seeds::default()).unwrap();

        let recorder = &plane.runner;
        let first_delete = recorder.position("-D PREROUTING");
        let first_create = recorder.position("-N SPLIT_");
        assert!(first_delete < first_create);
    }

    #[test]
    fn verdict_chain_returns_before_it_marks() {
        let plane = plane(Recorder::default());

        plane.start(&Seeds::default()).unwrap();

        let recorder = &plane.runner;
        let lines = recorder.lines();
        let rule_return = lines
            .iter()
            .position(|l| l.starts_with("iptables-legacy") && l.contains("-A SPLIT_RULE") && l.contains("-j RETURN"))
            .unwrap();
        let rule_mark = lines
            .iter()
            .position(|l| l.starts_with("iptables-legacy") && l.contains("-A SPLIT_RULE") && l.contains("CONNMARK"))
            .unwrap();
        assert!(rule_return < rule_mark);
    }

    #[test]
    fn quic_chain_returns_direct_traffic_before_dropping() {
        let plane = plane(Recorder::default());

        plane.start(&Seeds::default()).unwrap();

        let recorder = &plane.runner;
        let lines = recorder.lines();
        let quic_return = lines
            .iter()
            .position(|l| l.starts_with("iptables-legacy") && l.contains("-A SPLIT_QUIC") && l.contains("RETURN"))
            .unwrap();
        let quic_drop = lines
            .iter()
            .position(|l| l.starts_with("iptables-legacy") && l.contains("-A SPLIT_QUIC") && l.contains("DROP"))
            .unwrap();
        assert!(quic_return < quic_drop);
    }

    #[test]
    fn seeds_are_loaded_through_one_restore_batch_per_set() {
        let seeds = Seeds {
            white4: vec!["10.0.0.0/8".to_owned(), "1.2.3.4".to_owned()],
            ..Default::default()
        };
        let plane = plane(Recorder::default());

        plane.start(&seeds).unwrap();

        let restores = plane
            .runner
            .lines()
            .iter()
            .filter(|l| l.contains("ipset -! restore"))
            .count();
        assert_eq!(restores, 4);
    }

    #[test]
    fn teardown_only_touches_owned_chains_and_sets() {
        let listing = "-P PREROUTING ACCEPT\n-N SPLIT_PREROUTING\n-N DOCKER\n";
        let recorder = Recorder::default()
            .with_output("iptables-legacy -t mangle -S", listing)
            .with_output("ipset -n list", "split_white_4\nsomeone_elses_set\n");
        let plane = plane(recorder);

        plane.stop().unwrap();

        let lines = plane.runner.lines();
        assert!(lines.contains(&"iptables-legacy -t mangle -F SPLIT_PREROUTING".to_owned()));
        assert!(lines.contains(&"iptables-legacy -t mangle -X SPLIT_PREROUTING".to_owned()));
        assert!(!lines.iter().any(|l| l.contains("-F DOCKER")));
        assert!(lines.contains(&"ipset destroy split_white_4".to_owned()));
        assert!(!lines.iter().any(|l| l.contains("destroy someone_elses_set")));
    }

    #[test]
    fn stop_twice_is_harmless() {
        let plane = plane(Recorder::default());

        plane.stop().unwrap();
        plane.stop().unwrap();
    }

    #[test]
    fn teardown_always_covers_both_families() {
        let plane = plane(Recorder::default());

        plane.stop().unwrap();

        let lines = plane.runner.lines();
        assert!(lines.iter().any(|l| l.starts_with("ip6tables-legacy")));
        assert!(lines.iter().any(|l| l.contains("ip -4 rule del")));
        assert!(lines.iter().any(|l| l.contains("ip -6 rule del")));
    }

    #[test]
    fn tproxy_hands_marked_flows_to_the_local_port() {
        let plane = plane(Recorder::default());

        plane.start(&Seeds::default()).unwrap();

        let lines = plane.runner.lines();
        assert!(lines.iter().any(|l| {
            l.starts_with("iptables-legacy")
                && l.contains("-j TPROXY")
                && l.contains("--on-ip 127.0.0.1")
                && l.contains("--on-port 60080")
        }));
        assert!(lines.iter().any(|l| {
            l.starts_with("ip6tables-legacy")
                && l.contains("-j TPROXY")
                && l.contains("--on-ip ::1")
        }));
    }
}
