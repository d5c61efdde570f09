use anyhow::Result;

use crate::cmd::{Cmd, Runner};
use crate::{Family, ROUTE_TABLE, TPROXY_MARK};

/// Routes marked flows into the local stack.
///
/// `route_localnet` merely permits delivering externally received packets to
/// loopback addresses; these two entries are what actually makes it happen:
/// the rule sends marked packets to our table, and the table's single
/// `local default` route hands them to a local socket while keeping the
/// original destination intact. See
/// <https://www.kernel.org/doc/Documentation/networking/tproxy.txt>.
pub(crate) fn create(runner: &impl Runner, family: Family) -> Result<()> {
    let table = ROUTE_TABLE.to_string();

    runner.run(&Cmd::new("ip").args([
        family.ip_flag(),
        "rule",
        "add",
        "fwmark",
        TPROXY_MARK,
        "table",
        table.as_str(),
    ]))?;
    runner.run(&Cmd::new("ip").args([
        family.ip_flag(),
        "route",
        "add",
        "local",
        "default",
        "dev",
        "lo",
        "table",
        table.as_str(),
    ]))?;

    Ok(())
}

const ABSENT: &[&str] = &[
    "No such file or directory",
    "No such process",
    "table does not exist",
];

pub(crate) fn delete(runner: &impl Runner, family: Family) -> Result<()> {
    let table = ROUTE_TABLE.to_string();

    runner.run(
        &Cmd::new("ip")
            .args([family.ip_flag(), "rule", "del", "table", table.as_str()])
            .benign(ABSENT),
    )?;
    runner.run(
        &Cmd::new("ip")
            .args([family.ip_flag(), "route", "flush", "table", table.as_str()])
            .benign(ABSENT),
    )?;
    // Flushing alone has left the table looking occupied on some kernels;
    // delete it explicitly as well.
    runner.run(
        &Cmd::new("ip")
            .args([family.ip_flag(), "route", "del", "table", table.as_str()])
            .benign(ABSENT),
    )?;

    Ok(())
}
