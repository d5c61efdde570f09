use std::fmt::Write as _;

use anyhow::Result;

use crate::cmd::{Cmd, Runner};
use crate::plane::Seeds;
use crate::{Family, SET_PREFIX};

/// Creates the four sets and bulk-loads their seed entries.
pub(crate) fn create_all(runner: &impl Runner, seeds: &Seeds) -> Result<()> {
    create(runner, Family::V4.white_set(), Family::V4, &seeds.white4)?;
    create(runner, Family::V6.white_set(), Family::V6, &seeds.white6)?;
    create(runner, Family::V4.black_set(), Family::V4, &seeds.black4)?;
    create(runner, Family::V6.black_set(), Family::V6, &seeds.black6)?;

    Ok(())
}

fn create(runner: &impl Runner, name: &str, family: Family, entries: &[String]) -> Result<()> {
    runner.run(&Cmd::new("ipset").args(["create", name, "hash:net", "family", family.set_family()]))?;

    // One restore batch instead of one process per entry; the route list
    // alone has thousands of prefixes.
    let mut batch = String::new();
    for entry in entries {
        let _ = writeln!(batch, "add {name} {entry}");
    }

    runner.run(&Cmd::new("ipset").args(["-!", "restore"]).stdin(batch.into_bytes()))?;

    Ok(())
}

/// Destroys every set carrying our prefix, whatever created it.
pub(crate) fn destroy_all(runner: &impl Runner) -> Result<()> {
    let listing = runner.run(&Cmd::new("ipset").args(["-n", "list"]).tolerant())?;

    for name in listing.lines().map(str::trim) {
        if !name.starts_with(SET_PREFIX) {
            continue;
        }

        runner.run(&Cmd::new("ipset").args(["destroy", name]))?;
    }

    Ok(())
}
