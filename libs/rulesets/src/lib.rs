//! Rule files: the flat text lists that drive classification.
//!
//! [`file`] parses them, [`fetch`] refreshes the remote-sourced ones and
//! [`state`] merges everything into the inputs for the kernel plane and the
//! resolver.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod fetch;
pub mod file;
pub mod state;

pub use fetch::update_all;
pub use file::RuleFile;
pub use state::State;

/// Remote-sourced lists, refreshed by `update`, read-only otherwise.
pub const DIRECT_DOMAINS_FILE: &str = "china.domains.ro.txt";
pub const PROXY_DOMAINS_FILE: &str = "banned.domains.ro.txt";
pub const DIRECT_ROUTES_FILE: &str = "china.routes.ro.txt";

/// User-editable lists, seeded with defaults by `update` when absent.
pub const BANNED_USER_FILE: &str = "banned.user.txt";
pub const IGNORED_USER_FILE: &str = "ignored.user.txt";
pub const BLOCKED_USER_FILE: &str = "blocked.user.txt";
