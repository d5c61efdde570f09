//! The classifying DNS resolver.
//!
//! Every `A`/`AAAA` query is classified into the direct or the proxy zone and
//! forwarded to the matching upstream; names on neither list race both
//! upstreams. Answered addresses are published into the kernel IP sets that
//! the packet-steering rules match on, so by the time a client connects to a
//! freshly resolved address the kernel already knows which way to send it.
//!
//! All classification state is immutable after construction and shared
//! without locking; only the response cache is internally synchronised.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cache;
mod corpus;
mod publish;
mod server;
mod upstream;

pub use corpus::{Corpus, Verdict};
pub use publish::{IpSetSink, KernelIpSets, SetNames};
pub use server::Resolver;
pub use upstream::Upstreams;
