use std::time::{Duration, Instant};

use serde::Serialize;

use crate::tlsconn;

/// Joint deadline for all dials; a site that cannot complete a TLS handshake
/// by then is reported as failed.
const DEADLINE: Duration = Duration::from_secs(5);

const TARGETS: [&str; 4] = [
    "www.google.com",
    "www.youtube.com",
    "github.com",
    "www.baidu.com",
];

#[derive(Debug, Serialize)]
pub(crate) struct Report {
    pub targets: Vec<TargetReport>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TargetReport {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dials all targets in parallel and reports how each one went.
///
/// Purely informational: this tells apart "direct path works" (baidu) from
/// "proxy path works" (the rest) at a glance.
pub(crate) async fn run() -> Report {
    let (google, youtube, github, baidu) = tokio::join!(
        dial(TARGETS[0]),
        dial(TARGETS[1]),
        dial(TARGETS[2]),
        dial(TARGETS[3]),
    );

    Report {
        targets: vec![google, youtube, github, baidu],
    }
}

async fn dial(host: &str) -> TargetReport {
    let started = Instant::now();

    let result = tokio::time::timeout(DEADLINE, tlsconn::connect(&format!("{host}:443"), "", false)).await;

    match result {
        Ok(Ok(_stream)) => TargetReport {
            host: host.to_owned(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => TargetReport {
            host: host.to_owned(),
            latency_ms: None,
            error: Some(format!("{e:#}")),
        },
        Err(_) => TargetReport {
            host: host.to_owned(),
            latency_ms: None,
            error: Some(format!("timed out after {DEADLINE:?}")),
        },
    }
}
