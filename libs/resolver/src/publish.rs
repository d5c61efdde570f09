use std::net::IpAddr;

/// Names of the four kernel IP sets the resolver publishes into.
#[derive(Debug, Clone)]
pub struct SetNames {
    pub white4: String,
    pub black4: String,
    pub white6: String,
    pub black6: String,
}

/// Destination for resolved addresses.
///
/// Insertions are fire-and-forget: set membership only has to become visible
/// before the client acts on the DNS answer it has not even received yet.
pub trait IpSetSink: Send + Sync + 'static {
    fn add(&self, set: &str, ip: IpAddr);
}

/// Publishes via the `ipset` binary. Failures are logged and swallowed; a
/// missed insertion degrades steering for one destination, nothing more.
pub struct KernelIpSets;

impl IpSetSink for KernelIpSets {
    fn add(&self, set: &str, ip: IpAddr) {
        let set = set.to_owned();

        tokio::spawn(async move {
            let output = tokio::process::Command::new("ipset")
                .arg("-exist")
                .arg("add")
                .arg(&set)
                .arg(ip.to_string())
                .output()
                .await;

            match output {
                Ok(output) if output.status.success() => {
                    tracing::debug!(%set, %ip, "Added address to IP set");
                }
                Ok(output) => {
                    tracing::warn!(
                        %set,
                        %ip,
                        "Failed to add address to IP set: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Err(e) => {
                    tracing::warn!(%set, %ip, "Failed to run ipset: {e}");
                }
            }
        });
    }
}
