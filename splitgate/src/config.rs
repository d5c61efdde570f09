use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "splitgate.yaml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub outputs: OutputsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputsConfig {
    /// All configured outputs, keyed by a user-chosen name.
    #[serde(default)]
    pub stocks: BTreeMap<String, OutputConfig>,

    /// Which entry of `stocks` is in use.
    #[serde(default)]
    pub current: String,
}

/// One output. Exactly one variant must be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub http2socks: Option<Http2SocksConfig>,
    pub socks5: Option<Socks5Config>,
    pub ssh: Option<SshConfig>,
    pub trojan: Option<TrojanConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http2SocksConfig {
    /// E.g. `https://example.com/path/`.
    pub server: String,
    /// Pre-shared secret between client and server.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socks5Config {
    /// E.g. `example.com:1080`.
    pub server: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// E.g. `example.com:22`.
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrojanConfig {
    /// E.g. `example.com:443`.
    pub server: String,
    pub password: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// SNI to present instead of the server host.
    #[serde(default)]
    pub sni: String,
}

/// The single variant an [`OutputConfig`] holds.
#[derive(Debug, Clone)]
pub enum OutputVariant {
    Http2Socks(Http2SocksConfig),
    Socks5(Socks5Config),
    Ssh(SshConfig),
    Trojan(TrojanConfig),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("Configuration file `{}` does not exist", path.display())
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read `{}`", path.display()));
            }
        };

        serde_yaml::from_str(&content)
            .with_context(|| format!("Malformed configuration in `{}`", path.display()))
    }

    /// The output selected by `outputs.current`.
    pub fn current_output(&self) -> Result<(&str, &OutputConfig)> {
        let current = &self.outputs.current;
        if current.is_empty() {
            bail!("No output selected; set `outputs.current`");
        }

        let output = self
            .outputs
            .stocks
            .get(current)
            .with_context(|| format!("Selected output `{current}` is not in `outputs.stocks`"))?;

        Ok((current, output))
    }
}

impl OutputConfig {
    pub fn variant(&self) -> Result<OutputVariant> {
        let mut variants = Vec::new();

        if let Some(c) = &self.http2socks {
            variants.push(OutputVariant::Http2Socks(c.clone()));
        }
        if let Some(c) = &self.socks5 {
            variants.push(OutputVariant::Socks5(c.clone()));
        }
        if let Some(c) = &self.ssh {
            variants.push(OutputVariant::Ssh(c.clone()));
        }
        if let Some(c) = &self.trojan {
            variants.push(OutputVariant::Trojan(c.clone()));
        }

        match variants.len() {
            1 => Ok(variants.remove(0)),
            0 => bail!("Output has no variant; set one of http2socks/socks5/ssh/trojan"),
            _ => bail!("Output has more than one variant; keep exactly one"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
outputs:
  stocks:
    home:
      socks5:
        server: example.com:1080
    fallback:
      trojan:
        server: example.com:443
        password: hunter2
        insecure_skip_verify: true
        sni: cdn.example.com
  current: home
"#;

    #[test]
    fn parses_a_full_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();

        let (name, output) = config.current_output().unwrap();
        assert_eq!(name, "home");
        assert!(matches!(
            output.variant().unwrap(),
            OutputVariant::Socks5(Socks5Config { server }) if server == "example.com:1080"
        ));

        let fallback = config.outputs.stocks.get("fallback").unwrap();
        match fallback.variant().unwrap() {
            OutputVariant::Trojan(trojan) => {
                assert!(trojan.insecure_skip_verify);
                assert_eq!(trojan.sni, "cdn.example.com");
            }
            other => panic!("Expected trojan, got {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str(
            "outputs:\n  stocks: {}\n  current: ''\n  frobnicate: true\n",
        );

        assert!(result.is_err());
    }

    #[test]
    fn missing_current_is_an_error() {
        let config: Config = serde_yaml::from_str("outputs:\n  stocks: {}\n").unwrap();

        let err = config.current_output().unwrap_err();

        assert!(format!("{err}").contains("outputs.current"));
    }

    #[test]
    fn current_must_name_a_stock() {
        let config: Config =
            serde_yaml::from_str("outputs:\n  stocks: {}\n  current: nope\n").unwrap();

        assert!(config.current_output().is_err());
    }

    #[test]
    fn an_output_needs_exactly_one_variant() {
        let none: OutputConfig = serde_yaml::from_str("{}").unwrap();
        assert!(none.variant().is_err());

        let both: OutputConfig = serde_yaml::from_str(
            "socks5:\n  server: a:1080\nssh:\n  server: b:22\n  username: u\n  password: p\n",
        )
        .unwrap();
        assert!(both.variant().is_err());
    }
}
