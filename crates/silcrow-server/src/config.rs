//! Server settings from the `[server]` table of silcrow.toml

use anyhow::{Context, Result};
use serde::Deserialize;
use silcrow_isr::{IsrConfig, IsrTomlConfig};
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "silcrow.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Prerender every page before accepting traffic
    #[serde(default = "default_true")]
    pub prerender: bool,
}

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            prerender: true,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServerToml {
    #[serde(default)]
    server: Option<ServerConfig>,
}

/// Everything the server reads at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub isr: IsrConfig,
}

impl Settings {
    /// Load `path`; a missing file yields defaults.
    ///
    /// `revalidate_token` replaces the configured webhook secret when set.
    pub fn load(path: impl AsRef<Path>, revalidate_token: Option<String>) -> Result<Self> {
        let path = path.as_ref();

        let server = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            Self::parse_server(&content)?
        } else {
            ServerConfig::default()
        };

        let mut isr = IsrTomlConfig::load(path)?.to_runtime_config()?;
        if let Some(token) = revalidate_token.filter(|t| !t.is_empty()) {
            isr.revalidation_secret = Some(token);
        }

        Ok(Self { server, isr })
    }

    fn parse_server(content: &str) -> Result<ServerConfig> {
        let doc: ServerToml = toml::from_str(content).context("Failed to parse server config")?;
        Ok(doc.server.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_parse_server_table() {
        let server = Settings::parse_server(
            r#"
[server]
port = 8080
prerender = false

[isr]
default_revalidate = 30
"#,
        )
        .unwrap();

        assert_eq!(server.port, 8080);
        assert_eq!(server.host, "127.0.0.1");
        assert!(!server.prerender);
        assert_eq!(server.addr(), "127.0.0.1:8080");
    }

    #[rstest]
    #[case("", "127.0.0.1:3000", true)]
    #[case("[isr]\ndefault_revalidate = 5", "127.0.0.1:3000", true)]
    #[case("[server]\nhost = \"0.0.0.0\"", "0.0.0.0:3000", true)]
    #[case("[server]\nport = 9000\nprerender = false", "127.0.0.1:9000", false)]
    fn test_server_table_defaults(
        #[case] content: &str,
        #[case] addr: &str,
        #[case] prerender: bool,
    ) {
        let server = Settings::parse_server(content).unwrap();
        assert_eq!(server.addr(), addr);
        assert_eq!(server.prerender, prerender);
    }

    #[rstest]
    #[case(None, Some("from-file"))]
    #[case(Some(""), Some("from-file"))]
    #[case(Some("from-env"), Some("from-env"))]
    fn test_revalidate_token_precedence(#[case] token: Option<&str>, #[case] expected: Option<&str>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[isr]\nrevalidation_secret = \"from-file\"").unwrap();

        let settings = Settings::load(file.path(), token.map(str::to_string)).unwrap();
        assert_eq!(settings.isr.revalidation_secret.as_deref(), expected);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load("does/not/exist.toml", None).unwrap();
        assert_eq!(settings.server, ServerConfig::default());
        assert_eq!(settings.isr.revalidation_secret, None);
    }
}
