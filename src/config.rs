use anyhow::{anyhow, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// PBX host, also read from FREEPBX_IP
    pub pbx_host: Option<String>,
    #[clap(long, default_value = "dialflow.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// FreePBX/Asterisk host driving the calls
    pub pbx_host: Option<String>,
    /// Base URL the PBX uses to fetch action scripts back from us
    pub action_base_url: String,
    pub port: u16,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Campaign catalog endpoint, fetched periodically
    pub catalog_url: Option<String>,
    pub catalog_refresh_secs: u64,
    /// Trunk inventory endpoint, fetched periodically
    pub trunk_inventory_url: Option<String>,
    pub trunk_refresh_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pbx_host: None,
            action_base_url: "http://localhost:3000".to_string(),
            port: 3000,
            log_level: None,
            log_file: None,
            catalog_url: None,
            catalog_refresh_secs: 300,
            trunk_inventory_url: None,
            trunk_refresh_secs: 30,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    /// Environment overrides file values; the positional argv is the last
    /// resort for the PBX host.
    pub fn resolve(mut self, cli: &Cli) -> Result<Self> {
        if let Ok(host) = std::env::var("FREEPBX_IP") {
            if !host.is_empty() {
                self.pbx_host = Some(host);
            }
        }
        if self.pbx_host.is_none() {
            self.pbx_host = cli.pbx_host.clone();
        }
        if let Ok(url) = std::env::var("ACTION_BASE_URL") {
            if !url.is_empty() {
                self.action_base_url = url;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow!("invalid PORT value '{}'", port))?;
        }
        if self.pbx_host.as_deref().unwrap_or("").is_empty() {
            return Err(anyhow!(
                "PBX host missing: set FREEPBX_IP or pass it as the first argument"
            ));
        }
        Ok(self)
    }

    pub fn http_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn action_url(&self, status: &str) -> String {
        format!("{}/action/{}", self.action_base_url, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.action_base_url, "http://localhost:3000");
        assert_eq!(config.catalog_refresh_secs, 300);
        assert_eq!(config.trunk_refresh_secs, 30);
    }

    #[test]
    fn test_resolve_requires_pbx_host() {
        let cli = Cli {
            pbx_host: None,
            conf: None,
        };
        std::env::remove_var("FREEPBX_IP");
        assert!(Config::default().resolve(&cli).is_err());

        let cli = Cli {
            pbx_host: Some("10.0.0.5".to_string()),
            conf: None,
        };
        let config = Config::default().resolve(&cli).unwrap();
        assert_eq!(config.pbx_host.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_action_url() {
        let config = Config::default();
        assert_eq!(
            config.action_url("gather"),
            "http://localhost:3000/action/gather"
        );
    }
}
