//! Server runtime settings read from the environment.

use anyhow::{Context, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Jobs are kept in memory when unset.
    pub database_url: Option<String>,
    /// KDL orchestrator config; defaults apply when unset.
    pub config_path: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    pub onboarding_url: Url,
    pub compliance_url: Url,
    pub index_url: Url,
    pub worker_url: Url,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let url = |name: &str| -> anyhow::Result<Url> {
            let Some(raw) = lookup(name) else {
                bail!("{name} is not set");
            };
            Url::parse(&raw).with_context(|| format!("{name} is not a valid URL"))
        };

        let listen_addr = match lookup("NIMBUS_LISTEN_ADDR") {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("NIMBUS_LISTEN_ADDR '{addr}' is not a socket address"))?,
            None => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            config_path: lookup("NIMBUS_CONFIG").map(PathBuf::from),
            listen_addr,
            onboarding_url: url("NIMBUS_ONBOARDING_URL")?,
            compliance_url: url("NIMBUS_COMPLIANCE_URL")?,
            index_url: url("NIMBUS_INDEX_URL")?,
            worker_url: url("NIMBUS_WORKER_URL")?,
        })
    }
}
