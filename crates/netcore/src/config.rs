use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::net::handshake::{BanList, WantedFile, TOKEN_MAX_AGE};
use crate::net::protocol::{DEFAULT_PORT, TICRATE};
use crate::net::transport::TransportConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct BanEntry {
    pub ip: IpAddr,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub ticrate: u32,
    pub max_clients: usize,
    /// Per-client limit for unreliable data in KB/s.
    pub max_rate: u32,
    /// Seconds of silence before a client is dropped.
    pub timeout_secs: u64,
    pub compression: bool,
    pub resend_interval_ms: u64,
    pub token_max_age_secs: u64,
    pub hostname: String,
    pub email: String,
    pub password: String,
    pub bans: Vec<BanEntry>,
    pub map: String,
    pub wads: Vec<WantedFile>,
    pub patches: Vec<WantedFile>,
    pub download_site: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            ticrate: TICRATE,
            max_clients: 16,
            max_rate: 200,
            timeout_secs: 65,
            compression: true,
            resend_interval_ms: 100,
            token_max_age_secs: TOKEN_MAX_AGE.as_secs(),
            hostname: "Untitled gibnet server".into(),
            email: String::new(),
            password: String::new(),
            bans: Vec::new(),
            map: "MAP01".into(),
            wads: Vec::new(),
            patches: Vec::new(),
            download_site: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_rate: self.max_rate,
            compression: self.compression,
            resend_interval: Duration::from_millis(self.resend_interval_ms),
            ticrate: self.ticrate,
        }
    }

    pub fn timeout_tics(&self) -> u64 {
        self.timeout_secs * self.ticrate as u64
    }

    pub fn token_max_age(&self) -> Duration {
        Duration::from_secs(self.token_max_age_secs)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.ticrate.max(1) as f64)
    }

    pub fn ban_list(&self) -> BanList {
        let mut bans = BanList::new();
        for entry in &self.bans {
            bans.ban(entry.ip, entry.reason.clone());
        }
        bans
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bind: String,
    pub ticrate: u32,
    pub name: String,
    pub password: String,
    /// Divert to the download flow even when every file is present.
    pub force_download: bool,
    /// Tics without a packet from the server after which the client keeps
    /// sending bare acks.
    pub keepalive_tics: u64,
    pub resource_dirs: Vec<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".into(),
            ticrate: TICRATE,
            name: "Player".into(),
            password: String::new(),
            force_download: false,
            keepalive_tics: 65,
            resource_dirs: vec![PathBuf::from(".")],
        }
    }
}

impl ClientConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.ticrate.max(1) as f64)
    }
}
