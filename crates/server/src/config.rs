use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use gibnet::ServerConfig;

use crate::Args;

pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
    let Some(path) = path else {
        return Ok(ServerConfig::default());
    };

    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

/// Command-line flags win over the file.
pub fn apply_args(config: &mut ServerConfig, args: &Args) {
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ticrate) = args.ticrate {
        config.ticrate = ticrate;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(max_rate) = args.max_rate {
        config.max_rate = max_rate;
    }
    if let Some(hostname) = &args.hostname {
        config.hostname = hostname.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    if args.no_compression {
        config.compression = false;
    }
}
