use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::cli::ServeArgs;
use crate::liveness::LivenessConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr}: {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("probe interval must be greater than zero")]
    ZeroProbeInterval,
    #[error(
        "dead timeout ({dead_after:?}) must be longer than the probe interval ({probe_interval:?})"
    )]
    DeadTimeoutTooShort {
        probe_interval: Duration,
        dead_after: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub liveness: LivenessConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr =
            args.listen_addr
                .parse()
                .map_err(|source| ConfigError::InvalidListenAddr {
                    addr: args.listen_addr.clone(),
                    source,
                })?;
        let liveness = LivenessConfig::new(
            Duration::from_secs(args.probe_interval_secs),
            Duration::from_secs(args.dead_after_secs),
        )?;
        Ok(Self {
            listen_addr,
            liveness,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            liveness: LivenessConfig::default(),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(listen_addr: &str, probe: u64, dead: u64) -> ServeArgs {
        ServeArgs {
            listen_addr: listen_addr.to_string(),
            probe_interval_secs: probe,
            dead_after_secs: dead,
            shutdown_grace_secs: 1,
        }
    }

    #[test_timeout::timeout]
    fn defaults_match_serve_args() {
        let config = ServerConfig::try_from(args("0.0.0.0:3000", 5, 12)).unwrap();
        let default = ServerConfig::default();
        assert_eq!(config.listen_addr, default.listen_addr);
        assert_eq!(config.liveness, default.liveness);
    }

    #[test_timeout::timeout]
    fn rejects_bad_values() {
        assert!(matches!(
            ServerConfig::try_from(args("localhost", 5, 12)),
            Err(ConfigError::InvalidListenAddr { .. })
        ));
        assert!(matches!(
            ServerConfig::try_from(args("127.0.0.1:3000", 10, 8)),
            Err(ConfigError::DeadTimeoutTooShort { .. })
        ));
    }
}
