//! Engine configuration.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use udrv_logging::LogConfig;
use udrv_sidechannel::Role;

use crate::error::ConfigError;

/// Configuration for one rendezvous engine.
///
/// Every field has a default, so an empty TOML document is a valid
/// listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Peer to connect to. Absent means this side listens.
    #[serde(default)]
    pub peer_addr: Option<Ipv4Addr>,

    /// Well-known TCP port of the side channel.
    #[serde(default = "default_side_channel_port")]
    pub side_channel_port: u16,

    /// Datagram payload size in bytes.
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,

    /// Extra bytes at the front of each buffer for the global route header.
    #[serde(default = "default_header_margin")]
    pub header_margin: usize,

    #[serde(default = "default_send_period_ms")]
    pub send_period_ms: u64,

    /// Completion queue capacity; also bounds the queue-pair depths.
    #[serde(default = "default_cq_size")]
    pub cq_size: u32,

    #[serde(default = "default_port_num")]
    pub port_num: u8,

    #[serde(default)]
    pub pkey_index: u16,

    #[serde(default)]
    pub gid_index: u32,

    /// Datagram key programmed into the queue pair.
    #[serde(default)]
    pub qkey: u32,

    #[serde(default = "default_path_query_timeout_ms")]
    pub path_query_timeout_ms: u64,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_side_channel_port() -> u16 {
    12347
}

fn default_payload_size() -> usize {
    1024
}

fn default_header_margin() -> usize {
    40
}

fn default_send_period_ms() -> u64 {
    1000
}

fn default_cq_size() -> u32 {
    255
}

fn default_port_num() -> u8 {
    1
}

fn default_path_query_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_addr: None,
            side_channel_port: default_side_channel_port(),
            payload_size: default_payload_size(),
            header_margin: default_header_margin(),
            send_period_ms: default_send_period_ms(),
            cq_size: default_cq_size(),
            port_num: default_port_num(),
            pkey_index: 0,
            gid_index: 0,
            qkey: 0,
            path_query_timeout_ms: default_path_query_timeout_ms(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payload_size == 0 {
            return Err(ConfigError::invalid("payload_size", "must be non-zero"));
        }
        let fits = self
            .payload_size
            .checked_add(self.header_margin)
            .is_some_and(|len| u32::try_from(len).is_ok());
        if !fits {
            return Err(ConfigError::invalid(
                "payload_size",
                "payload plus header margin must fit in 32 bits",
            ));
        }
        if self.cq_size == 0 || self.cq_size > u16::MAX as u32 {
            return Err(ConfigError::invalid("cq_size", "must be in 1..=65535"));
        }
        if self.send_period_ms == 0 {
            return Err(ConfigError::invalid("send_period_ms", "must be non-zero"));
        }
        if self.port_num == 0 {
            return Err(ConfigError::invalid("port_num", "ports are numbered from 1"));
        }
        if self.path_query_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "path_query_timeout_ms",
                "must be non-zero",
            ));
        }
        if self.peer_addr.is_some() && self.side_channel_port == 0 {
            return Err(ConfigError::invalid(
                "side_channel_port",
                "a connector needs a non-zero port",
            ));
        }
        Ok(())
    }

    /// Listener when no peer is configured, connector otherwise.
    pub fn role(&self) -> Role {
        match self.peer_addr {
            None => Role::Listener {
                port: self.side_channel_port,
            },
            Some(ip) => Role::Connector {
                peer: SocketAddr::V4(SocketAddrV4::new(ip, self.side_channel_port)),
            },
        }
    }

    /// Size of each DMA buffer: payload plus header margin.
    pub fn buffer_len(&self) -> usize {
        self.payload_size.saturating_add(self.header_margin)
    }

    pub fn send_period(&self) -> Duration {
        Duration::from_millis(self.send_period_ms)
    }

    pub fn path_query_timeout(&self) -> Duration {
        Duration::from_millis(self.path_query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.peer_addr.is_none());
        assert_eq!(config.side_channel_port, 12347);
        assert_eq!(config.payload_size, 1024);
        assert_eq!(config.buffer_len(), 1064);
        assert_eq!(config.send_period(), Duration::from_secs(1));
        assert_eq!(config.cq_size, 255);
        assert_eq!(config.port_num, 1);
        assert_eq!(config.path_query_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_role_is_function_of_peer() {
        let mut config = EngineConfig::default();
        assert_eq!(config.role(), Role::Listener { port: 12347 });

        config.peer_addr = Some(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            config.role(),
            Role::Connector {
                peer: "10.0.0.2:12347".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            peer_addr = "192.168.1.20"
            payload_size = 256
            send_period_ms = 250

            [log]
            level = "debug"
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.peer_addr, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(config.payload_size, 256);
        assert_eq!(config.send_period(), Duration::from_millis(250));
        assert_eq!(config.cq_size, 255);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_dump_parses_back() {
        let mut config = EngineConfig::default();
        config.peer_addr = Some(Ipv4Addr::LOCALHOST);
        config.qkey = 0x1111_1111;
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects() {
        let cases: Vec<(&str, fn(&mut EngineConfig))> = vec![
            ("payload_size", |c| c.payload_size = 0),
            ("payload_size", |c| c.payload_size = u32::MAX as usize),
            ("payload_size", |c| {
                c.payload_size = usize::MAX;
                c.header_margin = 1;
            }),
            ("cq_size", |c| c.cq_size = 0),
            ("cq_size", |c| c.cq_size = 70_000),
            ("send_period_ms", |c| c.send_period_ms = 0),
            ("port_num", |c| c.port_num = 0),
            ("side_channel_port", |c| {
                c.peer_addr = Some(Ipv4Addr::LOCALHOST);
                c.side_channel_port = 0;
            }),
        ];
        for (field, mutate) in cases {
            let mut config = EngineConfig::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected {field} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_listener_may_use_ephemeral_port() {
        let config = EngineConfig {
            side_channel_port: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_payload_rejected_on_load() {
        let err = EngineConfig::from_toml_str("payload_size = 9223372036854775807").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "payload_size",
                ..
            }
        ));
        let config = EngineConfig::from_toml_str("payload_size = 65536").unwrap();
        assert_eq!(config.buffer_len(), 65576);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/udrv.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_unparsable() {
        let err = EngineConfig::from_toml_str("payload_size = \"big\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
