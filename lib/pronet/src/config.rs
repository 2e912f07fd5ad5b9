//! Declarative configuration structs, loaded from TOML via `serdeconv`, mirroring the defaults
//! documented alongside the components they configure.

use serde_derive::{Deserialize, Serialize};
use std::io;
use std::path::Path;

fn load<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> io::Result<T> {
    serdeconv::from_toml_file(path.as_ref()).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// Number of parallel I/O worker threads. `1` yields cooperative single-threaded semantics.
    pub worker_count: usize,
    /// Period between heartbeat slot rebalances, in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            worker_count: 4,
            heartbeat_interval_secs: 20,
        }
    }
}

impl ReactorConfig {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        load(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub keepalive_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            keepalive_timeout_secs: 60,
            heartbeat_interval_secs: 20,
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        load(path)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    ActiveStandby,
    LoadBalance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub address: String,
    pub default_port: u16,
    pub dispatch_policy: DispatchPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            address: "0.0.0.0".to_owned(),
            default_port: 3000,
            dispatch_policy: DispatchPolicy::LoadBalance,
        }
    }
}

impl HubConfig {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        load(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redlines {
    /// Maximum outbound queue bytes toward a c2s relay before sends start returning busy.
    pub c2s_bytes: usize,
    /// Maximum outbound queue bytes toward a single user before sends start returning busy.
    pub user_bytes: usize,
}

impl Default for Redlines {
    fn default() -> Self {
        Redlines {
            c2s_bytes: 8 * 1024 * 1024,
            user_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgServerConfig {
    pub address: String,
    pub password: String,
    #[serde(default)]
    pub redlines: Redlines,
}

impl Default for MsgServerConfig {
    fn default() -> Self {
        MsgServerConfig {
            address: "0.0.0.0:4000".to_owned(),
            password: String::new(),
            redlines: Redlines::default(),
        }
    }
}

impl MsgServerConfig {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        assert_eq!(ReactorConfig::default().worker_count, 4);
        assert_eq!(SessionConfig::default().keepalive_timeout_secs, 60);
        assert_eq!(HubConfig::default().default_port, 3000);
        assert_eq!(Redlines::default().c2s_bytes, 8 * 1024 * 1024);
        assert_eq!(MsgServerConfig::default().address, "0.0.0.0:4000");
    }

    #[test]
    fn test_hub_config_round_trips_through_toml() {
        let file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file.as_file(), "address = \"10.0.0.1\"\ndefault_port = 4100\ndispatch_policy = \"ActiveStandby\"").unwrap();

        let loaded = HubConfig::load(file.path()).unwrap();
        assert_eq!(loaded.address, "10.0.0.1");
        assert_eq!(loaded.default_port, 4100);
        assert_eq!(loaded.dispatch_policy, DispatchPolicy::ActiveStandby);
    }

    #[test]
    fn test_msg_server_config_defaults_redlines_when_omitted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file.as_file(), "address = \"0.0.0.0:4000\"\npassword = \"secret\"").unwrap();

        let loaded = MsgServerConfig::load(file.path()).unwrap();
        assert_eq!(loaded.redlines.user_bytes, Redlines::default().user_bytes);
    }
}
