//! A module that contains functions required to read, parse and return the
//! configuration settings from the file `Config.toml` at the root of this
//! crate (or any file name passed on the command line).

use config::{Config, File};

use crate::transport::SendDelay;

/// Where the coordinator listens for registrations and results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub host: String,
    pub port: u64,
}

/// The addresses of this participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeSettings {
    // The address peers and the coordinator reach this process at.
    pub host: String,

    // Port of the agreement protocol itself. 0 picks an ephemeral port.
    pub protocol_port: u64,

    // Port the coordinator connects back to. 0 picks an ephemeral port.
    pub client_port: u64,
}

/// The artificial per-send latency injected by the transport for benchmark
/// realism. Disabled unless the configuration says otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct LatencySettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mean_ms: f64,

    #[serde(default)]
    pub stddev_ms: f64,
}

impl LatencySettings {
    pub fn to_send_delay(&self) -> SendDelay {
        if self.enabled {
            SendDelay::Normal {
                mean_ms: self.mean_ms,
                stddev_ms: self.stddev_ms,
            }
        } else {
            SendDelay::Disabled
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    pub coordinator: CoordinatorSettings,
    pub node: NodeSettings,

    #[serde(default)]
    pub latency: LatencySettings,
}

/// Reads and parses the settings. A missing or malformed file is a fatal
/// configuration error.
pub fn get_config(file_name: &str) -> Settings {
    let mut c = Config::default();
    c.merge(File::with_name(file_name))
        .expect("Could not read the configuration file");
    c.try_into::<Settings>()
        .expect("Could not parse the configuration file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn write_fixture(name: &str, settings: &Settings) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("lattice-agreement-{}-{}", std::process::id(), name));
        fs::create_dir_all(&path).unwrap();
        path.push("Config.toml");
        fs::write(&path, toml::to_string(settings).unwrap()).unwrap();
        path.set_extension("");
        path
    }

    #[test]
    fn test_round_trip_through_file() {
        let settings = Settings {
            coordinator: CoordinatorSettings {
                host: "10.0.0.1".to_string(),
                port: 7000,
            },
            node: NodeSettings {
                host: "127.0.0.1".to_string(),
                protocol_port: 9000,
                client_port: 9001,
            },
            latency: LatencySettings {
                enabled: true,
                mean_ms: 5.0,
                stddev_ms: 1.5,
            },
        };
        let path = write_fixture("round-trip", &settings);
        let parsed = get_config(path.to_str().unwrap());
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_latency_defaults_to_disabled() {
        let text = "[coordinator]\nhost = \"127.0.0.1\"\nport = 7000\n\n\
                    [node]\nhost = \"127.0.0.1\"\nprotocol_port = 0\nclient_port = 0\n";
        let mut path = std::env::temp_dir();
        path.push(format!("lattice-agreement-{}-defaults", std::process::id()));
        fs::create_dir_all(&path).unwrap();
        path.push("Config.toml");
        fs::write(&path, text).unwrap();
        path.set_extension("");

        let parsed = get_config(path.to_str().unwrap());
        assert!(!parsed.latency.enabled);
        match parsed.latency.to_send_delay() {
            SendDelay::Disabled => {}
            other => panic!("expected latency to be disabled, got {:?}", other),
        }
    }
}
