//! Process settings: where things live and which sockets to use.
//!
//! Everything that steers the control loop itself is in `global.json`
//! under the config directory; this is only the plumbing around it.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_DIR: &str = "/var/lib/heating";
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SENSOR_ADDR: &str = "0.0.0.0:4000";
pub const DEFAULT_RELAY_PORT: u16 = 4210;
pub const EVENTS_DIR: &str = "events";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_dir: PathBuf,
    pub http_addr: String,
    pub sensor_addr: String,
    pub relay_port: u16,
    /// Host taking boiler modulation and flow commands.
    pub boiler_host: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            sensor_addr: DEFAULT_SENSOR_ADDR.to_string(),
            relay_port: DEFAULT_RELAY_PORT,
            boiler_host: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        Settings::parse(std::env::vars(), std::env::args().skip(1))
    }

    /// `--config-dir` wins over `HEATING_CONFIG_DIR`.
    pub fn parse(
        vars: impl IntoIterator<Item = (String, String)>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Settings> {
        let mut settings = Settings::default();
        for (key, value) in vars {
            match key.as_str() {
                "HEATING_CONFIG_DIR" => settings.config_dir = PathBuf::from(value),
                "HEATING_HTTP_ADDR" => settings.http_addr = value,
                "HEATING_SENSOR_ADDR" => settings.sensor_addr = value,
                "HEATING_RELAY_PORT" => {
                    settings.relay_port = value
                        .parse()
                        .with_context(|| format!("bad HEATING_RELAY_PORT: {}", value))?
                }
                "HEATING_BOILER_HOST" if !value.is_empty() => settings.boiler_host = Some(value),
                _ => {}
            }
        }

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if let Some(dir) = arg.strip_prefix("--config-dir=") {
                settings.config_dir = PathBuf::from(dir);
            } else if arg == "--config-dir" {
                let Some(dir) = args.next() else {
                    bail!("--config-dir needs a value");
                };
                settings.config_dir = PathBuf::from(dir);
            } else {
                bail!("unknown argument: {}", arg);
            }
        }
        Ok(settings)
    }

    pub fn events_dir(&self) -> PathBuf {
        self.config_dir.join(EVENTS_DIR)
    }
}
