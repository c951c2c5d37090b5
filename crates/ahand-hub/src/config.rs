use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HubConfig {
    pub listen: SocketAddr,
    /// Path of the device WebSocket endpoint.
    pub ws_path: String,
    /// Unacknowledged frames retained per device before sends are refused.
    pub outbox_capacity: usize,
    /// How long a new connection may take to send its Hello. 0 waits forever.
    pub handshake_timeout_secs: u64,
    /// Buffer of the hub event broadcast channel.
    pub event_capacity: usize,
}

impl HubConfig {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&contents)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ws_path: "/ws".to_string(),
            outbox_capacity: 10_000,
            handshake_timeout_secs: 10,
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = HubConfig::load(None).unwrap();
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.outbox_capacity, 10_000);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen = \"127.0.0.1:4000\"\noutbox_capacity = 64\nhandshake_timeout_secs = 0"
        )
        .unwrap();

        let config = HubConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.outbox_capacity, 64);
        assert_eq!(config.handshake_timeout(), None);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "outbox_capacity = \"lots\"").unwrap();
        assert!(HubConfig::load(Some(file.path())).is_err());
    }
}
