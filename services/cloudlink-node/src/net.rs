//! Plain TCP transport and network link probing.
//!
//! TLS termination is expected in front of this transport (a local stunnel
//! or a TLS-capable `TransportProvider`); the broker authenticates the
//! device by the token presented in the handshake, not by the stream.

use cloudlink_core::NodeConfig;
use cloudlink_crypto::Credential;
use cloudlink_session::{TransportError, TransportProvider};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const SYSFS_NET: &str = "/sys/class/net";

/// Reports whether the network link is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkProbe {
    /// No interface configured; the link is assumed present
    Always,
    /// Read `operstate` of a kernel network interface
    Interface { name: String, operstate: PathBuf },
}

impl LinkProbe {
    pub fn interface(name: &str) -> Self {
        Self::Interface {
            name: name.to_string(),
            operstate: PathBuf::from(SYSFS_NET).join(name).join("operstate"),
        }
    }

    pub fn is_up(&self) -> bool {
        match self {
            Self::Always => true,
            Self::Interface { name, operstate } => match std::fs::read_to_string(operstate) {
                Ok(state) => state.trim() == "up",
                Err(e) => {
                    debug!(interface = %name, error = %e, "Cannot read link state");
                    false
                }
            },
        }
    }
}

/// Opens TCP connections to the broker endpoint.
#[derive(Debug, Clone)]
pub struct TcpTransportProvider {
    host: String,
    port: u16,
    timeout: Duration,
    link: LinkProbe,
}

impl TcpTransportProvider {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration, link: LinkProbe) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            link,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let (host, port) = config.broker.endpoint();
        let link = config
            .link
            .interface
            .as_deref()
            .map_or(LinkProbe::Always, LinkProbe::interface);
        Self::new(host, port, config.broker.timeout(), link)
    }

    pub fn endpoint(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    fn connect_any(&self) -> Result<TcpStream, TransportError> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "Connection attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout,
            Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                TransportError::Refused(format!("{}:{}", self.host, self.port))
            }
            Some(e) => TransportError::Io(e),
            None => TransportError::Refused(format!("{} did not resolve", self.host)),
        })
    }
}

impl TransportProvider for TcpTransportProvider {
    type Transport = TcpStream;

    fn is_link_ready(&mut self) -> bool {
        self.link.is_up()
    }

    fn establish(&mut self, _credential: &Credential) -> Result<TcpStream, TransportError> {
        let stream = self.connect_any()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        debug!(host = %self.host, port = self.port, "Transport established");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_always_probe_is_up() {
        assert!(LinkProbe::Always.is_up());
    }

    #[test]
    fn test_missing_interface_is_down() {
        assert!(!LinkProbe::interface("cloudlink-test-missing0").is_up());
    }

    #[test]
    fn test_interface_probe_reads_operstate() {
        let dir = std::env::temp_dir().join(format!("cloudlink-link-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let operstate = dir.join("operstate");
        let probe = LinkProbe::Interface {
            name: "eth0".to_string(),
            operstate: operstate.clone(),
        };

        std::fs::write(&operstate, "up\n").unwrap();
        assert!(probe.is_up());
        std::fs::write(&operstate, "down\n").unwrap();
        assert!(!probe.is_up());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_connect_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider = TcpTransportProvider::new(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            LinkProbe::Always,
        );

        let stream = provider.connect_any().unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[test]
    fn test_connection_refused() {
        // Bind then drop to obtain a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let provider = TcpTransportProvider::new(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            LinkProbe::Always,
        );

        assert!(matches!(
            provider.connect_any(),
            Err(TransportError::Refused(_))
        ));
    }

    #[test]
    fn test_from_config_defaults_to_lts_endpoint() {
        let config = cloudlink_core::NodeConfig::from_toml_str(
            r#"
            [device]
            project_id = "p"
            location = "l"
            registry_id = "r"
            device_id = "d"
            private_key = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60"
            "#,
        )
        .unwrap();

        let provider = TcpTransportProvider::from_config(&config);

        assert_eq!(provider.endpoint(), ("mqtt.2030.ltsapis.goog", 8883));
        assert_eq!(provider.link, LinkProbe::Always);
    }
}
