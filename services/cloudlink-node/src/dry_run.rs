//! Broker client that logs instead of framing protocol packets.
//!
//! Used by the node binary until a protocol client is wired in; it drives
//! the full session lifecycle over a real transport so link, clock and
//! credential behavior can be exercised on a device.

use cloudlink_session::{BrokerClient, BrokerError, ConnectRequest, MessageHandler};
use std::net::TcpStream;
use tracing::{debug, info};

#[derive(Default)]
pub struct DryRunBroker {
    handler: Option<MessageHandler>,
    published: u64,
}

impl DryRunBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl std::fmt::Debug for DryRunBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DryRunBroker")
            .field("has_handler", &self.handler.is_some())
            .field("published", &self.published)
            .finish()
    }
}

fn check_socket(transport: &TcpStream) -> Result<(), BrokerError> {
    match transport.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(e)) | Err(e) => Err(BrokerError::ConnectionLost(e.to_string())),
    }
}

impl BrokerClient<TcpStream> for DryRunBroker {
    fn handshake(
        &mut self,
        transport: &mut TcpStream,
        request: &ConnectRequest<'_>,
    ) -> Result<(), BrokerError> {
        check_socket(transport)?;
        info!(
            client_id = request.client_id,
            keep_alive_secs = request.options.keep_alive.as_secs(),
            clean_session = request.options.clean_session,
            "[dry-run] handshake"
        );
        Ok(())
    }

    fn subscribe(&mut self, transport: &mut TcpStream, topic: &str) -> Result<(), BrokerError> {
        check_socket(transport)?;
        info!(topic, "[dry-run] subscribe");
        Ok(())
    }

    fn publish(
        &mut self,
        transport: &mut TcpStream,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        check_socket(transport)?;
        self.published += 1;
        info!(topic, bytes = payload.len(), "[dry-run] publish");
        Ok(())
    }

    fn poll(&mut self, transport: &mut TcpStream) -> Result<(), BrokerError> {
        debug!("[dry-run] poll");
        check_socket(transport)
    }

    fn reauthenticate(
        &mut self,
        transport: &mut TcpStream,
        request: &ConnectRequest<'_>,
    ) -> Result<(), BrokerError> {
        check_socket(transport)?;
        info!(client_id = request.client_id, "[dry-run] re-authenticate");
        Ok(())
    }

    fn disconnect(&mut self, transport: &mut TcpStream) {
        if let Err(e) = transport.shutdown(std::net::Shutdown::Both) {
            debug!(error = %e, "Transport shutdown failed");
        }
        info!("[dry-run] disconnect");
    }

    fn set_message_handler(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlink_session::ConnectOptions;
    use std::net::TcpListener;

    #[test]
    fn test_lifecycle_over_local_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _peer = listener.accept().unwrap();
        let options = ConnectOptions::default();
        let request = ConnectRequest {
            client_id: "projects/p/locations/l/registries/r/devices/d",
            username: "unused",
            password: "token",
            options: &options,
        };
        let mut broker = DryRunBroker::new();

        broker.handshake(&mut stream, &request).unwrap();
        broker.subscribe(&mut stream, "/devices/d/config").unwrap();
        broker.publish(&mut stream, "/devices/d/events", b"1").unwrap();
        broker.publish(&mut stream, "/devices/d/state", b"{}").unwrap();
        broker.poll(&mut stream).unwrap();
        broker.disconnect(&mut stream);

        assert_eq!(broker.published(), 2);
    }
}
