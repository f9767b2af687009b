//! Persistent bidirectional control channel.
//!
//! [`WsChannel`] is a blocking WebSocket over TLS. The TLS layer accepts any
//! server certificate and records it; whether to trust it is decided later by
//! the pinning verifier, mirroring how first-contact pairing works on these
//! devices.

use std::io::ErrorKind;
use std::net::{IpAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use rustls_pki_types::ServerName;
use tracing::debug;
use tungstenite::handshake::HandshakeError;
use tungstenite::{Message, WebSocket};

use crate::errors::ControlError;

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one blocking receive attempt.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete text message.
    Message(String),
    /// Read timeout or non-text frame; nothing to deliver.
    Idle,
    /// The peer closed the channel.
    Closed,
}

/// Transport seam of the control session.
pub trait ControlChannel: Send + Sync {
    fn send(&self, text: &str) -> Result<(), ControlError>;
    /// Blocks for at most about a second.
    fn recv(&self) -> Result<ChannelEvent, ControlError>;
    fn close(&self);
    /// DER of the peer's end-entity certificate, when the transport has one.
    fn peer_certificate(&self) -> Option<Vec<u8>>;
}

/// Opens control channels to a device endpoint.
pub trait ChannelFactory: Send + Sync {
    fn connect(&self, ip: IpAddr, port: u16) -> Result<Arc<dyn ControlChannel>, ControlError>;
}

type TlsWebSocket = WebSocket<StreamOwned<ClientConnection, TcpStream>>;

pub struct WsChannel {
    ws: Mutex<TlsWebSocket>,
    peer_cert: Option<Vec<u8>>,
}

impl ControlChannel for WsChannel {
    fn send(&self, text: &str) -> Result<(), ControlError> {
        self.ws.lock().send(Message::text(text.to_string()))?;
        Ok(())
    }

    fn recv(&self) -> Result<ChannelEvent, ControlError> {
        let mut ws = self.ws.lock();
        match ws.read() {
            Ok(Message::Text(text)) => Ok(ChannelEvent::Message(text.to_string())),
            Ok(Message::Close(_)) => Ok(ChannelEvent::Closed),
            Ok(_) => Ok(ChannelEvent::Idle),
            Err(tungstenite::Error::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                Ok(ChannelEvent::Idle)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(ChannelEvent::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        let _ = self.ws.lock().close(None);
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.clone()
    }
}

/// Default factory producing [`WsChannel`] instances.
#[derive(Debug, Default)]
pub struct WsChannelFactory;

impl ChannelFactory for WsChannelFactory {
    fn connect(&self, ip: IpAddr, port: u16) -> Result<Arc<dyn ControlChannel>, ControlError> {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::DeferredTrust::new()))
            .with_no_client_auth();

        let tcp = TcpStream::connect((ip, port))?;
        let conn = ClientConnection::new(Arc::new(config), ServerName::from(ip))?;
        let stream = StreamOwned::new(conn, tcp);

        let url = match ip {
            IpAddr::V4(v4) => format!("wss://{}:{}", v4, port),
            IpAddr::V6(v6) => format!("wss://[{}]:{}", v6, port),
        };
        debug!("Opening control channel to {}", url);

        let (ws, _response) = tungstenite::client(url.as_str(), stream).map_err(|e| match e {
            HandshakeError::Failure(e) => ControlError::WebSocket(e),
            HandshakeError::Interrupted(_) => ControlError::ChannelClosed,
        })?;

        // Short timeout so the receive loop can observe shutdown requests.
        ws.get_ref().sock.set_read_timeout(Some(READ_TIMEOUT))?;

        let peer_cert = ws
            .get_ref()
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        Ok(Arc::new(WsChannel {
            ws: Mutex::new(ws),
            peer_cert,
        }))
    }
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::SignatureScheme;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

    /// Accepts every server certificate. The handshake only records the
    /// certificate; the pinning layer decides trust before registration.
    #[derive(Debug)]
    pub struct DeferredTrust {
        provider: CryptoProvider,
    }

    impl DeferredTrust {
        pub fn new() -> Self {
            Self {
                provider: rustls::crypto::aws_lc_rs::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for DeferredTrust {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
