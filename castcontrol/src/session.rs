//! The stateful control session: handshake, pairing, registration,
//! request/response correlation and command queueing.
//!
//! State machine: `None → Initial → Connecting → Registering → Registered`,
//! with `Disconnecting` reachable from any active state and returning to
//! `Initial`. One transition function per inbound event; no nested listener
//! chains.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelFactory, ControlChannel, WsChannelFactory};
use crate::errors::ControlError;
use crate::protocol::{
    ClientIdentity, CommandError, FRAME_ERROR, FRAME_HELLO, FRAME_REGISTERED, FRAME_REQUEST,
    FRAME_RESPONSE, FRAME_SUBSCRIBE, Frame, Manifest, PAIRING_SET_PIN_URI, PairingType,
};
use crate::store::ServiceConfig;
use crate::verify::{CertVerifier, PinnedCertVerifier, spki_b64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Initial,
    Connecting,
    Registering,
    Registered,
    Disconnecting,
}

/// Session-level configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub identity: ClientIdentity,
    /// Pairing hint sent with the first registration when no key exists.
    pub pairing_type: PairingType,
    pub manifest: Manifest,
}

pub type ResponseHandler = Box<dyn Fn(Result<Value, CommandError>) + Send>;

/// An outbound request plus its completion handler. Subscriptions keep their
/// handler registered for repeated pushes.
pub struct Command {
    pub frame_type: String,
    pub uri: Option<String>,
    pub payload: Option<Value>,
    pub handler: ResponseHandler,
}

impl Command {
    pub fn request(uri: &str, payload: Option<Value>, handler: ResponseHandler) -> Self {
        Self {
            frame_type: FRAME_REQUEST.to_string(),
            uri: Some(uri.to_string()),
            payload,
            handler,
        }
    }

    pub fn subscribe(uri: &str, payload: Option<Value>, handler: ResponseHandler) -> Self {
        Self {
            frame_type: FRAME_SUBSCRIBE.to_string(),
            uri: Some(uri.to_string()),
            payload,
            handler,
        }
    }
}

/// Session lifecycle and credential callbacks. All methods default to no-ops
/// so listeners implement only what they care about.
pub trait SessionListener: Send + Sync {
    fn connected(&self) {}
    fn closed_with_error(&self, _error: Option<&CommandError>) {}
    fn failed_with_error(&self, _error: &CommandError) {}
    /// The device requires user confirmation before registration completes.
    fn before_register(&self, _pairing_type: PairingType) {}
    fn registration_failed(&self, _error: &CommandError) {}
    /// Frames of a type the session itself does not consume.
    fn received_message(&self, _frame: &Frame) {}
    fn client_key_updated(&self, _client_key: &str) {}
    fn pinned_identity_updated(&self, _device_uuid: &str, _pinned_key: Option<&str>) {}
    fn pinned_identity_cleared(&self) {}
}

#[derive(Debug, Clone, Default)]
struct Credentials {
    client_key: Option<String>,
    device_uuid: Option<String>,
    pinned_key: Option<String>,
}

struct PendingRequest {
    subscription: bool,
    handler: ResponseHandler,
}

pub struct ControlSession {
    ip: IpAddr,
    port: u16,
    config: SessionConfig,
    factory: Arc<dyn ChannelFactory>,
    verifier: Arc<dyn CertVerifier>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    state: Mutex<SessionState>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    queue: Mutex<VecDeque<Command>>,
    credentials: Mutex<Credentials>,
    channel: Mutex<Option<Arc<dyn ControlChannel>>>,
    register_id: Mutex<Option<u64>>,
}

impl ControlSession {
    pub fn new(
        ip: IpAddr,
        port: u16,
        config: SessionConfig,
        service_config: Option<&ServiceConfig>,
    ) -> Arc<Self> {
        Self::with_parts(
            ip,
            port,
            config,
            service_config,
            Arc::new(WsChannelFactory),
            Arc::new(PinnedCertVerifier),
        )
    }

    pub fn with_parts(
        ip: IpAddr,
        port: u16,
        config: SessionConfig,
        service_config: Option<&ServiceConfig>,
        factory: Arc<dyn ChannelFactory>,
        verifier: Arc<dyn CertVerifier>,
    ) -> Arc<Self> {
        let credentials = match service_config {
            Some(sc) => Credentials {
                client_key: sc.client_key.clone(),
                device_uuid: sc.paired_device_uuid.clone(),
                pinned_key: sc.pinned_key.clone(),
            },
            None => Credentials::default(),
        };
        Arc::new(Self {
            ip,
            port,
            config,
            factory,
            verifier,
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::None),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            credentials: Mutex::new(credentials),
            channel: Mutex::new(None),
            register_id: Mutex::new(None),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn client_key(&self) -> Option<String> {
        self.credentials.lock().client_key.clone()
    }

    pub fn device_uuid(&self) -> Option<String> {
        self.credentials.lock().device_uuid.clone()
    }

    pub fn pinned_key(&self) -> Option<String> {
        self.credentials.lock().pinned_key.clone()
    }

    /// Open the channel and run the handshake. A no-op unless the session is
    /// idle; the connection itself runs on a dedicated thread.
    pub fn connect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::None | SessionState::Initial => *state = SessionState::Connecting,
                _ => return,
            }
        }

        let session = Arc::clone(self);
        std::thread::Builder::new()
            .name("control-session".to_string())
            .spawn(move || session.run())
            .ok();
    }

    /// Close the channel and drop all queued commands.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::None | SessionState::Initial) {
                return;
            }
            *state = SessionState::Disconnecting;
        }

        self.queue.lock().clear();

        let channel = self.channel.lock().clone();
        match channel {
            // The receive loop observes the close and finishes the teardown.
            Some(channel) => channel.close(),
            None => *self.state.lock() = SessionState::Initial,
        }
    }

    /// Submit a command. Sends immediately when registered, defers through
    /// the queue otherwise; an idle session is connected on demand. Returns
    /// the request id when the command went on the wire.
    pub fn send_command(self: &Arc<Self>, command: Command) -> Option<u64> {
        // The enqueue happens under the state lock so the registration path
        // cannot flush the queue between the check and the push.
        let state = self.state.lock();
        match *state {
            SessionState::Registered => {
                drop(state);
                Some(self.send_now(command))
            }
            SessionState::Connecting | SessionState::Registering => {
                self.queue.lock().push_back(command);
                None
            }
            SessionState::None | SessionState::Initial | SessionState::Disconnecting => {
                self.queue.lock().push_back(command);
                drop(state);
                self.connect();
                None
            }
        }
    }

    /// Submit the PIN shown on the device during PIN pairing. The register
    /// request is still outstanding at that point, so the PIN bypasses the
    /// command queue and goes straight onto the open channel.
    pub fn send_pairing_key(&self, pin: &str) {
        let command = Command::request(
            PAIRING_SET_PIN_URI,
            Some(json!({ "pin": pin })),
            Box::new(|result| {
                if let Err(e) = result {
                    warn!("Pairing key rejected: {}", e);
                }
            }),
        );
        self.send_now(command);
    }

    /// Cancel a standing subscription.
    pub fn unsubscribe(&self, request_id: u64) {
        self.pending.lock().remove(&request_id);
        self.send_frame(&Frame::unsubscribe(request_id));
    }

    fn run(self: Arc<Self>) {
        let channel = match self.factory.connect(self.ip, self.port) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("❌ Connection to {}:{} failed: {}", self.ip, self.port, e);
                let error = CommandError::new(0, e.to_string());
                self.fan(|l| l.failed_with_error(&error));
                self.connection_lost(Some(error));
                return;
            }
        };

        if !self.open_with(channel.clone()) {
            return;
        }
        self.read_loop(channel);
    }

    /// Attach the channel and start the handshake by sending `hello`. Refuses
    /// the channel when the session stopped connecting in the meantime (an
    /// explicit disconnect raced the dial).
    fn open_with(&self, channel: Arc<dyn ControlChannel>) -> bool {
        {
            let state = self.state.lock();
            if *state != SessionState::Connecting {
                debug!("Channel ready but session is no longer connecting, dropping it");
                channel.close();
                return false;
            }
            *self.channel.lock() = Some(channel);
        }
        let id = self.next_request_id();
        self.send_frame(&Frame::hello(id, &self.config.identity));
        true
    }

    fn read_loop(&self, channel: Arc<dyn ControlChannel>) {
        loop {
            match channel.recv() {
                Ok(ChannelEvent::Message(text)) => self.handle_message(&text),
                Ok(ChannelEvent::Idle) => {}
                Ok(ChannelEvent::Closed) => break,
                Err(e) => {
                    warn!("Control channel read error: {}", e);
                    break;
                }
            }

            // Torn down inside a handler (identity mismatch, trust failure).
            if self.channel.lock().is_none() {
                return;
            }
            if *self.state.lock() == SessionState::Disconnecting {
                break;
            }
        }
        self.connection_lost(None);
    }

    /// One inbound frame, dispatched by type.
    fn handle_message(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return;
            }
        };

        let frame_type = frame.frame_type.clone();
        match frame_type.as_str() {
            FRAME_HELLO => self.handle_server_hello(&frame),
            FRAME_REGISTERED => self.handle_registered(&frame),
            FRAME_RESPONSE => self.handle_response(frame),
            FRAME_ERROR => self.handle_error(frame),
            _ => self.fan(|l| l.received_message(&frame)),
        }
    }

    /// Server `hello`: adopt or check the pinned device identity, then move
    /// on to registration.
    fn handle_server_hello(&self, frame: &Frame) {
        let uuid = frame
            .payload
            .as_ref()
            .and_then(|p| p.get("deviceUUID"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(uuid) = uuid else {
            warn!("Server hello without deviceUUID, dropping");
            return;
        };

        let pinned = self.credentials.lock().device_uuid.clone();
        match pinned {
            Some(expected) if expected != uuid => {
                // Not the device we paired with. Never silently re-pair.
                warn!(
                    "❌ Device identity mismatch: expected {}, got {}",
                    expected, uuid
                );
                *self.credentials.lock() = Credentials::default();
                self.fan(|l| l.pinned_identity_cleared());
                if let Some(channel) = self.channel.lock().clone() {
                    channel.close();
                }
                let e = ControlError::IdentityMismatch {
                    expected,
                    actual: uuid,
                };
                self.connection_lost(Some(CommandError::new(0, e.to_string())));
                return;
            }
            Some(_) => {}
            None => {
                let mut creds = self.credentials.lock();
                creds.device_uuid = Some(uuid.clone());
                let pinned_key = creds.pinned_key.clone();
                drop(creds);
                self.fan(|l| l.pinned_identity_updated(&uuid, pinned_key.as_deref()));
            }
        }

        self.begin_registration();
    }

    /// Verify the channel's peer certificate, then send `register`. The
    /// register request stays correlated (via its id) across a pairing
    /// prompt round-trip.
    fn begin_registration(&self) {
        *self.state.lock() = SessionState::Registering;

        let peer_cert = self
            .channel
            .lock()
            .as_ref()
            .and_then(|c| c.peer_certificate());
        if let Some(cert) = peer_cert {
            let pinned = self.credentials.lock().pinned_key.clone();
            if let Err(e) = self.verifier.verify(&cert, pinned.as_deref()) {
                warn!("❌ {}", e);
                let error = CommandError::new(0, e.to_string());
                self.fan(|l| l.registration_failed(&error));
                if let Some(channel) = self.channel.lock().clone() {
                    channel.close();
                }
                self.connection_lost(Some(error));
                return;
            }

            // First trusted contact pins the server key.
            let mut creds = self.credentials.lock();
            if creds.pinned_key.is_none() {
                creds.pinned_key = spki_b64(&cert);
                let uuid = creds.device_uuid.clone();
                let pinned_key = creds.pinned_key.clone();
                drop(creds);
                if let (Some(uuid), Some(key)) = (uuid, pinned_key) {
                    self.fan(|l| l.pinned_identity_updated(&uuid, Some(&key)));
                }
            }
        }

        let id = self.next_request_id();
        *self.register_id.lock() = Some(id);
        let client_key = self.credentials.lock().client_key.clone();
        let frame = Frame::register(
            id,
            client_key.as_deref(),
            self.config.pairing_type,
            &self.config.manifest,
        );
        self.send_frame(&frame);
    }

    /// `registered`: persist the (possibly refreshed) client key, enter
    /// `Registered` and flush the deferred commands in submission order.
    fn handle_registered(&self, frame: &Frame) {
        let client_key = frame
            .payload
            .as_ref()
            .and_then(|p| p.get("client-key"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(key) = client_key {
            self.credentials.lock().client_key = Some(key.clone());
            self.fan(|l| l.client_key_updated(&key));
        }

        *self.register_id.lock() = None;
        *self.state.lock() = SessionState::Registered;
        info!("✅ Registered with device at {}", self.ip);
        self.fan(|l| l.connected());
        self.flush_queue();
    }

    fn handle_response(&self, frame: Frame) {
        let Some(id) = frame.id else {
            self.fan(|l| l.received_message(&frame));
            return;
        };
        let payload = frame.payload.unwrap_or(Value::Null);

        // A pairing prompt answers the register request without completing
        // it; the register stays pending until `registered` or an error.
        if Some(id) == *self.register_id.lock() {
            if let Some(pt) = payload.get("pairingType").and_then(Value::as_str) {
                let pairing_type = PairingType::from_wire(pt);
                info!("Pairing required: {:?}", pairing_type);
                self.fan(|l| l.before_register(pairing_type));
            }
            return;
        }

        let entry = self.pending.lock().remove(&id);
        let Some(entry) = entry else {
            warn!("Response for unknown request id {}, dropping", id);
            return;
        };
        (entry.handler)(Ok(payload));
        if entry.subscription {
            self.pending.lock().insert(id, entry);
        }
    }

    fn handle_error(&self, frame: Frame) {
        let mut error = CommandError::parse(frame.error.as_deref().unwrap_or(""));
        error.detail = frame.payload;

        let Some(id) = frame.id else {
            warn!("Error frame without id: {}", error);
            return;
        };

        if Some(id) == *self.register_id.lock() {
            warn!("❌ Registration failed: {}", error);
            *self.register_id.lock() = None;
            self.fan(|l| l.registration_failed(&error));
            if let Some(channel) = self.channel.lock().clone() {
                channel.close();
            }
            self.connection_lost(Some(error));
            return;
        }

        let entry = self.pending.lock().remove(&id);
        let Some(entry) = entry else {
            warn!("Error frame for unknown request id {}, dropping", id);
            return;
        };
        (entry.handler)(Err(error));
        if entry.subscription {
            self.pending.lock().insert(id, entry);
        }
    }

    /// Tear the session down: resolve every pending request with a
    /// connection-lost error and return to `Initial`. The command queue
    /// survives (an explicit `disconnect` clears it beforehand).
    fn connection_lost(&self, error: Option<CommandError>) {
        *self.channel.lock() = None;
        *self.register_id.lock() = None;
        *self.state.lock() = SessionState::Initial;

        let pending: Vec<PendingRequest> = {
            let mut table = self.pending.lock();
            table.drain().map(|(_, p)| p).collect()
        };
        if !pending.is_empty() {
            debug!("Resolving {} pending requests as lost", pending.len());
        }
        for entry in pending {
            (entry.handler)(Err(CommandError::connection_lost()));
        }

        self.fan(|l| l.closed_with_error(error.as_ref()));
    }

    fn flush_queue(&self) {
        let commands: Vec<Command> = self.queue.lock().drain(..).collect();
        for command in commands {
            self.send_now(command);
        }
    }

    fn send_now(&self, command: Command) -> u64 {
        let id = self.next_request_id();
        let subscription = command.frame_type == FRAME_SUBSCRIBE;
        let frame = Frame {
            frame_type: command.frame_type,
            id: Some(id),
            uri: command.uri,
            payload: command.payload,
            error: None,
        };
        self.pending.lock().insert(
            id,
            PendingRequest {
                subscription,
                handler: command.handler,
            },
        );

        if let Err(e) = self.send_frame_checked(&frame) {
            if let Some(entry) = self.pending.lock().remove(&id) {
                (entry.handler)(Err(CommandError::new(0, e.to_string())));
            }
        }
        id
    }

    fn send_frame(&self, frame: &Frame) {
        if let Err(e) = self.send_frame_checked(frame) {
            warn!("Failed to send {} frame: {}", frame.frame_type, e);
        }
    }

    fn send_frame_checked(&self, frame: &Frame) -> Result<(), ControlError> {
        let json = frame.to_json()?;
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or(ControlError::ChannelClosed)?;
        debug!("📤 {}", json);
        channel.send(&json)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn fan(&self, f: impl Fn(&dyn SessionListener)) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }
}
