//! Gateway session manager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brickd_core::{Credential, CredentialIssuer, GatewayError, GatewayIdentity, GatewayResult};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConnectionState, ExponentialBackoff, RetryPolicy};
use crate::config::GatewayConfig;
use crate::registry::{AttachmentState, DeviceRegistry};
use crate::subscription::DeviceStream;
use crate::transport::{ConnectOptions, TransportAdapter, TransportEvent};

/// MQTT username; the broker authenticates with the password (token) only
const USERNAME: &str = "unused";

/// Wait after a failed renewal before trying again
const RENEWAL_RETRY: Duration = Duration::from_secs(60);

/// Lower bound between two scheduled renewals
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);

struct SessionInner {
    config: GatewayConfig,
    issuer: CredentialIssuer,
    transport: Arc<dyn TransportAdapter>,
    registry: DeviceRegistry,
    retry_policy: Arc<dyn RetryPolicy>,
    credential: RwLock<Option<Credential>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Serializes connect, reconnect, renewal and disconnect
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_needed: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One authenticated broker connection shared by the gateway and all of its
/// attached devices
pub struct GatewaySession {
    inner: Arc<SessionInner>,
}

impl GatewaySession {
    /// Create a session with the configured exponential backoff
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn TransportAdapter>,
    ) -> GatewayResult<Self> {
        let policy = Arc::new(ExponentialBackoff::from(&config.session.reconnect));
        Self::with_retry_policy(config, transport, policy)
    }

    pub fn with_retry_policy(
        config: GatewayConfig,
        transport: Arc<dyn TransportAdapter>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> GatewayResult<Self> {
        config.identity.validate()?;

        let registry = DeviceRegistry::new(
            transport.clone(),
            config.identity.gateway_id.clone(),
            &config.session,
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(SessionInner {
                issuer: config.credential_issuer(),
                config,
                transport,
                registry,
                retry_policy,
                credential: RwLock::new(None),
                state_tx,
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect_needed: Notify::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the broker connection and start the background lifecycle tasks.
    ///
    /// Returns once the broker has accepted the connection. Calling it on a
    /// connected session is a no-op.
    pub async fn connect(&self) -> GatewayResult<()> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let _guard = inner.connect_lock.lock().await;
        inner.ensure_open()?;
        if inner.state() == ConnectionState::Connected {
            return Ok(());
        }

        inner.set_state(ConnectionState::Connecting);
        if let Err(e) = inner.open_connection().await {
            inner.set_state(ConnectionState::Disconnected);
            error!(error = %e, "Gateway connection failed");
            return Err(e);
        }
        inner.set_state(ConnectionState::Connected);
        info!(client_id = %inner.config.identity.client_id(), "Gateway session connected");

        // Bindings and watches left over from a connection the supervisor
        // gave up on
        if inner.registry.has_live_state() {
            inner.restore_registry().await;
        }

        self.start_background_tasks();
        Ok(())
    }

    /// Close the session for good.
    ///
    /// Stops the background tasks, ends every device stream and lets
    /// in-flight acknowledgements settle for up to `grace` before closing
    /// the connection. Never fails; the session cannot be reconnected.
    pub async fn disconnect(&self, grace: Duration) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.shutdown.cancel();

        let _guard = inner.connect_lock.lock().await;
        inner.registry.close_all_streams();
        inner.transport.disconnect(grace).await;
        inner.set_state(ConnectionState::Disconnected);

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!("Gateway session disconnected");
    }

    fn start_background_tasks(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(run_lifecycle_listener(
            self.inner.clone(),
            self.inner.transport.events(),
        )));
        tasks.push(tokio::spawn(run_reconnect_supervisor(self.inner.clone())));
        tasks.push(tokio::spawn(run_credential_renewal(self.inner.clone())));
        debug!("Session background tasks started");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver that observes every connection state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.inner.config.identity
    }

    /// Credential used for the current connection
    pub fn credential(&self) -> Option<Credential> {
        self.inner.credential.read().clone()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn attachment_state(&self, device_id: &str) -> AttachmentState {
        self.inner.registry.state_of(device_id)
    }

    // =========================================================================
    // Device operations
    // =========================================================================

    pub async fn attach(&self, device_id: &str) -> GatewayResult<()> {
        self.inner.ensure_open()?;
        self.inner.registry.attach(device_id).await
    }

    pub async fn detach(&self, device_id: &str) -> GatewayResult<()> {
        self.inner.ensure_open()?;
        self.inner.registry.detach(device_id).await
    }

    pub async fn publish(&self, device_id: &str, payload: Bytes) -> GatewayResult<()> {
        self.inner.ensure_open()?;
        self.inner.registry.publish(device_id, payload).await
    }

    pub async fn publish_as_gateway(&self, payload: Bytes) -> GatewayResult<()> {
        self.inner.ensure_open()?;
        self.inner.registry.publish_as_gateway(payload).await
    }

    pub async fn set_state(&self, device_id: &str, payload: Bytes) -> GatewayResult<()> {
        self.inner.ensure_open()?;
        self.inner.registry.set_state(device_id, payload).await
    }

    pub async fn set_state_as_gateway(&self, payload: Bytes) -> GatewayResult<()> {
        self.inner.ensure_open()?;
        self.inner.registry.set_state_as_gateway(payload).await
    }

    pub async fn watch_config(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
    ) -> GatewayResult<DeviceStream> {
        self.inner.ensure_open()?;
        self.inner.registry.watch_config(cancel, device_id).await
    }

    pub async fn watch_commands(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
    ) -> GatewayResult<DeviceStream> {
        self.inner.ensure_open()?;
        self.inner.registry.watch_commands(cancel, device_id).await
    }

    pub async fn watch_gateway_config(
        &self,
        cancel: &CancellationToken,
    ) -> GatewayResult<DeviceStream> {
        self.inner.ensure_open()?;
        self.inner.registry.watch_gateway_config(cancel).await
    }

    pub async fn watch_gateway_commands(
        &self,
        cancel: &CancellationToken,
    ) -> GatewayResult<DeviceStream> {
        self.inner.ensure_open()?;
        self.inner.registry.watch_gateway_commands(cancel).await
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl SessionInner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn ensure_open(&self) -> GatewayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(GatewayError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Issue a new credential unless the current one is still comfortably valid
    fn refresh_credential(&self, force: bool) -> GatewayResult<Credential> {
        let now = Utc::now();
        if !force {
            if let Some(current) = self.credential.read().as_ref() {
                let renew_at = current.renew_at(self.config.session.renew_fraction);
                if !current.is_expired(now) && now < renew_at {
                    return Ok(current.clone());
                }
            }
        }

        let credential = self
            .issuer
            .issue(&self.config.identity.project, &self.config.private_key_pem)?;
        *self.credential.write() = Some(credential.clone());
        Ok(credential)
    }

    fn connect_options(&self, credential: &Credential) -> ConnectOptions {
        let broker = &self.config.broker;
        ConnectOptions {
            host: broker.host.clone(),
            port: broker.port,
            client_id: self.config.identity.client_id(),
            username: USERNAME.to_string(),
            password: credential.token().to_string(),
            ca_pem: broker.root_ca_pem.as_ref().map(|pem| pem.as_bytes().to_vec()),
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
            connect_timeout: Duration::from_millis(broker.connect_timeout_ms),
            write_timeout: self.config.session.write_timeout(),
        }
    }

    async fn open_connection(&self) -> GatewayResult<()> {
        let credential = self.refresh_credential(false)?;
        let options = self.connect_options(&credential);
        self.transport
            .connect(&options)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    /// One reconnection attempt after connection loss
    async fn reconnect_once(&self) -> GatewayResult<()> {
        let _guard = self.connect_lock.lock().await;
        self.ensure_open()?;
        if self.state() == ConnectionState::Connected {
            // A manual connect got there first
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.open_connection().await {
            self.set_state(ConnectionState::LostConnection);
            return Err(e);
        }
        self.set_state(ConnectionState::Connected);
        info!("Gateway session reconnected");

        self.restore_registry().await;
        Ok(())
    }

    /// Replace the credential and reconnect with it while still connected
    async fn renew_connection(&self) -> GatewayResult<()> {
        let _guard = self.connect_lock.lock().await;
        self.ensure_open()?;

        let credential = self.refresh_credential(true)?;
        if self.state() != ConnectionState::Connected {
            // The reconnect path presents the fresh credential
            return Ok(());
        }

        info!(expires_at = %credential.expires_at(), "Renewing broker credential");
        self.set_state(ConnectionState::Connecting);
        self.transport
            .disconnect(self.config.session.disconnect_grace())
            .await;

        let options = self.connect_options(&credential);
        if let Err(e) = self.transport.connect(&options).await {
            self.set_state(ConnectionState::LostConnection);
            self.reconnect_needed.notify_one();
            return Err(GatewayError::Connection(e.to_string()));
        }
        self.set_state(ConnectionState::Connected);
        self.restore_registry().await;
        Ok(())
    }

    /// Re-announce attachments and watches, abandoned once shutdown starts.
    /// Runs under `connect_lock`, which `disconnect` waits for.
    async fn restore_registry(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => debug!("Restore abandoned, shutting down"),
            _ = self.registry.restore() => {}
        }
    }

    fn connection_lost(&self, reason: &str) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!(%reason, "Broker connection lost");
        self.set_state(ConnectionState::LostConnection);
        self.reconnect_needed.notify_one();
    }
}

/// React to transport lifecycle notifications
async fn run_lifecycle_listener(
    inner: Arc<SessionInner>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(TransportEvent::Connected) => debug!("Transport connected"),
            Ok(TransportEvent::UnroutedMessage(message)) => {
                debug!(
                    topic = %message.topic,
                    len = message.payload.len(),
                    age_ms = message.timestamp.elapsed().as_millis() as u64,
                    "Message without subscriber"
                );
            }
            Ok(TransportEvent::ConnectionLost(reason)) => inner.connection_lost(&reason),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lifecycle listener lagged");
                if !inner.transport.is_connected().await {
                    inner.connection_lost("lifecycle events lost");
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Reconnect with backoff whenever the connection is lost
async fn run_reconnect_supervisor(inner: Arc<SessionInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.reconnect_needed.notified() => {}
        }

        let mut attempt = 0;
        loop {
            let Some(delay) = inner.retry_policy.next_delay(attempt) else {
                error!(attempts = attempt, "Giving up on reconnecting");
                inner.set_state(ConnectionState::Disconnected);
                break;
            };
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;

            match inner.reconnect_once().await {
                Ok(()) => break,
                Err(GatewayError::SessionClosed) => return,
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }
}

/// Renew the credential before it expires
async fn run_credential_renewal(inner: Arc<SessionInner>) {
    loop {
        let wait = inner
            .credential
            .read()
            .as_ref()
            .map(|credential| {
                let renew_at = credential.renew_at(inner.config.session.renew_fraction);
                (renew_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
            })
            .unwrap_or(RENEWAL_RETRY)
            .max(MIN_RENEWAL_INTERVAL);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match inner.renew_connection().await {
            Ok(()) => {}
            Err(GatewayError::SessionClosed) => break,
            Err(e) => {
                warn!(error = %e, "Credential renewal failed");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RENEWAL_RETRY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MockConfig, SessionConfig};
    use crate::transport::mock::MockTransportAdapter;
    use crate::transport::TransportError;

    const RSA_PRIVATE: &str = include_str!("../../../brickd-core/testdata/rsa_private.pem");

    fn config() -> GatewayConfig {
        let identity = GatewayIdentity::new("brickd", "europe-west1", "fleet", "gw-1");
        GatewayConfig::new(identity, RSA_PRIVATE)
    }

    fn session_with(config: GatewayConfig) -> (Arc<MockTransportAdapter>, GatewaySession) {
        let mock = Arc::new(MockTransportAdapter::new(&MockConfig::default()));
        let session = GatewaySession::new(config, mock.clone()).unwrap();
        (mock, session)
    }

    #[tokio::test]
    async fn test_connect_presents_identity_and_token() {
        let (mock, session) = session_with(config());

        session.connect().await.unwrap();

        let options = mock.last_connect_options().unwrap();
        assert_eq!(
            options.client_id,
            "projects/brickd/locations/europe-west1/registries/fleet/devices/gw-1"
        );
        assert_eq!(options.username, "unused");
        assert_eq!(options.password, session.credential().unwrap().token());
        assert_eq!(options.port, 8883);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (mock, session) = session_with(config());
        mock.fail_next_connects(1, TransportError::ConnectionRefused("bad token".into()));

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, GatewayError::Connection(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_bad_key_is_credential_error() {
        let mut config = config();
        config.private_key_pem = "not a key".to_string();
        let (mock, session) = session_with(config);

        assert!(matches!(
            session.connect().await,
            Err(GatewayError::Credential(_))
        ));
        assert_eq!(mock.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_identity_rejected_up_front() {
        let identity = GatewayIdentity::new("brickd", "europe-west1", "fleet", "gw/1");
        let mock = Arc::new(MockTransportAdapter::new(&MockConfig::default()));
        let result = GatewaySession::new(GatewayConfig::new(identity, RSA_PRIVATE), mock);
        assert!(matches!(result, Err(GatewayError::InvalidIdentity(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal() {
        let (mock, session) = session_with(config());
        session.connect().await.unwrap();

        session.disconnect(Duration::from_millis(10)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!mock.is_connected().await);
        assert!(matches!(
            session.connect().await,
            Err(GatewayError::SessionClosed)
        ));
        assert!(matches!(
            session.publish_as_gateway(Bytes::from("x")).await,
            Err(GatewayError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_then_reconnect() {
        let mut config = config();
        config.session = SessionConfig {
            reconnect: crate::config::ReconnectConfig {
                initial_delay_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mock, session) = session_with(config);
        session.connect().await.unwrap();

        mock.simulate_connection_loss("broker restart");

        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.connect_count() < 2 || session.state() != ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(mock.is_connected().await);
    }
}
