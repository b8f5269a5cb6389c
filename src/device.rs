use crate::{
    auth::Authenticator,
    ble::{BleTransport, DiscoveryFilter, Link, Notification, Transport},
    error::{AromaTechError, Result},
    negotiator::{negotiate, refine, settle_reservoirs},
    protocol::{
        decode, encode, AuthResult, ClockTime, Command, CommandIntent, IdentityField,
        IdentityReport, Message, Reply,
    },
    state::{DeviceSnapshot, DeviceState, MergeContext},
    types::{
        Classification, Credential, DeviceConfig, DeviceIdentity, ProtocolVersion, SessionConfig,
        SessionState, DEFAULT_INTENSITY, DEFAULT_MAX_INTENSITY,
    },
};
use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// Session with one AromaTech diffuser
///
/// `DiffuserSession` owns the transport link for its lifetime. It runs the
/// login handshake, keeps the device state current from notifications and
/// serializes commands so that only one is ever waiting for its
/// acknowledgment.
///
/// # Examples
///
/// ```no_run
/// use aromatech_ble::{Credential, DiffuserSession, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let credential = Credential::new("8888")?;
///     let session = DiffuserSession::connect_first(credential, SessionConfig::default()).await?;
///
///     session.set_intensity(3).await?;
///     session.set_power(true).await?;
///
///     let state = session.state();
///     println!("Diffusing at level {}", state.current_intensity);
///
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct DiffuserSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

struct PendingReply {
    expect: Reply,
    reply: oneshot::Sender<Result<Message>>,
}

#[derive(Debug, Default)]
struct Handshake {
    identity: Option<DeviceIdentity>,
    frozen: bool,
    limits_seen: bool,
}

struct SessionInner<T: Transport> {
    transport: T,
    address: String,
    config: SessionConfig,
    command_lock: Mutex<()>,
    link: Mutex<Option<Arc<T::Link>>>,
    pending: StdMutex<Option<PendingReply>>,
    handshake: StdRwLock<Handshake>,
    state: watch::Sender<DeviceState>,
    session: watch::Sender<SessionState>,
    credential: StdMutex<Option<Credential>>,
    preferred_intensity: AtomicU8,
    anomalies: AtomicU64,
    generation: AtomicU64,
    shutting_down: AtomicBool,
    pump: StdMutex<Option<JoinHandle<()>>>,
    reconnector: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiffuserSession<BleTransport> {
    /// Scan for diffusers and connect to the one with the strongest signal
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::DeviceNotFound`] if no diffuser answers the
    /// scan, or any error from [`DiffuserSession::connect`].
    pub async fn connect_first(credential: Credential, config: SessionConfig) -> Result<Self> {
        let transport = BleTransport::new().await?;
        let window = Duration::from_millis(config.connection.scan_timeout_ms);
        let mut devices = transport.scan(&DiscoveryFilter::default(), window).await?;

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        let device = devices
            .into_iter()
            .next()
            .ok_or(AromaTechError::DeviceNotFound)?;

        let session = Self::with_config(transport, device.address, config);
        session.connect(credential).await?;
        Ok(session)
    }

    /// Connect to a configured diffuser
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::InvalidCredential`] for a malformed password,
    /// or any error from [`DiffuserSession::connect`].
    pub async fn open(device: &DeviceConfig, config: SessionConfig) -> Result<Self> {
        let credential = device.credential()?;
        let transport = BleTransport::new().await?;
        let session = Self::with_config(transport, device.address.clone(), config);
        session.connect(credential).await?;
        Ok(session)
    }
}

impl<T: Transport> DiffuserSession<T> {
    /// Create a disconnected session with default settings
    pub fn new(transport: T, address: impl Into<String>) -> Self {
        Self::with_config(transport, address, SessionConfig::default())
    }

    /// Create a disconnected session
    pub fn with_config(transport: T, address: impl Into<String>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(DeviceState::default());
        let (session, _) = watch::channel(SessionState::Disconnected);

        Self {
            inner: Arc::new(SessionInner {
                transport,
                address: address.into(),
                config,
                command_lock: Mutex::new(()),
                link: Mutex::new(None),
                pending: StdMutex::new(None),
                handshake: StdRwLock::new(Handshake::default()),
                state,
                session,
                credential: StdMutex::new(None),
                preferred_intensity: AtomicU8::new(0),
                anomalies: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                pump: StdMutex::new(None),
                reconnector: StdMutex::new(None),
            }),
        }
    }

    /// BLE address of the diffuser
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Connect, log in and identify the diffuser
    ///
    /// Returns immediately if the session is already ready. Any partial
    /// connection is torn down before an error is returned.
    ///
    /// # Errors
    ///
    /// - [`AromaTechError::AuthenticationRejected`] if the password is wrong
    /// - [`AromaTechError::AuthenticationTimeout`] if the device never answers the login
    /// - [`AromaTechError::IdentityUnavailable`] if the login reply cannot be read
    /// - transport errors from connecting or writing
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        self.inner.stop_reconnect();

        let _guard = self.inner.command_lock.lock().await;
        if self.session_state() == SessionState::Ready {
            let link = self.inner.link.lock().await.clone();
            if let Some(link) = link {
                if link.is_connected().await {
                    debug!("Already connected to {}", self.inner.address);
                    return Ok(());
                }
            }
            warn!("Link to {} went stale, reconnecting", self.inner.address);
            if let Err(e) = self.inner.teardown().await {
                debug!("Error closing stale link: {}", e);
            }
        }

        self.inner.establish(credential).await
    }

    /// Release the link
    ///
    /// A command waiting for its acknowledgment fails with
    /// [`AromaTechError::Disconnected`]. `last_seen` and `rssi` keep their last
    /// values.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if closing the link fails; the session is
    /// disconnected either way.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from {}", self.inner.address);
        self.inner.stop_reconnect();
        self.inner.teardown().await
    }

    /// Turn the diffuser on or off
    ///
    /// Powering on runs at the preferred intensity if one was set, otherwise
    /// at the last known intensity.
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::NotConnected`] or
    /// [`AromaTechError::NotAuthenticated`] outside a ready session, and a
    /// transport error if the device does not acknowledge.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        let identity = self.inner.ready_identity()?;
        let command = if on {
            Command::PowerOn {
                intensity: self.power_on_intensity(&identity),
            }
        } else {
            Command::PowerOff
        };

        info!("Turning diffuser {}", if on { "on" } else { "off" });
        self.inner.execute(command).await
    }

    /// Change the intensity
    ///
    /// The state reflects the new level once the device acknowledges it.
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::InvalidIntensity`] without writing anything if
    /// `level` is outside `1..=max_intensity`, and otherwise the same errors
    /// as [`DiffuserSession::set_power`].
    pub async fn set_intensity(&self, level: u8) -> Result<()> {
        let identity = self.inner.ready_identity()?;
        if !identity.accepts_intensity(level) {
            return Err(AromaTechError::InvalidIntensity {
                level,
                max: identity.max_intensity,
            });
        }

        info!("Setting intensity to {}", level);
        self.inner.execute(Command::SetIntensity(level)).await?;
        self.inner.preferred_intensity.store(level, Ordering::SeqCst);
        Ok(())
    }

    /// Remember the level used by the next power-on without sending anything
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::InvalidIntensity`] if `level` is outside the
    /// range of the current device, or outside `1..=5` before the first
    /// handshake.
    pub fn set_preferred_intensity(&self, level: u8) -> Result<()> {
        let max = self
            .identity()
            .map_or(DEFAULT_MAX_INTENSITY, |identity| identity.max_intensity);
        if level == 0 || level > max {
            return Err(AromaTechError::InvalidIntensity { level, max });
        }
        self.inner.preferred_intensity.store(level, Ordering::SeqCst);
        Ok(())
    }

    /// Ask the device to resend its full state
    ///
    /// # Errors
    ///
    /// Same as [`DiffuserSession::set_power`].
    pub async fn request_status(&self) -> Result<()> {
        self.inner.ready_identity()?;
        let credential = lock(&self.inner.credential)
            .clone()
            .ok_or(AromaTechError::NotAuthenticated)?;
        self.inner.execute(Command::RequestStatus(credential)).await
    }

    /// Set the device clock to host local time
    ///
    /// # Errors
    ///
    /// Same as [`DiffuserSession::set_power`].
    pub async fn sync_clock(&self) -> Result<()> {
        self.inner.ready_identity()?;
        self.inner
            .execute(Command::SyncClock(ClockTime::now()))
            .await
    }

    /// Current device state
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.inner.state.borrow().clone()
    }

    /// Current session state
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        *self.inner.session.borrow()
    }

    /// Check if commands are accepted
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.session_state() == SessionState::Ready
    }

    /// Identity from the most recent completed handshake
    #[must_use]
    pub fn identity(&self) -> Option<DeviceIdentity> {
        let handshake = self.inner.read_handshake();
        if handshake.frozen {
            handshake.identity.clone()
        } else {
            None
        }
    }

    /// Identity and state together
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            identity: self.identity(),
            state: self.state(),
        }
    }

    /// Watch device state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.inner.state.subscribe()
    }

    /// Watch session state changes
    #[must_use]
    pub fn subscribe_session(&self) -> watch::Receiver<SessionState> {
        self.inner.session.subscribe()
    }

    /// Number of frames that could not be decoded
    #[must_use]
    pub fn decode_anomalies(&self) -> u64 {
        self.inner.anomalies.load(Ordering::Relaxed)
    }

    fn power_on_intensity(&self, identity: &DeviceIdentity) -> u8 {
        let preferred = self.inner.preferred_intensity.load(Ordering::SeqCst);
        let level = if preferred > 0 {
            preferred
        } else {
            match self.inner.state.borrow().current_intensity {
                0 => DEFAULT_INTENSITY,
                current => current,
            }
        };
        level.clamp(1, identity.max_intensity.max(1))
    }
}

impl<T: Transport> SessionInner<T> {
    fn read_handshake(&self) -> std::sync::RwLockReadGuard<'_, Handshake> {
        self.handshake.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handshake(&self) -> std::sync::RwLockWriteGuard<'_, Handshake> {
        self.handshake.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frozen identity of a ready session
    fn ready_identity(&self) -> Result<DeviceIdentity> {
        match *self.session.borrow() {
            SessionState::Ready => {}
            SessionState::Authenticating => return Err(AromaTechError::NotAuthenticated),
            SessionState::Disconnected | SessionState::Connecting => {
                return Err(AromaTechError::NotConnected)
            }
        }
        let handshake = self.read_handshake();
        match (&handshake.identity, handshake.frozen) {
            (Some(identity), true) => Ok(identity.clone()),
            _ => Err(AromaTechError::NotAuthenticated),
        }
    }

    async fn establish(self: &Arc<Self>, credential: Credential) -> Result<()> {
        match self.handshake(credential.clone()).await {
            Ok(()) => {
                *lock(&self.credential) = Some(credential);
                Ok(())
            }
            Err(e) => {
                warn!("Handshake with {} failed: {}", self.address, e);
                if e.is_fatal_for_credential() {
                    lock(&self.credential).take();
                }
                if let Err(teardown) = self.teardown().await {
                    debug!("Error closing partial connection: {}", teardown);
                }
                Err(e)
            }
        }
    }

    async fn handshake(self: &Arc<Self>, credential: Credential) -> Result<()> {
        let timeouts = &self.config.timeouts;
        self.session.send_replace(SessionState::Connecting);
        *self.write_handshake() = Handshake::default();

        let connect_timeout = Duration::from_millis(self.config.connection.connect_timeout_ms);
        let link = Arc::new(self.transport.connect(&self.address, connect_timeout).await?);
        *self.link.lock().await = Some(Arc::clone(&link));

        let notifications = link.subscribe(self.config.connection.notification_queue).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let rssi = link.rssi().await;
        self.state.send_modify(|state| {
            state.mark_connected();
            if rssi.is_some() {
                state.rssi = rssi;
            }
        });

        let pump = tokio::spawn(Arc::clone(self).pump(notifications, generation));
        if let Some(previous) = lock(&self.pump).replace(pump) {
            previous.abort();
        }

        self.session.send_replace(SessionState::Authenticating);
        self.authenticate(credential).await?;

        let version = self
            .read_handshake()
            .identity
            .as_ref()
            .map(|identity| identity.protocol_version)
            .ok_or_else(|| {
                AromaTechError::IdentityUnavailable(
                    "login reply carried no readable signature".to_string(),
                )
            })?;
        info!("Logged in to {}, protocol {}", self.address, version);

        // the device pushes identity and state right after login
        sleep(Duration::from_millis(timeouts.data_burst_ms)).await;
        self.fill_identity(version).await;

        let identity = self.freeze_identity();
        self.state
            .send_modify(|state| state.clamp_intensity(identity.max_intensity));

        for frame in encode(&Command::SyncClock(ClockTime::now()), version) {
            let sent = self
                .request(frame.bytes, frame.awaits, timeouts.command_timeout_ms)
                .await;
            if let Err(e) = sent {
                debug!("Clock sync failed: {}", e);
            }
        }

        self.session.send_replace(SessionState::Ready);
        info!(
            "Diffuser ready: {} ({}), max intensity {}",
            identity.device_name, identity.product_name, identity.max_intensity
        );
        Ok(())
    }

    async fn authenticate(&self, credential: Credential) -> Result<()> {
        let login_timeout = self.config.timeouts.login_timeout_ms;
        let mut auth = Authenticator::new(credential);
        let mut next = auth.start();

        while let Some(frame) = next.take() {
            match self.request(frame, Some(Reply::Login), login_timeout).await {
                Ok(Some(Message::Login(reply))) => {
                    auth.on_reply(&reply);
                }
                Ok(_) => {
                    return Err(AromaTechError::Protocol(
                        "login write produced no reply".to_string(),
                    ))
                }
                Err(AromaTechError::Timeout { .. }) => next = auth.on_timeout(),
                Err(e) => return Err(e),
            }
        }

        auth.outcome(login_timeout)
    }

    /// Read the identity fields the post-login burst did not carry
    async fn fill_identity(&self, version: ProtocolVersion) {
        let (need_name, need_limits) = {
            let handshake = self.read_handshake();
            let name_missing = handshake
                .identity
                .as_ref()
                .is_none_or(|identity| identity.device_name.is_empty());
            (name_missing, !handshake.limits_seen)
        };
        let need_versions =
            version == ProtocolVersion::V2 && self.state.borrow().pcb_version.is_none();

        let reads = [
            (need_name, Command::ReadName),
            (need_versions, Command::ReadVersion),
            (need_limits, Command::ReadLimits),
        ];
        for (needed, command) in reads {
            if !needed {
                continue;
            }
            for frame in encode(&command, version) {
                let read_timeout = self.config.timeouts.identity_read_timeout_ms;
                if let Err(e) = self.request(frame.bytes, frame.awaits, read_timeout).await {
                    debug!("{} failed: {}", command.name(), e);
                }
            }
        }
    }

    fn freeze_identity(&self) -> DeviceIdentity {
        let reservoirs = self.state.borrow().oils.len();
        let mut handshake = self.write_handshake();
        let handshake = &mut *handshake;
        handshake.frozen = true;

        let identity = handshake.identity.get_or_insert_with(|| {
            DeviceIdentity::new(ProtocolVersion::V2, Classification::Fallback)
        });
        settle_reservoirs(identity, reservoirs);
        identity.clone()
    }

    /// Run one command, holding the command lock until every frame is acknowledged
    async fn execute(&self, command: Command) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let version = self.ready_identity()?.protocol_version;

        debug!("Executing {}", command.name());
        let frames = encode(&command, version);
        let acknowledged = frames.last().is_none_or(|frame| frame.awaits.is_some());
        for frame in frames {
            self.request(frame.bytes, frame.awaits, self.config.timeouts.command_timeout_ms)
                .await?;
        }

        if !acknowledged && matches!(command.intent(), CommandIntent::Drive { .. }) {
            self.confirm_status(version).await?;
        }
        Ok(())
    }

    /// Replay the login and wait for the schedule report it brings back
    ///
    /// Quick power writes are never answered, so this is how they get a
    /// status report.
    async fn confirm_status(&self, version: ProtocolVersion) -> Result<()> {
        let credential = lock(&self.credential)
            .clone()
            .ok_or(AromaTechError::NotAuthenticated)?;

        debug!("Requesting status to confirm the last write");
        for frame in encode(&Command::RequestStatus(credential), version) {
            self.request(
                frame.bytes,
                Some(Reply::Schedule),
                self.config.timeouts.command_timeout_ms,
            )
            .await?;
        }
        Ok(())
    }

    /// Write one frame and wait for its acknowledgment, if it expects one
    async fn request(
        &self,
        bytes: Bytes,
        awaits: Option<Reply>,
        timeout_ms: u64,
    ) -> Result<Option<Message>> {
        let link = self
            .link
            .lock()
            .await
            .clone()
            .ok_or(AromaTechError::NotConnected)?;

        let waiter = awaits.map(|expect| {
            let (reply, rx) = oneshot::channel();
            if let Some(stale) = lock(&self.pending).replace(PendingReply { expect, reply }) {
                let _ = stale.reply.send(Err(AromaTechError::Protocol(
                    "superseded by a newer command".to_string(),
                )));
            }
            rx
        });

        if let Err(e) = link.write(&bytes).await {
            lock(&self.pending).take();
            return Err(e);
        }

        let Some(rx) = waiter else {
            return Ok(None);
        };

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(AromaTechError::Disconnected),
            Err(_) => {
                lock(&self.pending).take();
                Err(AromaTechError::Timeout { timeout_ms })
            }
        }
    }

    fn cancel_pending(&self, error: AromaTechError) {
        if let Some(pending) = lock(&self.pending).take() {
            let _ = pending.reply.send(Err(error));
        }
    }

    /// Apply notifications in delivery order until the link closes
    async fn pump(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<Notification>,
        generation: u64,
    ) {
        while let Some(notification) = notifications.recv().await {
            self.handle_notification(&notification);
        }
        self.on_link_closed(generation).await;
    }

    fn handle_notification(&self, notification: &Notification) {
        let version = self
            .read_handshake()
            .identity
            .as_ref()
            .map(|identity| identity.protocol_version);
        let message = decode(&notification.data, version);

        if let Message::Unrecognized(raw) = &message {
            let count = self.anomalies.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "{} (#{})",
                AromaTechError::DecodeAnomaly(format!("{:02X?}", &raw[..])),
                count
            );
            return;
        }
        debug!("Received {:02X?}", &notification.data[..]);

        let report = match &message {
            Message::Login(reply) => {
                self.absorb_login(reply.result, reply.identity.as_ref());
                None
            }
            Message::Identity(field) => {
                self.absorb_identity(field);
                None
            }
            Message::Status(report) => Some(report),
            Message::Acknowledgement(opcode) => {
                debug!("Status byte 0x{:02X}", opcode);
                None
            }
            Message::Unrecognized(_) => None,
        };

        let ctx = {
            let handshake = self.read_handshake();
            match handshake.identity.as_ref() {
                Some(identity) if handshake.limits_seen || handshake.frozen => {
                    MergeContext::from(identity)
                }
                // no clamp against the placeholder maximum, freezing clamps later
                identity => MergeContext {
                    battery_support: identity
                        .is_some_and(|identity| identity.capabilities.battery_support),
                    max_intensity: u8::MAX,
                },
            }
        };
        let seen = SystemTime::now();
        self.state.send_modify(|state| {
            if let Some(report) = report {
                state.apply_report(report, ctx);
            }
            state.record_contact(seen, notification.rssi);
        });

        let mut pending = lock(&self.pending);
        if pending
            .as_ref()
            .is_some_and(|waiting| waiting.expect.matches(&message))
        {
            if let Some(waiting) = pending.take() {
                let _ = waiting.reply.send(Ok(message));
            }
        }
    }

    fn absorb_login(&self, result: AuthResult, report: Option<&IdentityReport>) {
        let mut handshake = self.write_handshake();
        if handshake.frozen || result != AuthResult::Success || handshake.identity.is_some() {
            return;
        }
        match negotiate(report) {
            Ok(identity) => handshake.identity = Some(identity),
            Err(e) => debug!("{}", e),
        }
    }

    fn absorb_identity(&self, field: &IdentityField) {
        let mut guard = self.write_handshake();
        let handshake = &mut *guard;
        if handshake.frozen {
            debug!("Ignoring identity update after handshake: {:?}", field);
            return;
        }
        if let Some(identity) = handshake.identity.as_mut() {
            if matches!(
                field,
                IdentityField::Limits { .. } | IdentityField::LegacyLimits
            ) {
                handshake.limits_seen = true;
            }
            refine(identity, field);
        }
    }

    async fn on_link_closed(self: Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation
            || self.shutting_down.load(Ordering::SeqCst)
        {
            return;
        }

        warn!("Link to {} dropped", self.address);
        let was_ready = *self.session.borrow() == SessionState::Ready;
        let was_on = self.state.borrow().power;

        self.state.send_modify(DeviceState::mark_disconnected);
        self.session.send_replace(SessionState::Disconnected);
        self.cancel_pending(AromaTechError::Disconnected);
        self.link.lock().await.take();

        let policy = &self.config.reconnect;
        if was_ready && was_on && policy.enabled && lock(&self.credential).is_some() {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.reconnect_loop().await });
        if let Some(previous) = lock(&self.reconnector).replace(handle) {
            previous.abort();
        }
    }

    fn stop_reconnect(&self) {
        if let Some(handle) = lock(&self.reconnector).take() {
            handle.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.backoff_ms(attempt);
            info!(
                "Reconnecting to {} in {}ms (attempt {}/{})",
                self.address, delay, attempt, policy.max_attempts
            );
            sleep(Duration::from_millis(delay)).await;

            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let Some(credential) = lock(&self.credential).clone() else {
                return;
            };

            let _guard = self.command_lock.lock().await;
            if *self.session.borrow() == SessionState::Ready {
                return;
            }
            match self.establish(credential).await {
                Ok(()) => {
                    info!("Reconnected to {}", self.address);
                    return;
                }
                Err(e) if e.is_fatal_for_credential() => {
                    error!("Reconnect to {} stopped: {}", self.address, e);
                    return;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        warn!(
            "Giving up on {} after {} reconnect attempts",
            self.address, policy.max_attempts
        );
    }

    /// Drop the link and everything tied to it
    async fn teardown(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.cancel_pending(AromaTechError::Disconnected);

        let link = self.link.lock().await.take();
        self.state.send_modify(DeviceState::mark_disconnected);
        self.session.send_replace(SessionState::Disconnected);

        match link {
            Some(link) => link.disconnect().await,
            None => Ok(()),
        }
    }
}

impl<T: Transport> Drop for DiffuserSession<T> {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.stop_reconnect();

        let inner = Arc::clone(&self.inner);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = inner.teardown().await;
            });
        }
    }
}
