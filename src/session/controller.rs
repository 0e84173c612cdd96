/// Monitoring session state machine
///
/// Drives one peripheral from discovery through a fixed monitoring window:
/// `Idle -> Scanning -> Connecting -> Connected -> Monitoring -> Completing -> Idle`,
/// with `Aborted` on cancellation, connection failures and dropped links.
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use time::OffsetDateTime;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bluetooth::{
    ConnectionManager, NotificationChannel, Radio, ScanWindow, Subscription,
    OXIMETER_MEASUREMENT_UUID, OXIMETER_SERVICE_UUID,
};
use crate::database::SessionStore;
use crate::models::{ConnectionState, MonitoringSession, PeripheralHandle, SessionRecord};
use crate::session::aggregator::{
    lock_samples, SampleAggregator, SharedAggregator, DEFAULT_MIN_SAMPLES,
};
use crate::session::{AbortReason, SessionError, SessionEvent, SessionOutcome, SessionState};
use crate::utils::{format_datetime, unix_millis};

pub const DEFAULT_SCAN_DURATION_MS: u64 = 3500;
pub const DEFAULT_SESSION_DURATION_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub scan_duration: Duration,
    pub session_duration: Duration,
    pub min_samples: usize,
    /// Owner of the persisted results
    pub user_email: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            service: OXIMETER_SERVICE_UUID,
            characteristic: OXIMETER_MEASUREMENT_UUID,
            scan_duration: Duration::from_millis(DEFAULT_SCAN_DURATION_MS),
            session_duration: Duration::from_secs(DEFAULT_SESSION_DURATION_SECS),
            min_samples: DEFAULT_MIN_SAMPLES,
            user_email: String::new(),
        }
    }
}

pub struct SessionController<R: Radio, S: SessionStore> {
    settings: SessionSettings,
    scanner: ScanWindow<R>,
    connection: ConnectionManager<R>,
    notifications: NotificationChannel<R>,
    samples: SharedAggregator,
    store: S,
    events: UnboundedSender<SessionEvent>,
    state: SessionState,
    cancel: CancellationToken,
}

impl<R: Radio, S: SessionStore> SessionController<R, S> {
    pub fn new(
        radio: Arc<R>,
        store: S,
        settings: SessionSettings,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let samples = SampleAggregator::shared(settings.min_samples);

        SessionController {
            scanner: ScanWindow::new(Arc::clone(&radio)),
            connection: ConnectionManager::new(Arc::clone(&radio), Arc::clone(&samples)),
            notifications: NotificationChannel::new(radio),
            samples,
            store,
            events,
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            settings,
        }
    }

    /// Current session state
    ///
    /// A link that dropped while waiting to start monitoring reads as Idle;
    /// the next operation on the controller emits the matching abort.
    pub fn state(&self) -> SessionState {
        if self.link_lost() {
            SessionState::Idle
        } else {
            self.state
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn discovered(&self) -> Vec<PeripheralHandle> {
        self.scanner.results()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Sample buffer of the current or last session
    pub fn samples(&self) -> SharedAggregator {
        Arc::clone(&self.samples)
    }

    pub fn pulse_series(&self) -> Vec<u8> {
        lock_samples(&self.samples).pulse_series()
    }

    /// Token that aborts the running monitoring window when cancelled
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn transition(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    /// Drop partial data and return to idle
    fn abort(&mut self, reason: AbortReason) {
        lock_samples(&self.samples).clear();
        self.transition(SessionState::Aborted);
        warn!("Session aborted: {:?}", reason);
        self.emit(SessionEvent::Aborted(reason));

        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.transition(SessionState::Idle);
    }

    fn link_lost(&self) -> bool {
        self.state == SessionState::Connected
            && self.connection.state() != ConnectionState::Connected
    }

    /// Abort a session whose peripheral dropped before monitoring started
    fn sync_link(&mut self) {
        if self.link_lost() {
            warn!("Peripheral dropped before monitoring started");
            self.abort(AbortReason::Disconnected);
        }
    }

    async fn release_peripheral(&mut self) {
        let Some(peripheral) = self.connection.connected_peripheral().cloned() else {
            return;
        };
        if let Err(e) = self.connection.disconnect(&peripheral).await {
            warn!(
                "Could not release {}: {}",
                peripheral.display_name(),
                e
            );
        }
    }

    /// Start discovering oximeters
    ///
    /// Allowed while idle, or while scanning to restart discovery. The
    /// receiver yields peripherals as they are found and closes when the scan
    /// window ends.
    pub async fn start_scan(&mut self) -> Result<UnboundedReceiver<PeripheralHandle>, SessionError> {
        self.sync_link();
        if !matches!(self.state, SessionState::Idle | SessionState::Scanning) {
            return Err(SessionError::InvalidState(self.state));
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        match self
            .scanner
            .start_scan(self.settings.service, self.settings.scan_duration)
            .await
        {
            Ok(found) => {
                self.transition(SessionState::Scanning);
                Ok(found)
            }
            Err(e) => {
                error!("Scan failed: {}", e);
                self.transition(SessionState::Idle);
                Err(e.into())
            }
        }
    }

    /// Connect to a peripheral picked from the scan results
    pub async fn select(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        self.sync_link();
        if self.state != SessionState::Scanning {
            return Err(SessionError::InvalidState(self.state));
        }

        if let Err(e) = self.scanner.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.transition(SessionState::Connecting);

        match self.connection.connect(peripheral).await {
            Ok(()) => {
                self.transition(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.abort(AbortReason::ConnectFailed(e.clone()));
                Err(e.into())
            }
        }
    }

    /// Abandon whatever the session is doing and return to idle
    pub async fn cancel(&mut self) {
        self.sync_link();
        if self.state == SessionState::Idle {
            return;
        }
        if let Err(e) = self.scanner.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.release_peripheral().await;
        self.abort(AbortReason::Cancelled);
    }

    /// Run one monitoring window on the connected peripheral
    ///
    /// Subscribes to measurement notifications and collects samples until the
    /// session timer elapses, then averages and stores the result. A dropped
    /// link, a closed notification stream or the cancellation token abort the
    /// session instead; partial samples are discarded and nothing is stored.
    ///
    /// # Returns
    /// The session outcome, or InvalidState if no peripheral is connected
    pub async fn start_monitoring(&mut self) -> Result<SessionOutcome, SessionError> {
        self.sync_link();
        if self.state != SessionState::Connected {
            warn!("Cannot start monitoring while {:?}", self.state);
            return Err(SessionError::InvalidState(self.state));
        }

        let Some(peripheral) = self.connection.connected_peripheral().cloned() else {
            self.abort(AbortReason::Disconnected);
            return Err(SessionError::InvalidState(self.state));
        };

        lock_samples(&self.samples).clear();

        let mut subscription = match self
            .notifications
            .subscribe(
                &peripheral,
                self.settings.service,
                self.settings.characteristic,
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(
                    "Failed to subscribe to {}: {}",
                    peripheral.display_name(),
                    e
                );
                self.release_peripheral().await;
                self.abort(AbortReason::SubscribeFailed(e.clone()));
                return Err(e.into());
            }
        };

        let session = MonitoringSession::new(peripheral);
        self.transition(SessionState::Monitoring);
        info!(
            "Monitoring {} for {:?} from {}",
            session.peripheral.display_name(),
            self.settings.session_duration,
            format_datetime(&session.start_time)
        );

        match self.collect(&mut subscription).await {
            None => Ok(self.complete(subscription, session).await),
            Some(reason) => {
                match reason {
                    AbortReason::Disconnected => subscription.release(),
                    _ => {
                        if let Err(e) = self.notifications.unsubscribe(subscription).await {
                            warn!("Failed to unsubscribe: {}", e);
                        }
                        self.release_peripheral().await;
                    }
                }
                self.abort(reason.clone());
                Ok(SessionOutcome::Aborted(reason))
            }
        }
    }

    /// Append samples until the window elapses
    ///
    /// Returns None when the timer fired, or why the window was cut short.
    /// Disconnects and cancellation are checked before every payload.
    async fn collect(&mut self, subscription: &mut Subscription) -> Option<AbortReason> {
        let mut link = self.connection.watch();
        let cancel = self.cancel.clone();
        let timer = sleep(self.settings.session_duration);
        tokio::pin!(timer);

        loop {
            let connected = *link.borrow_and_update() == ConnectionState::Connected;
            if !connected {
                return Some(AbortReason::Disconnected);
            }

            tokio::select! {
                biased;

                changed = link.changed() => {
                    if changed.is_err() {
                        return Some(AbortReason::Disconnected);
                    }
                }
                _ = cancel.cancelled() => return Some(AbortReason::Cancelled),
                _ = &mut timer => return None,
                frame = subscription.next_frame() => match frame {
                    Some(Some(sample)) => {
                        trace!("Sample: {:?}", sample);
                        lock_samples(&self.samples).append(sample);
                        self.emit(SessionEvent::Sample(sample));
                    }
                    Some(None) => trace!("Dropped payload without measurement frame"),
                    None => return Some(AbortReason::NotificationsClosed),
                },
            }
        }
    }

    async fn complete(
        &mut self,
        subscription: Subscription,
        mut session: MonitoringSession,
    ) -> SessionOutcome {
        self.transition(SessionState::Completing);

        if let Err(e) = self.notifications.unsubscribe(subscription).await {
            warn!("Failed to unsubscribe: {}", e);
        }

        let (samples, result, min_samples) = {
            let aggregator = lock_samples(&self.samples);
            (
                aggregator.samples().to_vec(),
                aggregator.average(),
                aggregator.min_samples(),
            )
        };
        let end_time = OffsetDateTime::now_utc();
        session.samples = samples;
        session.end_time = Some(end_time);
        session.result = result;

        info!(
            "Session on {} complete at {} with {} samples",
            session.peripheral.display_name(),
            format_datetime(&end_time),
            session.samples.len()
        );

        let persisted = match result {
            Some(average) => {
                let record = SessionRecord {
                    id: Uuid::new_v4(),
                    user_email: self.settings.user_email.clone(),
                    spo2: average.spo2,
                    pulse: average.pulse,
                    perfusion_index: average.perfusion_index,
                    timestamp_millis: unix_millis(&end_time),
                };
                match self.store.store_session(&record).await {
                    Ok(()) => {
                        info!("Stored session {}", record.id);
                        true
                    }
                    Err(e) => {
                        error!("Failed to store session {}: {}", record.id, e);
                        false
                    }
                }
            }
            None => {
                warn!(
                    "Only {} samples collected, {} needed; no result recorded",
                    session.samples.len(),
                    min_samples
                );
                false
            }
        };

        self.emit(SessionEvent::Completed(result));
        self.release_peripheral().await;
        self.transition(SessionState::Idle);

        SessionOutcome::Completed { session, persisted }
    }
}
