/// Connection lifecycle for the single monitored peripheral
use std::sync::Arc;

use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bluetooth::error::BleError;
use crate::bluetooth::radio::{DisconnectStream, Radio};
use crate::models::{ConnectionState, PeripheralHandle};
use crate::session::aggregator::{lock_samples, SharedAggregator};

/// Owns the one connection slot
///
/// Connection state is published on a watch channel so a running session can
/// react to a dropped link. The slot only ever holds one peripheral; a second
/// connect is rejected until the first one is released.
pub struct ConnectionManager<R: Radio> {
    radio: Arc<R>,
    state: Arc<watch::Sender<ConnectionState>>,
    peripheral: Option<PeripheralHandle>,
    samples: SharedAggregator,
    watcher: Option<JoinHandle<()>>,
}

impl<R: Radio> ConnectionManager<R> {
    pub fn new(radio: Arc<R>, samples: SharedAggregator) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            radio,
            state: Arc::new(state),
            peripheral: None,
            samples,
            watcher: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition, including unexpected disconnects
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connected_peripheral(&self) -> Option<&PeripheralHandle> {
        match self.state() {
            ConnectionState::Connected => self.peripheral.as_ref(),
            _ => None,
        }
    }

    pub async fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), BleError> {
        if self.state() != ConnectionState::Disconnected {
            let current = self
                .peripheral
                .as_ref()
                .map(|p| p.display_name().to_string())
                .unwrap_or_default();
            warn!(
                "Refusing to connect to {} while {} holds the connection",
                peripheral.display_name(),
                current
            );
            return Err(BleError::Connect(format!(
                "already connected to {}",
                current
            )));
        }

        // Previous link dropped on its own; its watcher has already finished
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.peripheral = None;

        info!(
            "Connecting to {} ({})",
            peripheral.display_name(),
            peripheral.id
        );
        self.state.send_replace(ConnectionState::Connecting);

        let disconnects = match self.radio.connect(peripheral).await {
            Ok(disconnects) => disconnects,
            Err(e) => {
                error!(
                    "Failed to connect to {}: {}",
                    peripheral.display_name(),
                    e
                );
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.peripheral = Some(peripheral.clone());
        self.state.send_replace(ConnectionState::Connected);
        self.watcher = Some(tokio::spawn(watch_disconnect(
            disconnects,
            Arc::clone(&self.state),
            Arc::clone(&self.samples),
            peripheral.clone(),
        )));

        info!("Connected to {}", peripheral.display_name());
        Ok(())
    }

    pub async fn disconnect(&mut self, peripheral: &PeripheralHandle) -> Result<(), BleError> {
        let current = match self.connected_peripheral() {
            Some(current) if current.id == peripheral.id => current.clone(),
            _ => {
                return Err(BleError::Disconnect(format!(
                    "{} is not connected",
                    peripheral.display_name()
                )))
            }
        };

        // Stop watching first so our own disconnect is not reported as a drop
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        let result = self.radio.disconnect(&current).await;
        self.peripheral = None;
        self.state.send_replace(ConnectionState::Disconnected);

        match &result {
            Ok(()) => info!("Disconnected from {}", current.display_name()),
            Err(e) => error!(
                "Failed to disconnect from {}: {}",
                current.display_name(),
                e
            ),
        }
        result
    }
}

impl<R: Radio> Drop for ConnectionManager<R> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

async fn watch_disconnect(
    mut disconnects: DisconnectStream,
    state: Arc<watch::Sender<ConnectionState>>,
    samples: SharedAggregator,
    peripheral: PeripheralHandle,
) {
    match disconnects.next().await {
        Some(()) => warn!("{} disconnected unexpectedly", peripheral.display_name()),
        None => warn!(
            "Lost connection events for {}, treating it as disconnected",
            peripheral.display_name()
        ),
    }

    // Publish first so the session stops accepting payloads, then drop partial data
    state.send_replace(ConnectionState::Disconnected);
    lock_samples(&samples).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::fake::{peripheral, FakeRadio};
    use crate::models::MeasurementSample;
    use crate::session::aggregator::{SampleAggregator, DEFAULT_MIN_SAMPLES};
    use std::sync::atomic::Ordering;

    fn manager(radio: &Arc<FakeRadio>) -> (ConnectionManager<FakeRadio>, SharedAggregator) {
        let samples = SampleAggregator::shared(DEFAULT_MIN_SAMPLES);
        let manager = ConnectionManager::new(Arc::clone(radio), Arc::clone(&samples));
        (manager, samples)
    }

    #[tokio::test]
    async fn rejects_second_connection() {
        let (radio, _link) = FakeRadio::new();
        let (mut manager, _) = manager(&radio);
        let first = peripheral("AA:BB:CC:DD:EE:01");
        let second = peripheral("AA:BB:CC:DD:EE:02");

        manager.connect(&first).await.expect("first connect");
        let err = manager.connect(&second).await.unwrap_err();

        assert!(matches!(err, BleError::Connect(_)));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.connected_peripheral(), Some(&first));
        assert_eq!(radio.count("connect"), 1);
    }

    #[tokio::test]
    async fn failed_connect_leaves_slot_free() {
        let (radio, _link) = FakeRadio::new();
        radio.fail_connect.store(true, Ordering::SeqCst);
        let (mut manager, _) = manager(&radio);

        let err = manager
            .connect(&peripheral("AA:BB:CC:DD:EE:01"))
            .await
            .unwrap_err();

        assert!(matches!(err, BleError::Connect(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.connected_peripheral(), None);
    }

    #[tokio::test]
    async fn unexpected_disconnect_clears_samples() {
        let (radio, link) = FakeRadio::new();
        let (mut manager, samples) = manager(&radio);
        let device = peripheral("AA:BB:CC:DD:EE:01");

        manager.connect(&device).await.expect("connect");
        let mut state = manager.watch();
        lock_samples(&samples).append(MeasurementSample {
            spo2: 97,
            pulse: 62,
            perfusion_index: 2.1,
        });

        link.disconnects.send(()).unwrap();
        state.changed().await.expect("state change");

        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert_eq!(manager.connected_peripheral(), None);
        tokio::task::yield_now().await;
        assert!(lock_samples(&samples).is_empty());

        // The slot is free again after the drop
        assert!(manager.disconnect(&device).await.is_err());
        assert_eq!(radio.count("disconnect"), 0);
    }

    #[tokio::test]
    async fn explicit_disconnect_is_not_reported_as_drop() {
        let (radio, link) = FakeRadio::new();
        let (mut manager, samples) = manager(&radio);
        let device = peripheral("AA:BB:CC:DD:EE:01");

        manager.connect(&device).await.expect("connect");
        lock_samples(&samples).append(MeasurementSample {
            spo2: 98,
            pulse: 70,
            perfusion_index: 3.0,
        });

        manager.disconnect(&device).await.expect("disconnect");
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // A late radio event must not touch the finished session's samples
        let _ = link.disconnects.send(());
        tokio::task::yield_now().await;
        assert_eq!(lock_samples(&samples).len(), 1);

        let again = manager.disconnect(&device).await;
        assert!(matches!(again, Err(BleError::Disconnect(_))));
        assert_eq!(radio.count("disconnect"), 1);
    }
}
