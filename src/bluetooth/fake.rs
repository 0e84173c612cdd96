use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{stream, Stream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::bluetooth::error::BleError;
use crate::bluetooth::radio::{DisconnectStream, DiscoveryStream, PayloadStream, Radio};
use crate::models::{PeripheralHandle, RawNotification};

/// Scripted radio driven from tests through a [`FakeLink`]
pub struct FakeRadio {
    calls: Mutex<Vec<String>>,
    discoveries: Mutex<Option<UnboundedReceiver<PeripheralHandle>>>,
    payloads: Mutex<Option<UnboundedReceiver<RawNotification>>>,
    disconnects: Mutex<Option<UnboundedReceiver<()>>>,
    pub fail_init: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_subscribe: AtomicBool,
}

/// Test-side ends of the fake radio's event sources
pub struct FakeLink {
    pub discoveries: UnboundedSender<PeripheralHandle>,
    pub payloads: UnboundedSender<RawNotification>,
    pub disconnects: UnboundedSender<()>,
}

impl FakeRadio {
    pub fn new() -> (Arc<Self>, FakeLink) {
        let (discovery_tx, discovery_rx) = unbounded_channel();
        let (payload_tx, payload_rx) = unbounded_channel();
        let (disconnect_tx, disconnect_rx) = unbounded_channel();

        let radio = FakeRadio {
            calls: Mutex::new(Vec::new()),
            discoveries: Mutex::new(Some(discovery_rx)),
            payloads: Mutex::new(Some(payload_rx)),
            disconnects: Mutex::new(Some(disconnect_rx)),
            fail_init: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
        };
        let link = FakeLink {
            discoveries: discovery_tx,
            payloads: payload_tx,
            disconnects: disconnect_tx,
        };
        (Arc::new(radio), link)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls to `operation`
    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn channel_stream<T: Send + 'static>(
    rx: Option<UnboundedReceiver<T>>,
) -> Pin<Box<dyn Stream<Item = T> + Send>> {
    match rx {
        Some(rx) => Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })),
        // Later scans and connections on the same fake stay silent
        None => Box::pin(stream::pending()),
    }
}

pub fn peripheral(id: &str) -> PeripheralHandle {
    PeripheralHandle {
        id: id.to_string(),
        name: Some(format!("PC-60F {}", id)),
        rssi: Some(-60),
    }
}

/// Notification carrying one measurement frame behind a short header
pub fn frame(spo2: u8, pulse: u8, pi_raw: u8) -> RawNotification {
    vec![0xaa, 0x55, 0x0f, 0x08, 0x01, spo2, pulse, 0x00, pi_raw, 0x5c]
}

#[async_trait]
impl Radio for FakeRadio {
    async fn initialize(&self) -> Result<(), BleError> {
        self.record("initialize".to_string());
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(BleError::RadioInit("adapter missing".to_string()));
        }
        Ok(())
    }

    async fn start_scan(&self, service: Uuid) -> Result<DiscoveryStream, BleError> {
        self.record(format!("start_scan {}", service));
        let rx = self.discoveries.lock().unwrap().take();
        Ok(channel_stream(rx))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.record("stop_scan".to_string());
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<DisconnectStream, BleError> {
        self.record(format!("connect {}", peripheral.id));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BleError::Connect("peripheral out of range".to_string()));
        }
        let rx = self.disconnects.lock().unwrap().take();
        Ok(channel_stream(rx))
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), BleError> {
        self.record(format!("disconnect {}", peripheral.id));
        Ok(())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<PayloadStream, BleError> {
        self.record(format!("subscribe {}", peripheral.id));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BleError::Subscription(format!(
                "{} not found",
                characteristic
            )));
        }
        match self.payloads.lock().unwrap().take() {
            Some(rx) => Ok(channel_stream(Some(rx))),
            None => Err(BleError::Subscription(format!(
                "{} already subscribed",
                characteristic
            ))),
        }
    }

    async fn unsubscribe(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<(), BleError> {
        self.record(format!("unsubscribe {}", peripheral.id));
        Ok(())
    }
}
