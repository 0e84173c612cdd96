/// Time-boxed Bluetooth Low Energy discovery of oximeters
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::bluetooth::error::BleError;
use crate::bluetooth::radio::{DiscoveryStream, Radio};
use crate::models::PeripheralHandle;

/// No scan is running
const IDLE: u64 = 0;

/// Discovery that stops by itself after a fixed window
///
/// The scanning flag stores the id of the running scan, so a timer left over
/// from an earlier scan can only ever clear its own flag.
pub struct ScanWindow<R: Radio> {
    radio: Arc<R>,
    active_scan: Arc<AtomicU64>,
    last_scan: u64,
    results: Arc<Mutex<Vec<PeripheralHandle>>>,
    task: Option<JoinHandle<()>>,
}

impl<R: Radio> ScanWindow<R> {
    pub fn new(radio: Arc<R>) -> Self {
        ScanWindow {
            radio,
            active_scan: Arc::new(AtomicU64::new(IDLE)),
            last_scan: IDLE,
            results: Arc::new(Mutex::new(Vec::new())),
            task: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active_scan.load(Ordering::SeqCst) != IDLE
    }

    /// Every device reported by the current or last scan, duplicates included
    pub fn results(&self) -> Vec<PeripheralHandle> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Scan for peripherals advertising `service`
    ///
    /// A scan already in progress is stopped first. Discovered devices are
    /// delivered on the returned receiver, which closes when the window
    /// elapses or the scan is stopped.
    ///
    /// # Arguments
    /// * `service` - Service identifier the peripheral must advertise
    /// * `duration` - How long to scan before stopping automatically
    pub async fn start_scan(
        &mut self,
        service: Uuid,
        duration: Duration,
    ) -> Result<UnboundedReceiver<PeripheralHandle>, BleError> {
        if self.is_scanning() {
            info!("Restarting scan");
            if let Err(e) = self.stop_scan().await {
                warn!("Failed to stop previous scan: {}", e);
            }
        }

        self.radio.initialize().await?;
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let discoveries = self.radio.start_scan(service).await?;

        self.last_scan += 1;
        let scan_id = self.last_scan;
        self.active_scan.store(scan_id, Ordering::SeqCst);
        info!("Scanning for {} for {:?}", service, duration);

        let (tx, rx) = unbounded_channel();
        self.task = Some(tokio::spawn(run_scan_window(
            Arc::clone(&self.radio),
            discoveries,
            duration,
            scan_id,
            Arc::clone(&self.active_scan),
            Arc::clone(&self.results),
            tx,
        )));

        Ok(rx)
    }

    /// Stop the running scan; does nothing when no scan is active
    pub async fn stop_scan(&mut self) -> Result<(), BleError> {
        let was_scanning = self.active_scan.swap(IDLE, Ordering::SeqCst) != IDLE;

        // Aborting a window whose timer already fired is a no-op
        if let Some(task) = self.task.take() {
            task.abort();
        }

        if !was_scanning {
            return Ok(());
        }

        self.radio.stop_scan().await?;
        info!("Stopped scanning");
        Ok(())
    }
}

impl<R: Radio> Drop for ScanWindow<R> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_scan_window<R: Radio>(
    radio: Arc<R>,
    mut discoveries: DiscoveryStream,
    duration: Duration,
    scan_id: u64,
    active_scan: Arc<AtomicU64>,
    results: Arc<Mutex<Vec<PeripheralHandle>>>,
    found: UnboundedSender<PeripheralHandle>,
) {
    let deadline = sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("Scan window of {:?} elapsed", duration);
                break;
            }
            discovered = discoveries.next() => match discovered {
                Some(peripheral) => {
                    info!(
                        "Found {} ({}, rssi {:?})",
                        peripheral.display_name(),
                        peripheral.id,
                        peripheral.rssi
                    );
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(peripheral.clone());
                    let _ = found.send(peripheral);
                }
                None => {
                    debug!("Radio ended discovery before the window elapsed");
                    break;
                }
            }
        }
    }

    drop(discoveries);
    if let Err(e) = radio.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }

    if active_scan
        .compare_exchange(scan_id, IDLE, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        info!("Stopped scanning");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::fake::{peripheral, FakeRadio};
    use crate::bluetooth::OXIMETER_SERVICE_UUID;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn stops_after_window_without_devices() {
        let (radio, _link) = FakeRadio::new();
        let mut scanner = ScanWindow::new(Arc::clone(&radio));
        let started = Instant::now();

        let mut found = scanner
            .start_scan(OXIMETER_SERVICE_UUID, Duration::from_millis(3500))
            .await
            .expect("scan");
        assert!(scanner.is_scanning());

        assert_eq!(found.recv().await, None);
        assert!(!scanner.is_scanning());
        assert!(started.elapsed() >= Duration::from_millis(3500));
        assert!(scanner.results().is_empty());
        assert_eq!(radio.count("stop_scan"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_every_reported_device() {
        let (radio, link) = FakeRadio::new();
        let mut scanner = ScanWindow::new(Arc::clone(&radio));
        let first = peripheral("AA:BB:CC:DD:EE:01");
        let second = peripheral("AA:BB:CC:DD:EE:02");

        let mut found = scanner
            .start_scan(OXIMETER_SERVICE_UUID, Duration::from_millis(3500))
            .await
            .expect("scan");
        link.discoveries.send(first.clone()).unwrap();
        link.discoveries.send(first.clone()).unwrap();
        link.discoveries.send(second.clone()).unwrap();

        for _ in 0..3 {
            found.recv().await.expect("device");
        }
        assert_eq!(scanner.results(), vec![first.clone(), first, second]);

        scanner.stop_scan().await.expect("stop");
        assert!(!scanner.is_scanning());
        assert_eq!(found.recv().await, None);

        scanner.stop_scan().await.expect("second stop");
        assert_eq!(radio.count("stop_scan"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_window() {
        let (radio, _link) = FakeRadio::new();
        let mut scanner = ScanWindow::new(Arc::clone(&radio));

        let mut first = scanner
            .start_scan(OXIMETER_SERVICE_UUID, Duration::from_millis(3500))
            .await
            .expect("first scan");
        let mut second = scanner
            .start_scan(OXIMETER_SERVICE_UUID, Duration::from_secs(10))
            .await
            .expect("second scan");

        assert_eq!(first.recv().await, None);
        sleep(Duration::from_secs(5)).await;
        assert!(scanner.is_scanning());

        assert_eq!(second.recv().await, None);
        assert!(!scanner.is_scanning());
        assert_eq!(radio.count("start_scan"), 2);
    }

    #[tokio::test]
    async fn radio_init_failure_is_reported() {
        let (radio, _link) = FakeRadio::new();
        radio.fail_init.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut scanner = ScanWindow::new(Arc::clone(&radio));

        let result = scanner
            .start_scan(OXIMETER_SERVICE_UUID, Duration::from_millis(3500))
            .await;

        assert!(matches!(result, Err(BleError::RadioInit(_))));
        assert!(!scanner.is_scanning());
        assert_eq!(radio.count("start_scan"), 0);
    }
}
