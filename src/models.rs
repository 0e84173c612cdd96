use time::OffsetDateTime;
use uuid::Uuid;

/// Raw notification payload as delivered by the radio layer
pub type RawNotification = Vec<u8>;

/// A peripheral reported by a discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    /// Name to show in logs, falling back to the device id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementSample {
    pub spo2: u8,
    pub pulse: u8,
    pub perfusion_index: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AverageResult {
    pub spo2: f64,
    pub pulse: f64,
    pub perfusion_index: f64,
}

#[derive(Debug, Clone)]
pub struct MonitoringSession {
    pub peripheral: PeripheralHandle,
    pub samples: Vec<MeasurementSample>,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub result: Option<AverageResult>,
}

impl MonitoringSession {
    pub fn new(peripheral: PeripheralHandle) -> Self {
        MonitoringSession {
            peripheral,
            samples: Vec::new(),
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            result: None,
        }
    }
}

/// Row written to the persistence collaborator for a valid session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_email: String,
    pub spo2: f64,
    pub pulse: f64,
    pub perfusion_index: f64,
    pub timestamp_millis: i64,
}
