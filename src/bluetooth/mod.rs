pub mod connection;
pub mod error;
#[cfg(test)]
pub mod fake;
pub mod frame;
pub mod notifications;
pub mod radio;
pub mod scanner;

use uuid::Uuid;

pub use connection::ConnectionManager;
pub use error::BleError;
pub use notifications::{NotificationChannel, Subscription};
pub use radio::{BluerRadio, Radio};
pub use scanner::ScanWindow;

// Oximeter GATT identifiers (Nordic UART service layout)
pub const OXIMETER_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const OXIMETER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
