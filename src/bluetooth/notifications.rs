/// Measurement characteristic subscription
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info};
use uuid::Uuid;

use crate::bluetooth::error::BleError;
use crate::bluetooth::frame::parse_frame;
use crate::bluetooth::radio::{PayloadStream, Radio};
use crate::models::{MeasurementSample, PeripheralHandle};

/// An open notification stream, held for one monitoring session
///
/// Not cloneable: handing it to [`NotificationChannel::unsubscribe`] or
/// [`Subscription::release`] tears it down exactly once.
pub struct Subscription {
    peripheral: PeripheralHandle,
    service: Uuid,
    characteristic: Uuid,
    payloads: PayloadStream,
}

impl Subscription {
    /// Wait for the next payload and decode it
    ///
    /// Returns None once the radio closes the stream, and Some(None) for a
    /// payload that carries no measurement frame.
    pub async fn next_frame(&mut self) -> Option<Option<MeasurementSample>> {
        let payload = self.payloads.next().await?;
        Some(parse_frame(&payload))
    }

    /// Drop the stream without asking the radio, for links that are already gone
    pub fn release(self) {
        debug!(
            "Released notification stream for {} without unsubscribing",
            self.peripheral.display_name()
        );
    }
}

pub struct NotificationChannel<R: Radio> {
    radio: Arc<R>,
}

impl<R: Radio> NotificationChannel<R> {
    pub fn new(radio: Arc<R>) -> Self {
        NotificationChannel { radio }
    }

    pub async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Subscription, BleError> {
        let payloads = self
            .radio
            .subscribe(peripheral, service, characteristic)
            .await?;
        info!(
            "Subscribed to measurements from {}",
            peripheral.display_name()
        );

        Ok(Subscription {
            peripheral: peripheral.clone(),
            service,
            characteristic,
            payloads,
        })
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BleError> {
        let Subscription {
            peripheral,
            service,
            characteristic,
            payloads,
        } = subscription;

        drop(payloads);
        self.radio
            .unsubscribe(&peripheral, service, characteristic)
            .await?;
        info!(
            "Unsubscribed from measurements of {}",
            peripheral.display_name()
        );
        Ok(())
    }
}
