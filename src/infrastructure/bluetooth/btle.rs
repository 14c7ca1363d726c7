//! `btleplug` backend for [`DeviceLink`].

use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::link::{DeviceLink, GattProfile, LinkEvent, LinkEvents};
use crate::infrastructure::bluetooth::scanner::{self, Advertisement, AdvertisementFilter};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{future, stream, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn};

fn link_error(operation: &'static str) -> impl FnOnce(btleplug::Error) -> BridgeError {
    move |e| match e {
        btleplug::Error::PermissionDenied => BridgeError::unavailable("bluetooth", "permission denied"),
        other => BridgeError::link_failed_with_source(operation, other),
    }
}

pub struct BtleplugLink {
    adapter: Adapter,
    /// Last scan hit, consumed by `connect`
    candidate: Option<Peripheral>,
    peripheral: Option<Peripheral>,
    notify: Option<Characteristic>,
    control: Option<Characteristic>,
}

impl BtleplugLink {
    /// Open the first Bluetooth adapter.
    ///
    /// Fails with `LinkUnavailable` when the host exposes none, which the
    /// host binary treats as a missing Bluetooth capability.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(link_error("bluetooth manager"))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(link_error("list adapters"))?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::unavailable("bluetooth", "no adapter found"))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        Ok(Self {
            adapter,
            candidate: None,
            peripheral: None,
            notify: None,
            control: None,
        })
    }

    fn connected(&self) -> Result<&Peripheral> {
        self.peripheral
            .as_ref()
            .ok_or_else(|| BridgeError::link_failed("not connected"))
    }
}

async fn advertisement(adapter: &Adapter, event: CentralEvent) -> Option<(Advertisement, Peripheral)> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };
    let peripheral = adapter.peripheral(&id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let advertisement = Advertisement {
        id: format!("{:?}", id),
        local_name: properties.local_name,
        rssi: properties.rssi,
    };
    Some((advertisement, peripheral))
}

#[async_trait::async_trait]
impl DeviceLink for BtleplugLink {
    async fn scan(&mut self, name: &str, window: Duration) -> Result<Advertisement> {
        let filter = AdvertisementFilter::exact(name);
        let events = self.adapter.events().await.map_err(link_error("adapter events"))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(link_error("start scan"))?;

        let adapter = self.adapter.clone();
        let hits = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move { advertisement(&adapter, event).await }
        });
        let found = tokio::time::timeout(window, scanner::first_match(hits, &filter, |(a, _)| a)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        match found {
            Ok(Some((advertisement, peripheral))) => {
                self.candidate = Some(peripheral);
                Ok(advertisement)
            }
            Ok(None) => Err(BridgeError::link_failed("adapter event stream ended")),
            Err(_) => Err(BridgeError::timeout("scan", window)),
        }
    }

    async fn connect(&mut self, device: &Advertisement) -> Result<()> {
        let peripheral = self
            .candidate
            .take()
            .ok_or_else(|| BridgeError::link_failed(format!("{} was not found by the last scan", device.id)))?;
        // Remembered before connecting so a dropped or timed out attempt is
        // still released by `disconnect`
        self.peripheral = Some(peripheral.clone());
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(link_error("connect"))?;
        }
        Ok(())
    }

    async fn discover(&mut self, profile: &GattProfile) -> Result<()> {
        let peripheral = self.connected()?;
        peripheral
            .discover_services()
            .await
            .map_err(link_error("service discovery"))?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == profile.service)
            .ok_or_else(|| BridgeError::incompatible(format!("service {} not found", profile.service)))?;
        let find = |uuid| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BridgeError::incompatible(format!("characteristic {} not found", uuid)))
        };
        let notify = find(profile.notify)?;
        let control = find(profile.control)?;
        debug!("Resolved notify {} and control {}", notify.uuid, control.uuid);

        self.notify = Some(notify);
        self.control = Some(control);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<LinkEvents> {
        let peripheral = self.connected()?.clone();
        let notify = self
            .notify
            .clone()
            .ok_or_else(|| BridgeError::link_failed("notify characteristic not resolved"))?;

        // Listen for disconnects before enabling notifications so none is missed
        let central = self.adapter.events().await.map_err(link_error("adapter events"))?;
        peripheral.subscribe(&notify).await.map_err(link_error("subscribe"))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(link_error("notification stream"))?;

        let uuid = notify.uuid;
        let frames = notifications
            .filter(move |n| future::ready(n.uuid == uuid))
            .map(|n| LinkEvent::Notification(n.value))
            .chain(stream::once(future::ready(LinkEvent::Disconnected)));

        let id = peripheral.id();
        let drops = central
            .filter(move |event| {
                future::ready(matches!(event, CentralEvent::DeviceDisconnected(gone) if *gone == id))
            })
            .map(|_| LinkEvent::Disconnected);

        Ok(Box::pin(stream::select(frames, drops)))
    }

    async fn write_control(&mut self, payload: &[u8]) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| BridgeError::link_failed("control characteristic not resolved"))?;
        self.connected()?
            .write(control, payload, WriteType::WithResponse)
            .await
            .map_err(link_error("control write"))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.notify = None;
        self.control = None;
        self.candidate = None;
        let Some(peripheral) = self.peripheral.take() else {
            return Ok(());
        };
        // Also cancels a connection the OS is still establishing
        peripheral.disconnect().await.map_err(link_error("disconnect"))
    }
}
