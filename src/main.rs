use bracelet_bridge::domain::settings::SettingsService;
use bracelet_bridge::infrastructure::bluetooth::BtleplugLink;
use bracelet_bridge::infrastructure::cloud::MqttLink;
use bracelet_bridge::infrastructure::logging;
use bracelet_bridge::{Bridge, BridgeError, Capabilities};
use futures::StreamExt;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _log_guard = logging::init_logger(&settings.log_settings)?;
    info!("Starting Bracelet Bridge");
    info!("Settings loaded from {}", settings_service.path().display());

    let credentials = settings.credentials()?;

    // Opening the adapter doubles as the Bluetooth permission probe
    let device_link = match BtleplugLink::new().await {
        Ok(link) => link,
        Err(e) => {
            error!("Bluetooth unavailable: {}", e);
            for suggestion in e.recovery_suggestions() {
                warn!("  - {}", suggestion);
            }
            return Err(e.into());
        }
    };

    let bridge = Bridge::new(credentials, settings.bridge_config(), device_link, MqttLink::new());
    bridge.confirm_capabilities(Capabilities::granted());
    bridge.start()?;

    let mut updates = bridge.status_updates();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            status = updates.next() => match status {
                Some(status) => {
                    info!("Status: device {:?}, cloud {:?}", status.device, status.cloud);
                    if let Some(fault) = &status.fault {
                        error!("Terminal fault: {:?}", fault);
                    }
                }
                None => break,
            },
        }
    }

    let stats = bridge.stats();
    info!(
        "Frames {} (malformed {}), published {}, dropped {}, commands sent {}",
        stats.device.frames,
        stats.device.malformed_frames,
        stats.relay.published,
        stats.relay.dropped,
        stats.device.commands_sent
    );

    if let Err(e) = bridge.stop().await {
        error!("Shutdown incomplete: {}", e);
        if let BridgeError::Shutdown { component, .. } = &e {
            warn!("{} was aborted", component);
        }
    }
    info!("Bracelet Bridge stopped");
    Ok(())
}
