//! BLE Scanner Module
//!
//! Single-target advertisement matching. Backends feed their advertisement
//! stream through [`first_match`]; the first exact name match ends the scan.

use futures::{Stream, StreamExt};
use tracing::{debug, info};

/// One advertisement as seen by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Backend-specific peripheral id (MAC address or platform handle)
    pub id: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// Exact advertised-name filter
#[derive(Debug, Clone)]
pub struct AdvertisementFilter {
    name: String,
}

impl AdvertisementFilter {
    pub fn exact(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names must match byte for byte; no prefix or case folding.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.local_name.as_deref() == Some(self.name.as_str())
    }
}

/// Consume `stream` until an advertisement matches `filter`.
///
/// Returns `None` if the stream ends first. `advertisement_of` lets
/// backends carry their own peripheral handle alongside each advertisement.
pub async fn first_match<S, T, F>(stream: S, filter: &AdvertisementFilter, advertisement_of: F) -> Option<T>
where
    S: Stream<Item = T>,
    F: Fn(&T) -> &Advertisement,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let advertisement = advertisement_of(&item);
        if filter.matches(advertisement) {
            info!(
                "Found {} ({}, rssi {:?})",
                filter.name(),
                advertisement.id,
                advertisement.rssi
            );
            return Some(item);
        }
        debug!("Ignoring advertisement from {} ({:?})", advertisement.id, advertisement.local_name);
    }
    None
}
