//! Bracelet Protocol
//!
//! GATT identifiers and the frame codec for the vibration bracelet.
//! Pure and stateless: nothing in here touches a link.

use crate::domain::models::Reading;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

/// Advertised local name of the bracelet ("vibration bracelet for tremor therapy")
pub const DEVICE_NAME: &str = "振动手环治疗震颤";

/// Bracelet GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xAE25A5C4_4601_143C_12BB_8BC45A18749C);

/// Telemetry characteristic (notify) - one frame per notification
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0xAE25A5C6_4601_143C_12BB_8BC45A18749C);

/// Control characteristic (write) - vibration parameters from the cloud
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0xAE25A5C5_4601_143C_12BB_8BC45A18749C);

/// Width of one telemetry frame in bytes
pub const FRAME_LEN: usize = 3;

/// Largest control write: default ATT MTU (23) minus the 3-byte write header
pub const MAX_COMMAND_LEN: usize = 20;

/// Linear byte-to-unit mapping applied to every axis.
///
/// The bracelet firmware documents no physical unit yet, so the default is
/// the identity mapping (raw signed device units).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisMapping {
    pub scale: f32,
    pub offset: f32,
}

impl AxisMapping {
    pub const RAW: AxisMapping = AxisMapping { scale: 1.0, offset: 0.0 };

    pub fn apply(&self, raw: u8) -> f32 {
        (raw as i8) as f32 * self.scale + self.offset
    }
}

impl Default for AxisMapping {
    fn default() -> Self {
        Self::RAW
    }
}

/// Decode one telemetry frame.
///
/// # Frame Structure (3 bytes)
///
/// ```text
/// [0] : X axis (i8, device units)
/// [1] : Y axis (i8, device units)
/// [2] : Z axis (i8, device units)
/// ```
pub fn decode_frame(frame: &[u8], sequence: u64, mapping: &AxisMapping) -> Result<Reading> {
    if frame.len() != FRAME_LEN {
        return Err(BridgeError::MalformedFrame {
            expected: FRAME_LEN,
            actual: frame.len(),
        });
    }

    trace!("Raw frame: {:02X?}", frame);

    Ok(Reading {
        sequence,
        x: mapping.apply(frame[0]),
        y: mapping.apply(frame[1]),
        z: mapping.apply(frame[2]),
    })
}

/// Validate a control payload before it goes to the device.
///
/// Payloads are opaque; only their size is checked.
pub fn encode_command(payload: &[u8], max_len: usize) -> Result<&[u8]> {
    if payload.is_empty() || payload.len() > max_len {
        return Err(BridgeError::CommandTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    Ok(payload)
}
