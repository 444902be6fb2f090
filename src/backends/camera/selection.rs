// SPDX-License-Identifier: GPL-3.0-only

//! Device selection
//!
//! Devices are remembered by position rather than by id where that is stable
//! (built-in front/back cameras), and by id for external devices, so a
//! persisted choice survives a replugged webcam getting a new node.

use super::types::{Device, DevicePosition};
use serde::{Deserialize, Serialize};

/// Persistable description of the wanted device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    pub position: Option<DevicePosition>,
    pub id: Option<String>,
}

impl DeviceParams {
    /// Params that select `device` again later
    pub fn for_device(device: &Device) -> Self {
        let id = match device.position {
            DevicePosition::Front | DevicePosition::Back => None,
            DevicePosition::External => Some(device.id.clone()),
        };
        Self {
            position: Some(device.position),
            id,
        }
    }

    fn matches(&self, device: &Device) -> bool {
        *self == Self::for_device(device)
    }
}

/// Pick the device for `params`: exact id match first, then the last device
/// at the requested position, then the first device.
pub fn best_device<'a>(devices: &'a [Device], params: &DeviceParams) -> Option<&'a Device> {
    let mut position_match = None;
    for device in devices {
        if params.id.as_deref() == Some(device.id.as_str()) {
            return Some(device);
        }
        if params.position == Some(device.position) {
            position_match = Some(device);
        }
    }
    position_match.or_else(|| devices.first())
}

/// Device after the one `params` selects, wrapping around
pub fn next_device<'a>(devices: &'a [Device], params: &DeviceParams) -> Option<&'a Device> {
    let current = devices
        .iter()
        .position(|d| params.matches(d))
        .or_else(|| {
            devices
                .iter()
                .position(|d| params.position == Some(d.position))
        });
    match current {
        Some(index) => devices.get((index + 1) % devices.len()),
        None => devices.first(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::VideoOrientation;

    fn device(id: &str, position: DevicePosition) -> Device {
        Device {
            id: id.to_string(),
            name: id.to_string(),
            position,
            native_orientation: VideoOrientation::Portrait,
            dimensions: None,
        }
    }

    fn devices() -> Vec<Device> {
        vec![
            device("back", DevicePosition::Back),
            device("front", DevicePosition::Front),
            device("usb-a", DevicePosition::External),
            device("usb-b", DevicePosition::External),
        ]
    }

    #[test]
    fn test_exact_id_wins() {
        let devices = devices();
        let params = DeviceParams {
            position: Some(DevicePosition::Front),
            id: Some("usb-a".to_string()),
        };
        assert_eq!(best_device(&devices, &params).unwrap().id, "usb-a");
    }

    #[test]
    fn test_last_position_match_then_first() {
        let devices = devices();
        let external = DeviceParams {
            position: Some(DevicePosition::External),
            id: Some("gone".to_string()),
        };
        assert_eq!(best_device(&devices, &external).unwrap().id, "usb-b");
        assert_eq!(
            best_device(&devices, &DeviceParams::default()).unwrap().id,
            "back"
        );
        assert!(best_device(&[], &DeviceParams::default()).is_none());
    }

    #[test]
    fn test_params_for_builtin_drop_id() {
        let params = DeviceParams::for_device(&device("front", DevicePosition::Front));
        assert_eq!(params.id, None);
        let params = DeviceParams::for_device(&device("usb-a", DevicePosition::External));
        assert_eq!(params.id.as_deref(), Some("usb-a"));
    }

    #[test]
    fn test_next_device_cycles() {
        let devices = devices();
        let params = DeviceParams::for_device(&devices[3]);
        assert_eq!(next_device(&devices, &params).unwrap().id, "back");
        let params = DeviceParams::for_device(&devices[0]);
        assert_eq!(next_device(&devices, &params).unwrap().id, "front");
        assert_eq!(
            next_device(&devices, &DeviceParams::default()).unwrap().id,
            "back"
        );
    }
}
