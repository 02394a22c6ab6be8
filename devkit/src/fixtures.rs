/*!
Ready-made devices and configuration for tests.
*/

use pinger_kernel::config::PingerConfig;
use pinger_kernel::models::{Device, DeviceKind, SnmpCredentials, SnmpVersion};

pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("device {id}"),
        kind: DeviceKind::Equipment,
        address: "192.0.2.1".to_string(),
        snmp: None,
        is_mikrotik: false,
    }
}

pub fn tower(id: &str) -> Device {
    Device { kind: DeviceKind::Tower, name: format!("tower {id}"), ..device(id) }
}

pub fn snmp_device(id: &str) -> Device {
    Device {
        snmp: Some(SnmpCredentials {
            community: "public".to_string(),
            version: SnmpVersion::V2c,
            port: 161,
            interface_index: Some(1),
        }),
        is_mikrotik: true,
        ..device(id)
    }
}

/// Devices with ids `"1"` ..= `"n"`.
pub fn devices(n: usize) -> Vec<Device> {
    (1..=n).map(|i| device(&i.to_string())).collect()
}

/// Defaults, with a short shutdown grace so shutdown tests stay fast.
pub fn test_config() -> PingerConfig {
    let mut cfg = PingerConfig::default();
    cfg.supervisor.shutdown_grace_secs = 1;
    cfg
}
