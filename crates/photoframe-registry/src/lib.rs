//! Device to bucket routing.
//!
//! Devices are known by MAC address. A MAC maps to a bucket either from the
//! configured roster or from a later [`DeviceRegistry::register`] call, and
//! never expires. Clients that fetch chunks without a `mac` parameter are
//! identified by source address instead; those addresses are bound to a MAC
//! when the device announces itself on the registration socket, and the
//! binding is dropped again once the address goes idle.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::IpAddr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use photoframe_types::{
    config::{DeviceConfig, LibraryConfig},
    device::{ClientKey, MacAddress},
    PhotoframeError, Result,
};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub mac: MacAddress,
    pub name: Option<String>,
    pub bucket: Option<String>,
    pub last_registered: Option<DateTime<Utc>>,
    pub last_address: Option<IpAddr>,
}

impl DeviceRecord {
    fn unknown(mac: MacAddress) -> Self {
        Self {
            mac,
            name: None,
            bucket: None,
            last_registered: None,
            last_address: None,
        }
    }
}

/// Outcome of a device announcing itself from `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub mac: MacAddress,
    pub address: IpAddr,
    pub bucket: String,
    pub name: Option<String>,
    /// Whether the MAC had a bucket assigned; unknown devices get the default.
    pub known: bool,
}

#[derive(Debug, Clone, Copy)]
struct AddressBinding {
    mac: MacAddress,
    bound_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<MacAddress, DeviceRecord>,
    addresses: HashMap<IpAddr, AddressBinding>,
}

pub struct DeviceRegistry {
    default_bucket: String,
    buckets: BTreeSet<String>,
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new(
        default_bucket: impl Into<String>,
        buckets: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            default_bucket: default_bucket.into(),
            buckets: buckets.into_iter().collect(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registry seeded with the configured roster.
    pub fn from_config(library: &LibraryConfig, devices: &[DeviceConfig]) -> Result<Self> {
        let registry = Self::new(
            library.default_bucket.clone(),
            library.buckets.keys().cloned(),
        );
        for device in devices {
            registry.register(device.mac, &device.bucket)?;
            if let Some(name) = &device.name {
                registry.name_device(device.mac, name)?;
            }
        }
        Ok(registry)
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// Assign `mac` to `bucket`, replacing any earlier assignment.
    pub fn register(&self, mac: MacAddress, bucket: &str) -> Result<()> {
        if !self.buckets.contains(bucket) {
            return Err(PhotoframeError::Registry(format!(
                "cannot assign {mac} to unknown bucket {bucket:?}"
            )));
        }
        let mut state = self.lock()?;
        let record = state
            .devices
            .entry(mac)
            .or_insert_with(|| DeviceRecord::unknown(mac));
        record.bucket = Some(bucket.to_string());
        debug!("Device {} assigned to {}", mac, bucket);
        Ok(())
    }

    pub fn name_device(&self, mac: MacAddress, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .devices
            .entry(mac)
            .or_insert_with(|| DeviceRecord::unknown(mac))
            .name = Some(name.to_string());
        Ok(())
    }

    /// Record that the device `mac` is reachable at `address`.
    pub fn bind_address(&self, address: IpAddr, mac: MacAddress) -> Result<Registration> {
        let mut state = self.lock()?;
        let record = state
            .devices
            .entry(mac)
            .or_insert_with(|| DeviceRecord::unknown(mac));
        record.last_registered = Some(Utc::now());
        record.last_address = Some(address);
        let registration = Registration {
            mac,
            address,
            bucket: record
                .bucket
                .clone()
                .unwrap_or_else(|| self.default_bucket.clone()),
            name: record.name.clone(),
            known: record.bucket.is_some(),
        };
        state.addresses.insert(
            address,
            AddressBinding {
                mac,
                bound_at: Instant::now(),
            },
        );
        Ok(registration)
    }

    /// Bucket a chunk request from `key` should be served from.
    pub fn resolve(&self, key: &ClientKey) -> Result<String> {
        let state = self.lock()?;
        let mac = match key {
            ClientKey::Device(mac) => Some(*mac),
            ClientKey::Address(ip) => state.addresses.get(ip).map(|binding| binding.mac),
        };
        Ok(mac
            .and_then(|mac| state.devices.get(&mac))
            .and_then(|record| record.bucket.clone())
            .unwrap_or_else(|| self.default_bucket.clone()))
    }

    /// Drop the bindings of addresses whose sessions just expired.
    pub fn unbind_addresses(&self, addresses: &[IpAddr]) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.addresses.len();
        for address in addresses {
            state.addresses.remove(address);
        }
        Ok(before - state.addresses.len())
    }

    /// Drop bindings older than `timeout` that no live session is using.
    pub fn sweep_orphans(
        &self,
        now: Instant,
        timeout: Duration,
        active: &HashSet<IpAddr>,
    ) -> Result<Vec<IpAddr>> {
        let mut state = self.lock()?;
        let stale: Vec<IpAddr> = state
            .addresses
            .iter()
            .filter(|(ip, binding)| {
                !active.contains(*ip) && now.saturating_duration_since(binding.bound_at) > timeout
            })
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &stale {
            if let Some(binding) = state.addresses.remove(ip) {
                info!("Forgetting idle address {} (device {})", ip, binding.mac);
            }
        }
        Ok(stale)
    }

    pub fn address_count(&self) -> usize {
        self.lock().map(|state| state.addresses.len()).unwrap_or(0)
    }

    /// Known devices ordered by MAC.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut records: Vec<DeviceRecord> = state.devices.values().cloned().collect();
        records.sort_by_key(|record| record.mac);
        records
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| PhotoframeError::Registry("failed to lock device registry".into()))
    }
}
