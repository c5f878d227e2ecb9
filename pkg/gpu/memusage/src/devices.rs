// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::errors::{Error, Result};
use crate::probe::DeviceReading;

/// Opaque worker identity as handed out by the host scheduler
/// (typically its address, e.g. `tcp://10.0.0.5:40213`).
pub type WorkerId = String;

/// Which worker owns which device. Built once, before sampling starts.
#[derive(Debug, Default)]
pub struct DeviceMap {
    // (selector, worker) in declaration order.
    entries: Vec<(String, WorkerId)>,
    // Devices already reported as claimed by several workers.
    conflicts_logged: Mutex<HashSet<String>>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(worker, [device selectors])` pairs. A selector may be a
    /// GPU UUID, a PCI bus id, or a minor number. A device may belong to
    /// only one worker.
    pub fn from_workers<I, S>(workers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (WorkerId, Vec<S>)>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for (worker, devices) in workers {
            for device in devices {
                map.assign(device, worker.clone())?;
            }
        }
        Ok(map)
    }

    pub fn assign(&mut self, selector: impl Into<String>, worker: impl Into<WorkerId>) -> Result<()> {
        let selector = selector.into();
        let worker = worker.into();
        if let Some((_, owner)) = self.entries.iter().find(|(s, _)| *s == selector) {
            return Err(Error::Configuration(format!(
                "device {selector} is assigned to both {owner} and {worker}"
            )));
        }
        self.entries.push((selector, worker));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct workers, in first-declared order.
    pub fn workers(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|(_, w)| seen.insert(w.as_str()))
            .map(|(_, w)| w.as_str())
            .collect()
    }

    /// First declared owner of the device behind `reading`.
    pub fn owner_of(&self, reading: &DeviceReading) -> Option<&str> {
        self.owners_of(reading).into_iter().next()
    }

    /// Distinct workers with a selector matching `reading`, in declaration
    /// order. More than one means the same GPU was named two different ways.
    fn owners_of(&self, reading: &DeviceReading) -> Vec<&str> {
        let mut owners: Vec<&str> = Vec::new();
        for (selector, worker) in &self.entries {
            if reading.matches(selector) && !owners.contains(&worker.as_str()) {
                owners.push(worker.as_str());
            }
        }
        owners
    }

    /// Fold one probe's readings into one value per worker. Devices owned by
    /// the same worker are summed; unmapped devices are dropped. A device
    /// claimed by several workers counts for the first one only.
    pub fn resolve(&self, readings: &[DeviceReading]) -> BTreeMap<WorkerId, u64> {
        let mut per_worker = BTreeMap::new();
        for reading in readings {
            let owners = self.owners_of(reading);
            match owners.as_slice() {
                [] => debug!("device {} is not mapped to any worker", reading.device_id),
                [owner, others @ ..] => {
                    if !others.is_empty() {
                        self.log_conflict(reading, owner, &owners);
                    }
                    let total = per_worker.entry(owner.to_string()).or_insert(0u64);
                    *total = total.saturating_add(reading.used_memory_mb);
                }
            }
        }
        per_worker
    }

    fn log_conflict(&self, reading: &DeviceReading, owner: &str, owners: &[&str]) {
        let mut logged = self
            .conflicts_logged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if logged.insert(reading.device_id.clone()) {
            warn!(
                "device {} is assigned to workers {}, counting it for {owner} only",
                reading.device_id,
                owners.join(", ")
            );
        }
    }
}
