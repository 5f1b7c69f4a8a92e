//! Per-device outstanding request counters.
//!
//! Used to route each outbound block request to the least busy device that
//! can serve it.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::DeviceId;

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    count: u32,
    /// Bumped by `reset`; guards taken before a reset leave the new count alone
    generation: u64,
}

/// Tracks how many requests are outstanding toward each device.
#[derive(Debug, Default)]
pub struct DeviceActivity {
    // Devices never seen count as zero
    act: Mutex<HashMap<DeviceId, Slot>>,
}

impl DeviceActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the candidate with the fewest outstanding requests.
    ///
    /// Ties are broken by the lowest device id. Returns `None` when there are
    /// no candidates.
    pub fn least_busy<'a, I>(&self, candidates: I) -> Option<DeviceId>
    where
        I: IntoIterator<Item = &'a DeviceId>,
    {
        let act = self.act.lock();
        candidates
            .into_iter()
            .map(|device| (act.get(device).map_or(0, |s| s.count), *device))
            .min()
            .map(|(_, device)| device)
    }

    pub fn using(&self, device: DeviceId) {
        self.act.lock().entry(device).or_default().count += 1;
    }

    pub fn done(&self, device: DeviceId) {
        let mut act = self.act.lock();
        let slot = act.entry(device).or_default();
        if slot.count == 0 {
            tracing::debug!(device = %device.short(), "activity counter already zero");
        }
        slot.count = slot.count.saturating_sub(1);
    }

    /// Count one outstanding request until the returned guard is dropped.
    ///
    /// The decrement happens even if the request future is cancelled, and is
    /// skipped if the device was reset in the meantime.
    pub fn busy(&self, device: DeviceId) -> Busy<'_> {
        let mut act = self.act.lock();
        let slot = act.entry(device).or_default();
        slot.count += 1;
        Busy {
            activity: self,
            device,
            generation: slot.generation,
        }
    }

    /// Current outstanding count for a device
    pub fn get(&self, device: &DeviceId) -> u32 {
        self.act.lock().get(device).map_or(0, |s| s.count)
    }

    /// Forget a device's outstanding requests; its counter reads as zero
    /// afterwards.
    pub fn reset(&self, device: &DeviceId) {
        let mut act = self.act.lock();
        let slot = act.entry(*device).or_default();
        slot.count = 0;
        slot.generation += 1;
    }
}

/// One outstanding request toward a device, released on drop.
#[must_use = "the request is counted only while the guard is alive"]
pub struct Busy<'a> {
    activity: &'a DeviceActivity,
    device: DeviceId,
    generation: u64,
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        let mut act = self.activity.act.lock();
        if let Some(slot) = act.get_mut(&self.device) {
            if slot.generation == self.generation {
                slot.count = slot.count.saturating_sub(1);
            }
        }
    }
}
