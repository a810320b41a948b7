//! The table of discovered access points.
//!
//! Only the radio writes to the table, but the host may read any slot at any time, so every
//! slot has its own [Spinlock]. A busy slot is never waited on. Updates are dropped instead,
//! since the next beacon from the same AP will bring the same information anyway.

use portable_atomic::{AtomicU32, Ordering};

use crate::{
    config::check_channel,
    frame::{BeaconInfo, HostAdvertisement, MacAddress, SecurityInfo, Ssid},
    sync::{Processor, Spinlock},
};

/// Number of slots in the table.
pub const AP_TABLE_SIZE: usize = 32;

/// Number of table ticks without a beacon, after which an AP is considered gone.
///
/// The table is ticked on every channel switch, so radios which switch channels faster need
/// a larger timeout.
#[cfg(not(fast_scan))]
pub const TIMEOUT: u32 = 40;
#[cfg(fast_scan)]
pub const TIMEOUT: u32 = 40 * 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TableError {
    /// The other processor is holding the lock.
    Busy,
    /// There is no active entry there.
    NotFound,
}
pub type TableResult<T> = Result<T, TableError>;

/// The last few RSSI samples of an AP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RssiHistory {
    samples: [u8; Self::LENGTH],
    next: u8,
    count: u8,
}
impl RssiHistory {
    const LENGTH: usize = 8;

    pub fn push(&mut self, rssi: u8) {
        self.samples[self.next as usize] = rssi;
        self.next = (self.next + 1) % Self::LENGTH as u8;
        self.count = (self.count + 1).min(Self::LENGTH as u8);
    }
    pub fn latest(&self) -> Option<u8> {
        (self.count != 0).then(|| {
            self.samples[(self.next as usize + Self::LENGTH - 1) % Self::LENGTH]
        })
    }
    /// Mean of the recorded samples.
    pub fn average(&self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let sum: u32 = self.samples[..self.count as usize]
            .iter()
            .map(|rssi| *rssi as u32)
            .sum();
        Some((sum / self.count as u32) as u8)
    }
}

/// Everything known about one AP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessPointRecord {
    pub bssid: MacAddress,
    /// Address of the last station, that sent a beacon for this BSS.
    pub transmitter: MacAddress,
    pub ssid: Option<Ssid>,
    pub channel: u8,
    pub security: SecurityInfo,
    /// The AP only requires rates, that the radio supports.
    pub compatible: bool,
    pub rssi: RssiHistory,
    /// Table ticks since the last beacon.
    pub age: u32,
    pub beacon_interval: u16,
    /// Present if the AP is a local multiplayer host.
    pub host_advertisement: Option<HostAdvertisement>,
}
impl AccessPointRecord {
    pub fn is_local_host(&self) -> bool {
        self.host_advertisement.is_some()
    }
}

/// A beacon or probe response as seen by the radio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BeaconObservation {
    pub bssid: MacAddress,
    pub transmitter: MacAddress,
    pub ssid: Option<Ssid>,
    pub channel: u8,
    /// [None], if the frame was received on a different channel than the AP operates on.
    pub rssi: Option<u8>,
    pub security: SecurityInfo,
    pub compatible: bool,
    pub beacon_interval: u16,
    pub host_advertisement: Option<HostAdvertisement>,
}
impl BeaconObservation {
    /// Combine a parsed beacon with the reception parameters.
    ///
    /// Beacons from adjacent channels bleed over, so their RSSI isn't comparable and is
    /// discarded. Returns [None] for APs on a channel we can't tune to.
    pub fn new(info: &BeaconInfo, rssi: u8, tuned_channel: u8) -> Option<Self> {
        let channel = check_channel(info.channel.unwrap_or(tuned_channel)).ok()?;
        Some(Self {
            bssid: info.bssid,
            transmitter: info.transmitter,
            ssid: info.ssid,
            channel,
            rssi: (channel == tuned_channel).then_some(rssi),
            security: info.security,
            compatible: info.compatible,
            beacon_interval: info.beacon_interval,
            host_advertisement: info.host_advertisement,
        })
    }
}

/// One entry of a wishlist passed to [AccessPointTable::find_matching].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApMatcher {
    /// An all zero BSSID matches any BSSID.
    pub bssid: MacAddress,
    pub ssid: Option<Ssid>,
}
impl ApMatcher {
    pub const fn by_bssid(bssid: MacAddress) -> Self {
        Self { bssid, ssid: None }
    }
    pub const fn by_ssid(ssid: Ssid) -> Self {
        Self {
            bssid: MacAddress::ZERO,
            ssid: Some(ssid),
        }
    }
    pub fn matches(&self, record: &AccessPointRecord) -> bool {
        if !self.bssid.is_zero() {
            return record.bssid == self.bssid;
        }
        match (self.ssid, record.ssid) {
            (Some(wanted), Some(advertised)) => !wanted.is_empty() && wanted == advertised,
            _ => false,
        }
    }
}

/// A successful lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApMatch {
    /// Index into the wishlist.
    pub candidate: usize,
    /// Index of the slot in the table.
    pub slot: usize,
    pub record: AccessPointRecord,
}

#[derive(Clone, Copy, Debug, Default)]
enum Slot {
    #[default]
    Free,
    Active(AccessPointRecord),
}

/// Fixed capacity table of discovered APs.
pub struct AccessPointTable {
    slots: [Spinlock<Slot>; AP_TABLE_SIZE],
    /// Slots, that were busy during [AccessPointTable::clear_all] and must not be reported
    /// anymore.
    stale: AtomicU32,
}
impl AccessPointTable {
    pub const fn new() -> Self {
        const FREE: Spinlock<Slot> = Spinlock::new(Slot::Free);
        Self {
            slots: [FREE; AP_TABLE_SIZE],
            stale: AtomicU32::new(0),
        }
    }
    fn is_stale(&self, index: usize) -> bool {
        self.stale.load(Ordering::Acquire) & (1 << index) != 0
    }
    /// Frees a slot with the lock held, if it was marked stale.
    fn purge_if_stale(&self, index: usize, slot: &mut Slot) {
        if self.is_stale(index) {
            *slot = Slot::Free;
            self.stale.fetch_and(!(1 << index), Ordering::Release);
        }
    }
    /// Forget all APs. Used when a new scan starts.
    ///
    /// Slots, which are currently being read by the host, are freed on the next tick.
    pub fn clear_all(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            match slot.try_lock(Processor::Radio) {
                Some(mut slot) => {
                    *slot = Slot::Free;
                    self.stale.fetch_and(!(1 << index), Ordering::Release);
                }
                None => {
                    self.stale.fetch_or(1 << index, Ordering::Release);
                }
            }
        }
    }
    /// Record a beacon or probe response.
    ///
    /// If a lock needed for the update is busy, the update is dropped and [TableError::Busy]
    /// is returned.
    pub fn add_or_update(&self, observation: &BeaconObservation) -> TableResult<usize> {
        // Every slot has to be inspected, before we can be sure there is no entry for this
        // BSSID yet. Otherwise we could end up with duplicates.
        let mut existing = None;
        let mut free = None;
        let mut oldest: Option<(usize, u32)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.try_lock(Processor::Radio).ok_or(TableError::Busy)?;
            self.purge_if_stale(index, &mut slot);
            match &*slot {
                Slot::Active(record) if record.bssid == observation.bssid => {
                    existing = Some(index);
                    break;
                }
                Slot::Active(record) => {
                    if oldest.map_or(true, |(_, age)| record.age > age) {
                        oldest = Some((index, record.age));
                    }
                }
                Slot::Free => {
                    if free.is_none() {
                        free = Some(index);
                    }
                }
            }
        }
        if existing.is_none() && free.is_none() {
            if let Some((index, age)) = oldest {
                debug!("AP table full, evicting slot {} with age {}.", index, age);
            }
        }
        let index = existing
            .or(free)
            .or(oldest.map(|(index, _)| index))
            .ok_or(TableError::NotFound)?;
        let mut slot = self.slots[index]
            .try_lock(Processor::Radio)
            .ok_or(TableError::Busy)?;
        let mut record = match &*slot {
            Slot::Active(record) if existing.is_some() => *record,
            _ => {
                trace!("New AP in slot {}: {:?}", index, observation.bssid.octets());
                AccessPointRecord {
                    bssid: observation.bssid,
                    ..Default::default()
                }
            }
        };
        record.transmitter = observation.transmitter;
        // Hidden networks send an empty SSID in beacons, but the real one in probe responses.
        if let Some(ssid) = observation.ssid.filter(|ssid| !ssid.is_hidden()) {
            record.ssid = Some(ssid);
        } else if record.ssid.is_none() {
            record.ssid = observation.ssid;
        }
        record.channel = observation.channel;
        if let Some(rssi) = observation.rssi {
            record.rssi.push(rssi);
        }
        record.security = observation.security;
        record.compatible = observation.compatible;
        record.beacon_interval = observation.beacon_interval;
        record.host_advertisement = observation.host_advertisement;
        record.age = 0;
        *slot = Slot::Active(record);
        Ok(index)
    }
    /// Age all entries by one tick and drop the ones, that timed out.
    ///
    /// Returns the number of entries dropped.
    pub fn tick(&self) -> usize {
        let mut expired = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(mut slot) = slot.try_lock(Processor::Radio) else {
                continue;
            };
            self.purge_if_stale(index, &mut slot);
            if let Slot::Active(record) = &mut *slot {
                record.age += 1;
                if record.age > TIMEOUT {
                    trace!("AP in slot {} timed out.", index);
                    *slot = Slot::Free;
                    expired += 1;
                }
            }
        }
        expired
    }
    /// Copy out the entry in slot `index`.
    pub fn get(&self, processor: Processor, index: usize) -> TableResult<AccessPointRecord> {
        let slot = self.slots.get(index).ok_or(TableError::NotFound)?;
        let slot = slot.try_lock(processor).ok_or(TableError::Busy)?;
        match &*slot {
            Slot::Active(record) if !self.is_stale(index) => Ok(*record),
            _ => Err(TableError::NotFound),
        }
    }
    /// Iterate over copies of all active entries. Busy slots are skipped.
    pub fn iter(
        &self,
        processor: Processor,
    ) -> impl Iterator<Item = (usize, AccessPointRecord)> + '_ {
        (0..AP_TABLE_SIZE).filter_map(move |index| Some((index, self.get(processor, index).ok()?)))
    }
    pub fn active_count(&self, processor: Processor) -> usize {
        self.iter(processor).count()
    }
    /// Returns the first candidate in `candidates`, for which there is an active entry.
    pub fn find_matching(&self, processor: Processor, candidates: &[ApMatcher]) -> Option<ApMatch> {
        self.find_matching_by(processor, candidates, |_| true)
    }
    /// Like [Self::find_matching], but entries rejected by `usable` are skipped.
    pub fn find_matching_by(
        &self,
        processor: Processor,
        candidates: &[ApMatcher],
        usable: impl Fn(&AccessPointRecord) -> bool,
    ) -> Option<ApMatch> {
        candidates
            .iter()
            .enumerate()
            .find_map(|(candidate, matcher)| {
                self.iter(processor)
                    .find(|(_, record)| matcher.matches(record) && usable(record))
                    .map(|(slot, record)| ApMatch {
                        candidate,
                        slot,
                        record,
                    })
            })
    }
    /// Returns the slot holding `bssid`.
    pub fn find_bssid(&self, processor: Processor, bssid: MacAddress) -> Option<(usize, AccessPointRecord)> {
        self.iter(processor).find(|(_, record)| record.bssid == bssid)
    }
    #[cfg(test)]
    pub(crate) fn hold_slot(&self, processor: Processor, index: usize) -> Option<impl Drop + '_> {
        self.slots[index].try_lock(processor)
    }
}
impl Default for AccessPointTable {
    fn default() -> Self {
        Self::new()
    }
}
