//! The memory region shared between the radio and the host.
//!
//! Apart from the AP table and the session table, every field has exactly one writer. The host
//! posts commands into a latest-wins [Mailbox] and the radio acknowledges them by publishing
//! the version it acted upon along with its status, so the host never has to assume, that a
//! write has been observed.

use core::ptr;

use portable_atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use static_cell::StaticCell;

use crate::{
    ap_table::{AccessPointRecord, AccessPointTable},
    config::{HostParameters, KeyMaterial, RequestError, RequestResult},
    frame::MacAddress,
    link::{AuthLevel, LinkError, Mode},
    ring::RingChannel,
    session::{MultiplayerSessionTable, MAX_PEERS},
    sync::{Processor, Spinlock},
};

/// Size of the ring carrying received data to the host.
pub const RX_RING_SIZE: usize = 0x2000;
/// Size of the ring carrying data from the host to the radio.
pub const TX_RING_SIZE: usize = 0x2000;

/// The AP to connect to, as resolved by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub record: AccessPointRecord,
    pub key: Option<KeyMaterial>,
}

/// A request from the host to the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkCommand {
    /// Power up the radio.
    Enable,
    /// Leave the current mode and power down.
    PowerOff,
    /// Leave the current mode.
    Stop,
    Scan,
    Connect(ConnectTarget),
    Host(HostParameters),
}

/// A single slot, where a newer value replaces an older one, that hasn't been taken yet.
pub struct Mailbox<T> {
    slot: Spinlock<Option<(u32, T)>>,
    version: AtomicU32,
}
impl<T: Copy> Mailbox<T> {
    pub const fn new() -> Self {
        Self {
            slot: Spinlock::new(None),
            version: AtomicU32::new(0),
        }
    }
    /// Replace the contents, returning the version of the new value.
    ///
    /// Returns [None] if the slot is currently locked by the other side.
    pub fn post(&self, processor: Processor, value: T) -> Option<u32> {
        let mut slot = self.slot.try_lock(processor)?;
        let version = self.version.load(Ordering::Relaxed).wrapping_add(1);
        self.version.store(version, Ordering::Relaxed);
        *slot = Some((version, value));
        Some(version)
    }
    /// Take the value out of the slot, if there is one and the lock is free.
    pub fn take(&self, processor: Processor) -> Option<(u32, T)> {
        self.slot.try_lock(processor)?.take()
    }
    /// The version of the most recently posted value.
    pub fn latest_version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }
    fn clear(&self, processor: Processor) {
        if let Some(mut slot) = self.slot.try_lock(processor) {
            *slot = None;
        }
    }
}
impl<T: Copy> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of the radio's status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub mode: Mode,
    pub auth_level: AuthLevel,
    pub channel: u8,
    pub rssi: u8,
    /// The AP table slot of the AP we're connecting or connected to.
    pub ap_slot: Option<u8>,
    pub retries: u8,
    /// Why the last connection attempt failed.
    pub failure: Option<LinkError>,
    /// The AID we were assigned by the AP.
    pub aid: u16,
    /// The version of the last command the radio acted upon.
    pub acknowledged: u32,
}

/// The status fields written by the radio.
struct LinkStatus {
    mode: AtomicU8,
    auth_level: AtomicU8,
    channel: AtomicU8,
    rssi: AtomicU8,
    ap_slot: AtomicU8,
    retries: AtomicU8,
    failure: AtomicU8,
    aid: AtomicU16,
    acknowledged: AtomicU32,
}
impl LinkStatus {
    const NO_SLOT: u8 = u8::MAX;
    const NO_FAILURE: u8 = 0;

    const fn new() -> Self {
        Self {
            mode: AtomicU8::new(Mode::Disabled.into_bits()),
            auth_level: AtomicU8::new(AuthLevel::Disconnected.into_bits()),
            channel: AtomicU8::new(0),
            rssi: AtomicU8::new(0),
            ap_slot: AtomicU8::new(Self::NO_SLOT),
            retries: AtomicU8::new(0),
            failure: AtomicU8::new(Self::NO_FAILURE),
            aid: AtomicU16::new(0),
            acknowledged: AtomicU32::new(0),
        }
    }
}

/// Counters maintained by the radio.
#[derive(Default)]
pub struct Statistics {
    pub rx_packets: AtomicU32,
    pub rx_bytes: AtomicU32,
    pub tx_packets: AtomicU32,
    pub tx_bytes: AtomicU32,
    /// Frames the radio refused, since its queue was full.
    pub tx_queue_full: AtomicU32,
    /// Operations dropped, since a lock was held by the host.
    pub lock_busy: AtomicU32,
    /// Handshake frames sent again, since no reply arrived.
    pub retransmissions: AtomicU32,
}
impl Statistics {
    pub const fn new() -> Self {
        Self {
            rx_packets: AtomicU32::new(0),
            rx_bytes: AtomicU32::new(0),
            tx_packets: AtomicU32::new(0),
            tx_bytes: AtomicU32::new(0),
            tx_queue_full: AtomicU32::new(0),
            lock_busy: AtomicU32::new(0),
            retransmissions: AtomicU32::new(0),
        }
    }
    pub(crate) fn count(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn count_packet(packets: &AtomicU32, bytes: &AtomicU32, length: usize) {
        packets.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(length as u32, Ordering::Relaxed);
    }
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_queue_full: self.tx_queue_full.load(Ordering::Relaxed),
            lock_busy: self.lock_busy.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
        }
    }
    fn reset(&self) {
        for counter in [
            &self.rx_packets,
            &self.rx_bytes,
            &self.tx_packets,
            &self.tx_bytes,
            &self.tx_queue_full,
            &self.lock_busy,
            &self.retransmissions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatisticsSnapshot {
    pub rx_packets: u32,
    pub rx_bytes: u32,
    pub tx_packets: u32,
    pub tx_bytes: u32,
    pub tx_queue_full: u32,
    pub lock_busy: u32,
    pub retransmissions: u32,
}

/// Everything the radio and the host share.
pub struct SharedState {
    pub(crate) commands: Mailbox<LinkCommand>,
    status: LinkStatus,
    pub statistics: Statistics,
    pub access_points: AccessPointTable,
    pub sessions: MultiplayerSessionTable,
    /// Radio to host.
    pub rx: RingChannel<RX_RING_SIZE>,
    /// Host to radio.
    pub tx: RingChannel<TX_RING_SIZE>,
    mac_address: AtomicU64,
    /// Bit `n` requests the peer with AID `n` to be kicked.
    pending_kicks: AtomicU16,
    kick_unassociated: AtomicBool,
}
impl SharedState {
    const STATUS_READ_ATTEMPTS: usize = 3;

    pub const fn new() -> Self {
        Self {
            commands: Mailbox::new(),
            status: LinkStatus::new(),
            statistics: Statistics::new(),
            access_points: AccessPointTable::new(),
            sessions: MultiplayerSessionTable::new(),
            rx: RingChannel::new(),
            tx: RingChannel::new(),
            mac_address: AtomicU64::new(0),
            pending_kicks: AtomicU16::new(0),
            kick_unassociated: AtomicBool::new(false),
        }
    }
    /// Bring everything back to the initial state.
    ///
    /// This fails with [RequestError::Busy], if a ring is still attached or the session table
    /// is locked. Nothing but the rings is touched before the session table is cleared, so
    /// the reset can simply be retried.
    pub fn reset(&self) -> RequestResult<()> {
        self.rx.reset().map_err(|_| RequestError::Busy)?;
        self.tx.reset().map_err(|_| RequestError::Busy)?;
        self.sessions
            .reset(MAX_PEERS)
            .map_err(|_| RequestError::Busy)?;
        self.commands.clear(Processor::Host);
        self.status.mode.store(Mode::Disabled.into_bits(), Ordering::Relaxed);
        self.status
            .auth_level
            .store(AuthLevel::Disconnected.into_bits(), Ordering::Relaxed);
        self.status.channel.store(0, Ordering::Relaxed);
        self.status.rssi.store(0, Ordering::Relaxed);
        self.status.ap_slot.store(LinkStatus::NO_SLOT, Ordering::Relaxed);
        self.status.retries.store(0, Ordering::Relaxed);
        self.status.failure.store(LinkStatus::NO_FAILURE, Ordering::Relaxed);
        self.status.aid.store(0, Ordering::Relaxed);
        self.status
            .acknowledged
            .store(self.commands.latest_version(), Ordering::Release);
        self.statistics.reset();
        self.access_points.clear_all();
        self.sessions.set_accepting(false);
        self.pending_kicks.store(0, Ordering::Relaxed);
        self.kick_unassociated.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Post a command for the radio, returning its version.
    pub fn post_command(&self, command: LinkCommand) -> RequestResult<u32> {
        self.commands
            .post(Processor::Host, command)
            .ok_or(RequestError::Busy)
    }
    pub fn status(&self) -> StatusReport {
        let status = &self.status;
        // Everything published before the acknowledgement is visible after loading it.
        let acknowledged = status.acknowledged.load(Ordering::Acquire);
        // Mode and auth level are stored separately, so reread them until they're consistent.
        let (mut mode, mut auth_level) = (0, 0);
        for _ in 0..Self::STATUS_READ_ATTEMPTS {
            mode = status.mode.load(Ordering::Acquire);
            auth_level = status.auth_level.load(Ordering::Acquire);
            if status.mode.load(Ordering::Acquire) == mode {
                break;
            }
        }
        StatusReport {
            mode: Mode::from_bits(mode),
            auth_level: AuthLevel::from_bits(auth_level),
            channel: status.channel.load(Ordering::Relaxed),
            rssi: status.rssi.load(Ordering::Relaxed),
            ap_slot: match status.ap_slot.load(Ordering::Relaxed) {
                LinkStatus::NO_SLOT => None,
                slot => Some(slot),
            },
            retries: status.retries.load(Ordering::Relaxed),
            failure: match status.failure.load(Ordering::Relaxed) {
                LinkStatus::NO_FAILURE => None,
                failure => Some(LinkError::from_bits(failure)),
            },
            aid: status.aid.load(Ordering::Relaxed),
            acknowledged,
        }
    }

    pub(crate) fn publish_mode(&self, mode: Mode) {
        self.status.mode.store(mode.into_bits(), Ordering::Release);
    }
    pub(crate) fn publish_auth_level(&self, auth_level: AuthLevel) {
        self.status
            .auth_level
            .store(auth_level.into_bits(), Ordering::Release);
    }
    pub(crate) fn publish_channel(&self, channel: u8) {
        self.status.channel.store(channel, Ordering::Relaxed);
    }
    pub(crate) fn publish_rssi(&self, rssi: u8) {
        self.status.rssi.store(rssi, Ordering::Relaxed);
    }
    pub(crate) fn publish_ap_slot(&self, slot: Option<usize>) {
        self.status.ap_slot.store(
            slot.map_or(LinkStatus::NO_SLOT, |slot| slot as u8),
            Ordering::Relaxed,
        );
    }
    pub(crate) fn publish_retries(&self, retries: u8) {
        self.status.retries.store(retries, Ordering::Relaxed);
    }
    pub(crate) fn publish_failure(&self, failure: Option<LinkError>) {
        self.status.failure.store(
            failure.map_or(LinkStatus::NO_FAILURE, LinkError::into_bits),
            Ordering::Relaxed,
        );
    }
    pub(crate) fn publish_aid(&self, aid: u16) {
        self.status.aid.store(aid, Ordering::Relaxed);
    }
    pub(crate) fn acknowledge(&self, version: u32) {
        self.status.acknowledged.store(version, Ordering::Release);
    }

    pub fn mac_address(&self) -> MacAddress {
        let bytes = self.mac_address.load(Ordering::Relaxed).to_le_bytes();
        MacAddress::from_slice(&bytes).unwrap_or_default()
    }
    pub(crate) fn publish_mac_address(&self, address: MacAddress) {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&address.octets());
        self.mac_address
            .store(u64::from_le_bytes(bytes), Ordering::Relaxed);
    }

    /// Ask the radio to deauthenticate the peer with `aid`.
    pub fn request_kick(&self, aid: u16) -> RequestResult<()> {
        if !(1..=MAX_PEERS as u16).contains(&aid) {
            return Err(RequestError::InvalidPeerCount);
        }
        self.pending_kicks.fetch_or(1 << aid, Ordering::Release);
        Ok(())
    }
    pub(crate) fn take_kick_requests(&self) -> u16 {
        self.pending_kicks.swap(0, Ordering::Acquire)
    }
    /// Put kicks back, that couldn't be processed.
    pub(crate) fn defer_kick_requests(&self, kicks: u16) {
        self.pending_kicks.fetch_or(kicks, Ordering::Release);
    }
    /// Ask the radio to drop all peers, that haven't completed association.
    pub fn request_kick_unassociated(&self) {
        self.kick_unassociated.store(true, Ordering::Release);
    }
    pub(crate) fn take_kick_unassociated_request(&self) -> bool {
        self.kick_unassociated.swap(false, Ordering::Acquire)
    }
}
impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// The once allocated home of the [SharedState].
///
/// The host initializes it and publishes the address, the radio attaches to whatever address
/// is currently published.
pub struct SharedRegion {
    cell: StaticCell<SharedState>,
    allocated: AtomicPtr<SharedState>,
    published: AtomicPtr<SharedState>,
}
impl SharedRegion {
    pub const fn new() -> Self {
        Self {
            cell: StaticCell::new(),
            allocated: AtomicPtr::new(ptr::null_mut()),
            published: AtomicPtr::new(ptr::null_mut()),
        }
    }
    /// Allocate the state on first use, reset it on every later use and publish it.
    pub fn init(&'static self) -> RequestResult<&'static SharedState> {
        if !self.published.load(Ordering::Acquire).is_null() {
            return Err(RequestError::InvalidState);
        }
        let state: &'static SharedState = match self.allocated.load(Ordering::Acquire) {
            allocated if allocated.is_null() => {
                let state = self
                    .cell
                    .try_init_with(SharedState::new)
                    .ok_or(RequestError::InvalidState)?;
                self.allocated.store(state, Ordering::Release);
                state
            }
            // SAFETY: The pointer comes from the static cell, so it's valid forever and only
            // ever shared immutably.
            allocated => unsafe { &*allocated },
        };
        state.reset()?;
        self.published
            .store(ptr::from_ref(state).cast_mut(), Ordering::Release);
        debug!("Shared state published.");
        Ok(state)
    }
    /// Returns the published state, if there is one.
    pub fn attach(&self) -> Option<&'static SharedState> {
        let published = self.published.load(Ordering::Acquire);
        // SAFETY: Only pointers into the static cell are ever published.
        (!published.is_null()).then(|| unsafe { &*published })
    }
    /// Withdraw the published state.
    pub fn deinit(&self) {
        self.published.store(ptr::null_mut(), Ordering::Release);
        debug!("Shared state withdrawn.");
    }
}
impl Default for SharedRegion {
    fn default() -> Self {
        Self::new()
    }
}
