//! Timing parameters, validated requests and auto-connect profiles.
//!
//! Everything the application passes in is checked here, before any shared state is touched.

use embassy_time::Duration;

use crate::{
    ap_table::{AccessPointRecord, ApMatcher},
    frame::{MacAddress, Security, Ssid},
};

/// The highest channel the radio may tune to.
pub const MAX_CHANNEL: u8 = 13;
/// The largest packet a multiplayer host or peer may send per round.
pub const MAX_PACKET_SIZE: u16 = 512;
/// The number of connection slots in the firmware settings.
#[cfg(not(extended_profiles))]
pub const MAX_PROFILES: usize = 3;
#[cfg(extended_profiles)]
pub const MAX_PROFILES: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestError {
    /// The SSID is longer than 32 bytes.
    InvalidSsid,
    /// The channel isn't in the range 1-13.
    InvalidChannel,
    /// Hosts can have between one and fifteen peers.
    InvalidPeerCount,
    /// One of the packet sizes exceeds [MAX_PACKET_SIZE].
    PacketTooLarge,
    /// The key material is larger than [KeyMaterial::MAX_LENGTH].
    KeyTooLong,
    /// There are no auto-connect profiles.
    NoProfiles,
    /// The radio hasn't picked up the previous request yet, or a lock was busy.
    Busy,
    /// The operation isn't possible in the current state.
    InvalidState,
}
pub type RequestResult<T> = Result<T, RequestError>;

/// Validates a channel number.
pub fn check_channel(channel: u8) -> RequestResult<u8> {
    if (1..=MAX_CHANNEL).contains(&channel) {
        Ok(channel)
    } else {
        Err(RequestError::InvalidChannel)
    }
}

/// Timing and budget parameters of the link layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    /// How long to wait for a reply, before resending a handshake frame.
    pub resend_interval: Duration,
    /// The number of resends and restarts allowed during one connection attempt.
    pub retry_budget: u8,
    /// Idle time after which a null frame is sent, so the AP doesn't drop us.
    pub keepalive_interval: Duration,
    /// If nothing is heard from the AP for this long, the link is considered lost.
    pub link_loss_timeout: Duration,
    /// How long to stay on a channel during a scan.
    pub scan_dwell: Duration,
    /// Beacon interval in TUs, when hosting a session.
    pub beacon_interval: u16,
    /// Maximum number of TX ring records turned into frames per tick.
    pub tx_burst: usize,
}
impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(250),
            retry_budget: 8,
            keepalive_interval: Duration::from_secs(20),
            link_loss_timeout: Duration::from_secs(10),
            #[cfg(not(fast_scan))]
            scan_dwell: Duration::from_millis(150),
            #[cfg(fast_scan)]
            scan_dwell: Duration::from_millis(50),
            beacon_interval: 100,
            tx_burst: 4,
        }
    }
}
impl LinkConfig {
    /// The beacon interval as a [Duration]. A TU is 1024µs.
    pub fn beacon_period(&self) -> Duration {
        Duration::from_micros(self.beacon_interval as u64 * 1024)
    }
}

/// Which APs are reported to the application after a scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanFilter {
    #[default]
    All,
    /// Only APs the radio can actually join.
    Compatible,
    /// Only local multiplayer hosts, optionally running a specific game.
    LocalHosts { game_id: Option<u32> },
}
impl ScanFilter {
    pub fn matches(&self, record: &AccessPointRecord) -> bool {
        match self {
            Self::All => true,
            Self::Compatible => record.compatible,
            Self::LocalHosts { game_id } => record.host_advertisement.is_some_and(|advertisement| {
                game_id.map_or(true, |game_id| game_id == advertisement.game_id)
            }),
        }
    }
}

/// Opaque key material handed to the cryptography layer.
///
/// For WEP this is the key itself, for WPA the pre-shared key or passphrase.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyMaterial {
    bytes: [u8; Self::MAX_LENGTH],
    length: u8,
}
impl KeyMaterial {
    pub const MAX_LENGTH: usize = 64;

    pub fn new(key: &[u8]) -> RequestResult<Self> {
        if key.len() > Self::MAX_LENGTH {
            return Err(RequestError::KeyTooLong);
        }
        let mut bytes = [0u8; Self::MAX_LENGTH];
        bytes[..key.len()].copy_from_slice(key);
        Ok(Self {
            bytes,
            length: key.len() as u8,
        })
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }
}
impl core::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Keys don't end up in logs.
        write!(f, "KeyMaterial({} bytes)", self.length)
    }
}

/// The AP the application wants to connect to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApDescriptor {
    /// Zero to match by SSID only.
    pub bssid: MacAddress,
    pub ssid: Option<Ssid>,
    /// The channel the application last saw the AP on. This is only a hint, since the AP
    /// is looked up in a fresh scan anyway.
    pub channel: Option<u8>,
}
impl ApDescriptor {
    pub fn new(bssid: MacAddress, ssid: &[u8], channel: Option<u8>) -> RequestResult<Self> {
        let ssid = if ssid.is_empty() {
            None
        } else {
            Some(Ssid::new(ssid).ok_or(RequestError::InvalidSsid)?)
        };
        if bssid.is_zero() && ssid.is_none() {
            return Err(RequestError::InvalidSsid);
        }
        let channel = channel.map(check_channel).transpose()?;
        Ok(Self {
            bssid,
            ssid,
            channel,
        })
    }
    /// Describe an AP taken from the table.
    pub fn from_record(record: &AccessPointRecord) -> Self {
        Self {
            bssid: record.bssid,
            ssid: record.ssid,
            channel: Some(record.channel),
        }
    }
    pub fn matcher(&self) -> ApMatcher {
        ApMatcher {
            bssid: self.bssid,
            ssid: self.ssid,
        }
    }
}

/// Parameters of a local multiplayer session we're hosting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostParameters {
    pub ssid: Ssid,
    pub channel: u8,
    pub game_id: u32,
    pub stream_code: u16,
    pub max_peers: u8,
    /// Size of the packets sent to the peers.
    pub host_packet_size: u16,
    /// Size of the packets the peers send to us.
    pub peer_packet_size: u16,
}
impl HostParameters {
    pub fn new(
        ssid: &[u8],
        channel: u8,
        game_id: u32,
        max_peers: u8,
        host_packet_size: u16,
        peer_packet_size: u16,
    ) -> RequestResult<Self> {
        let parameters = Self {
            ssid: Ssid::new(ssid).ok_or(RequestError::InvalidSsid)?,
            channel,
            game_id,
            stream_code: 0,
            max_peers,
            host_packet_size,
            peer_packet_size,
        };
        parameters.validate()?;
        Ok(parameters)
    }
    pub fn validate(&self) -> RequestResult<()> {
        check_channel(self.channel)?;
        if !(1..=crate::session::MAX_PEERS as u8).contains(&self.max_peers) {
            return Err(RequestError::InvalidPeerCount);
        }
        if self.host_packet_size > MAX_PACKET_SIZE || self.peer_packet_size > MAX_PACKET_SIZE {
            return Err(RequestError::PacketTooLarge);
        }
        Ok(())
    }
}

/// How the TCP/IP stack should configure the interface after connecting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IpConfig {
    #[default]
    Dhcp,
    Static {
        address: [u8; 4],
        netmask: [u8; 4],
        gateway: [u8; 4],
        dns: [[u8; 4]; 2],
    },
}
impl IpConfig {
    pub const fn needs_address_acquisition(&self) -> bool {
        matches!(self, Self::Dhcp)
    }
}

/// A saved auto-connect profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Profile {
    pub ssid: Ssid,
    /// Zero matches any BSSID.
    pub bssid: MacAddress,
    pub security: Security,
    pub key: Option<KeyMaterial>,
    pub ip: IpConfig,
}

/// The read-only store the profiles are loaded from.
pub trait ProfileStore {
    /// Returns the profile in `slot`, if that slot is in use.
    fn profile(&self, slot: usize) -> Option<Profile>;
}
impl ProfileStore for [Profile] {
    fn profile(&self, slot: usize) -> Option<Profile> {
        self.get(slot).copied()
    }
}

/// The profiles, as loaded once at initialization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Profiles {
    entries: [Option<Profile>; MAX_PROFILES],
}
impl Profiles {
    /// Copy all used slots out of `store`, keeping their order.
    pub fn load<S: ProfileStore + ?Sized>(store: &S) -> Self {
        let mut entries = [None; MAX_PROFILES];
        for (entry, profile) in entries
            .iter_mut()
            .zip((0..MAX_PROFILES).filter_map(|slot| store.profile(slot)))
        {
            *entry = Some(profile);
        }
        debug!(
            "Loaded {} auto-connect profiles.",
            entries.iter().flatten().count()
        );
        Self { entries }
    }
    pub fn iter(&self) -> impl Iterator<Item = &Profile> + '_ {
        self.entries.iter().flatten()
    }
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}
