//! Just enough IEEE 802.11 to run the link layer.
//!
//! Received frames are classified by [parse_frame], outgoing frames are serialized through a
//! [FrameWriter] into a caller provided buffer, so nothing here allocates.

use core::fmt;

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

/// Length of the generic management/data header.
pub const HEADER_LENGTH: usize = 24;
/// Large enough for every management frame we build.
pub const MAX_MANAGEMENT_FRAME_LENGTH: usize = 256;
/// The largest frame, that fits into a single transmission.
pub const MAX_FRAME_LENGTH: usize = 1600;
/// Length of the LLC/SNAP header in front of the payload of data frames.
pub const LLC_SNAP_LENGTH: usize = 8;
const LLC_SNAP_PREFIX: [u8; 6] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];
/// Ethertype of EAPOL frames, which belong to the key exchange.
pub const ETHERTYPE_EAPOL: u16 = 0x888e;

/// Information element IDs we care about.
pub mod element_id {
    pub const SSID: u8 = 0;
    pub const SUPPORTED_RATES: u8 = 1;
    pub const DS_PARAMETER_SET: u8 = 3;
    pub const TIM: u8 = 5;
    pub const CHALLENGE_TEXT: u8 = 16;
    pub const RSN: u8 = 48;
    pub const VENDOR_SPECIFIC: u8 = 221;
}
const WPA_OUI: [u8; 3] = [0x00, 0x50, 0xf2];
const RSN_OUI: [u8; 3] = [0x00, 0x0f, 0xac];
const NINTENDO_OUI: [u8; 3] = [0x00, 0x09, 0xbf];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// The frame ended before a mandatory field.
    Truncated,
    /// The frame isn't something we can interpret.
    Unsupported,
    /// The output buffer is too small for the frame.
    BufferTooSmall,
}
pub type FrameResult<T> = Result<T, FrameError>;

/// An IEEE 802 MAC address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacAddress(pub [u8; 6]);
impl MacAddress {
    pub const ZERO: Self = Self([0x00; 6]);
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub const fn new(address: [u8; 6]) -> Self {
        Self(address)
    }
    /// Read the address from the start of the slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.get(..6)?.try_into().ok()?))
    }
    pub const fn is_zero(&self) -> bool {
        matches!(self.0, [0, 0, 0, 0, 0, 0])
    }
    /// Group addresses have the least significant bit of the first octet set.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 1 != 0
    }
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}
impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// An SSID of at most 32 bytes.
///
/// SSIDs aren't required to be UTF-8, so this is just bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ssid {
    bytes: [u8; Ssid::MAX_LENGTH],
    length: u8,
}
impl Ssid {
    pub const MAX_LENGTH: usize = 32;

    /// Returns [None], if `ssid` is longer than [Ssid::MAX_LENGTH].
    pub fn new(ssid: &[u8]) -> Option<Self> {
        if ssid.len() > Self::MAX_LENGTH {
            return None;
        }
        let mut bytes = [0u8; Self::MAX_LENGTH];
        bytes[..ssid.len()].copy_from_slice(ssid);
        Some(Self {
            bytes,
            length: ssid.len() as u8,
        })
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }
    pub const fn len(&self) -> usize {
        self.length as usize
    }
    /// Hidden networks advertise an empty or all zero SSID.
    pub fn is_hidden(&self) -> bool {
        self.as_bytes().iter().all(|byte| *byte == 0)
    }
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}
impl fmt::Debug for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(ssid) => write!(f, "{ssid:?}"),
            Err(_) => write!(f, "{:02x?}", self.as_bytes()),
        }
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct FrameControl {
    #[bits(2)]
    pub protocol_version: u8,
    #[bits(2)]
    pub frame_type: u8,
    #[bits(4)]
    pub subtype: u8,
    pub to_ds: bool,
    pub from_ds: bool,
    pub more_fragments: bool,
    pub retry: bool,
    pub power_management: bool,
    pub more_data: bool,
    pub protected: bool,
    pub order: bool,
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct CapabilityInformation {
    pub is_ess: bool,
    pub is_ibss: bool,
    pub cf_pollable: bool,
    pub cf_poll_request: bool,
    pub privacy: bool,
    pub short_preamble: bool,
    pub pbcc: bool,
    pub channel_agility: bool,
    pub spectrum_management: bool,
    pub qos: bool,
    pub short_slot_time: bool,
    pub apsd: bool,
    pub radio_measurement: bool,
    pub dsss_ofdm: bool,
    pub delayed_block_ack: bool,
    pub immediate_block_ack: bool,
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum FrameType: u8 {
        #[default]
        Management => 0,
        Control => 1,
        Data => 2
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum ManagementSubtype: u8 {
        #[default]
        AssociationRequest => 0,
        AssociationResponse => 1,
        ReassociationRequest => 2,
        ReassociationResponse => 3,
        ProbeRequest => 4,
        ProbeResponse => 5,
        Beacon => 8,
        Disassociation => 10,
        Authentication => 11,
        Deauthentication => 12,
        Action => 13
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum DataSubtype: u8 {
        #[default]
        Data => 0,
        Null => 4
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Status codes carried by authentication and association responses.
    pub enum StatusCode: u16 {
        #[default]
        Success => 0,
        UnspecifiedFailure => 1,
        UnsupportedCapabilities => 10,
        UnsupportedAuthAlgorithm => 13,
        AuthSequenceOutOfOrder => 14,
        ChallengeFailure => 15,
        AuthTimeout => 16,
        ApFull => 17,
        UnsupportedRates => 18
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Reason codes carried by deauthentication and disassociation frames.
    pub enum ReasonCode: u16 {
        #[default]
        Unspecified => 1,
        PreviousAuthInvalid => 2,
        Leaving => 3,
        Inactivity => 4,
        ApFull => 5,
        NotAuthenticated => 6,
        NotAssociated => 7,
        LeavingBss => 8
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum AuthAlgorithm: u16 {
        #[default]
        OpenSystem => 0,
        SharedKey => 1
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Data rates in units of 500 kbit/s.
    pub enum Rate: u8 {
        #[default]
        Rate1M => 2,
        Rate2M => 4,
        Rate5_5M => 11,
        Rate11M => 22,
        Rate6M => 12,
        Rate9M => 18,
        Rate12M => 24,
        Rate18M => 36,
        Rate24M => 48,
        Rate36M => 72,
        Rate48M => 96,
        Rate54M => 108
    }
}
impl Rate {
    /// Check if the radio can actually transmit at this rate.
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Rate1M | Self::Rate2M)
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Cipher suite types as used in RSN and WPA elements.
    pub enum Cipher: u8 {
        #[default]
        Disabled => 0,
        Wep40 => 1,
        Tkip => 2,
        Ccmp => 4,
        Wep104 => 5
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Authentication and key management suites.
    pub enum AkmSuite: u8 {
        #[default]
        Disabled => 0,
        Ieee8021X => 1,
        Psk => 2
    }
}

/// The rate set we advertise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RateSet {
    /// The rates the radio supports.
    #[default]
    Native,
    /// The full DSSS/OFDM rate set. Some APs refuse stations, which don't claim support for
    /// these, even though we only ever transmit at the native rates.
    Expanded,
}
impl RateSet {
    const NATIVE: &[u8] = &[0x82, 0x84];
    const EXPANDED: &[u8] = &[0x82, 0x84, 0x8b, 0x96, 0x0c, 0x12, 0x18, 0x24];

    /// The contents of the supported rates element, with the basic rate bit set where needed.
    pub const fn element_bytes(&self) -> &'static [u8] {
        match self {
            Self::Native => Self::NATIVE,
            Self::Expanded => Self::EXPANDED,
        }
    }
}

/// Coarse security classification of a network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Security {
    #[default]
    Open,
    Wep,
    Wpa,
    Wpa2,
}
impl Security {
    pub const fn is_wpa(&self) -> bool {
        matches!(self, Self::Wpa | Self::Wpa2)
    }
}

/// Everything we know about the security of a network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SecurityInfo {
    pub security: Security,
    pub group_cipher: Cipher,
    pub pairwise_cipher: Cipher,
    pub akm: AkmSuite,
}

/// Information a local multiplayer host advertises in its vendor element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostAdvertisement {
    pub game_id: u32,
    pub stream_code: u16,
    pub max_peers: u8,
    pub current_peers: u8,
    pub accepting_peers: bool,
    /// Size of the packets sent from the host to the peers.
    pub host_packet_size: u16,
    /// Size of the packets sent from the peers to the host.
    pub peer_packet_size: u16,
}
impl HostAdvertisement {
    const TYPE: u8 = 0x00;
    /// OUI + type + payload.
    const ELEMENT_LENGTH: usize = 4 + 13;

    fn parse(body: &[u8]) -> Option<Self> {
        let payload = body.get(4..Self::ELEMENT_LENGTH)?;
        Some(Self {
            game_id: u32::from_le_bytes(payload[0..4].try_into().ok()?),
            stream_code: u16::from_le_bytes([payload[4], payload[5]]),
            max_peers: payload[6],
            current_peers: payload[7],
            accepting_peers: payload[8] != 0,
            host_packet_size: u16::from_le_bytes([payload[9], payload[10]]),
            peer_packet_size: u16::from_le_bytes([payload[11], payload[12]]),
        })
    }
    fn write(&self, writer: &mut FrameWriter<'_>) -> FrameResult<()> {
        writer.put_u8(element_id::VENDOR_SPECIFIC)?;
        writer.put_u8(Self::ELEMENT_LENGTH as u8)?;
        writer.put_slice(&NINTENDO_OUI)?;
        writer.put_u8(Self::TYPE)?;
        writer.put_slice(&self.game_id.to_le_bytes())?;
        writer.put_u16(self.stream_code)?;
        writer.put_u8(self.max_peers)?;
        writer.put_u8(self.current_peers)?;
        writer.put_u8(self.accepting_peers as u8)?;
        writer.put_u16(self.host_packet_size)?;
        writer.put_u16(self.peer_packet_size)
    }
}

/// Serializes a frame into a borrowed buffer.
pub struct FrameWriter<'a> {
    buffer: &'a mut [u8],
    length: usize,
}
impl<'a> FrameWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, length: 0 }
    }
    pub fn put_slice(&mut self, bytes: &[u8]) -> FrameResult<()> {
        let end = self.length + bytes.len();
        self.buffer
            .get_mut(self.length..end)
            .ok_or(FrameError::BufferTooSmall)?
            .copy_from_slice(bytes);
        self.length = end;
        Ok(())
    }
    pub fn put_u8(&mut self, value: u8) -> FrameResult<()> {
        self.put_slice(&[value])
    }
    /// All multi byte fields in 802.11 are little endian.
    pub fn put_u16(&mut self, value: u16) -> FrameResult<()> {
        self.put_slice(&value.to_le_bytes())
    }
    pub fn put_element(&mut self, id: u8, contents: &[u8]) -> FrameResult<()> {
        if contents.len() > u8::MAX as usize {
            return Err(FrameError::BufferTooSmall);
        }
        self.put_u8(id)?;
        self.put_u8(contents.len() as u8)?;
        self.put_slice(contents)
    }
    pub fn len(&self) -> usize {
        self.length
    }
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
    /// Returns the written part of the buffer.
    pub fn finish(self) -> &'a [u8] {
        &self.buffer[..self.length]
    }
}

/// The header shared by management and data frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_control: FrameControl,
    pub duration: u16,
    pub address_1: MacAddress,
    pub address_2: MacAddress,
    pub address_3: MacAddress,
    pub sequence_control: u16,
}
impl FrameHeader {
    /// A management frame header. For management frames, address 1 is the receiver, address 2
    /// the transmitter and address 3 the BSSID.
    pub fn management(
        subtype: ManagementSubtype,
        receiver: MacAddress,
        transmitter: MacAddress,
        bssid: MacAddress,
        sequence_number: u16,
    ) -> Self {
        Self {
            frame_control: FrameControl::new()
                .with_frame_type(FrameType::Management.into_bits())
                .with_subtype(subtype.into_bits()),
            duration: 0,
            address_1: receiver,
            address_2: transmitter,
            address_3: bssid,
            sequence_control: sequence_number << 4,
        }
    }
    pub fn parse(bytes: &[u8]) -> FrameResult<(Self, &[u8])> {
        if bytes.len() < HEADER_LENGTH {
            return Err(FrameError::Truncated);
        }
        let address = |offset: usize| MacAddress::from_slice(&bytes[offset..]).unwrap_or_default();
        let header = Self {
            frame_control: FrameControl::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])),
            duration: u16::from_le_bytes([bytes[2], bytes[3]]),
            address_1: address(4),
            address_2: address(10),
            address_3: address(16),
            sequence_control: u16::from_le_bytes([bytes[22], bytes[23]]),
        };
        Ok((header, &bytes[HEADER_LENGTH..]))
    }
    pub fn write(&self, writer: &mut FrameWriter<'_>) -> FrameResult<()> {
        writer.put_u16(self.frame_control.into_bits())?;
        writer.put_u16(self.duration)?;
        writer.put_slice(&self.address_1.0)?;
        writer.put_slice(&self.address_2.0)?;
        writer.put_slice(&self.address_3.0)?;
        writer.put_u16(self.sequence_control)
    }
    pub fn frame_type(&self) -> FrameType {
        FrameType::from_bits(self.frame_control.frame_type())
    }
    pub fn is_management(&self, subtype: ManagementSubtype) -> bool {
        self.frame_type() == FrameType::Management
            && ManagementSubtype::from_bits(self.frame_control.subtype()) == subtype
    }
    /// The BSSID of a data frame, which depends on the DS bits.
    pub fn data_bssid(&self) -> MacAddress {
        match (
            self.frame_control.to_ds(),
            self.frame_control.from_ds(),
        ) {
            (true, false) => self.address_1,
            (false, true) => self.address_2,
            _ => self.address_3,
        }
    }
    /// Returns the destination and source address of a data frame.
    pub fn data_addresses(&self) -> (MacAddress, MacAddress) {
        match (
            self.frame_control.to_ds(),
            self.frame_control.from_ds(),
        ) {
            (true, false) => (self.address_3, self.address_2),
            (false, true) => (self.address_1, self.address_3),
            _ => (self.address_1, self.address_2),
        }
    }
}

/// Iterator over the information elements in a frame body.
pub struct Elements<'a> {
    bytes: &'a [u8],
}
impl<'a> Elements<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}
impl<'a> Iterator for Elements<'a> {
    type Item = (u8, &'a [u8]);
    fn next(&mut self) -> Option<Self::Item> {
        let [id, length, rest @ ..] = self.bytes else {
            return None;
        };
        let Some(contents) = rest.get(..*length as usize) else {
            // Truncated elements end the chain.
            self.bytes = &[];
            return None;
        };
        self.bytes = &rest[*length as usize..];
        Some((*id, contents))
    }
}

/// The parts of a beacon or probe response, that the AP table is interested in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BeaconInfo {
    pub bssid: MacAddress,
    pub transmitter: MacAddress,
    pub capabilities: CapabilityInformation,
    pub beacon_interval: u16,
    pub ssid: Option<Ssid>,
    pub channel: Option<u8>,
    /// All basic rates are ones the radio supports.
    pub compatible: bool,
    pub security: SecurityInfo,
    pub host_advertisement: Option<HostAdvertisement>,
}
impl BeaconInfo {
    /// Parse the body of a beacon or probe response.
    fn parse(header: &FrameHeader, body: &[u8]) -> FrameResult<Self> {
        if body.len() < 12 {
            return Err(FrameError::Truncated);
        }
        let capabilities = CapabilityInformation::from_bits(u16::from_le_bytes([body[10], body[11]]));
        let mut info = Self {
            bssid: header.address_3,
            transmitter: header.address_2,
            capabilities,
            beacon_interval: u16::from_le_bytes([body[8], body[9]]),
            ssid: None,
            channel: None,
            compatible: true,
            security: SecurityInfo {
                security: if capabilities.privacy() {
                    Security::Wep
                } else {
                    Security::Open
                },
                ..Default::default()
            },
            host_advertisement: None,
        };
        let mut saw_rates = false;
        for (id, contents) in Elements::new(&body[12..]) {
            match id {
                element_id::SSID => info.ssid = Ssid::new(contents),
                element_id::SUPPORTED_RATES => {
                    saw_rates = true;
                    // Basic rates are mandatory for every station, so we can only join, if we
                    // support all of them.
                    info.compatible &= contents
                        .iter()
                        .filter(|rate| **rate & 0x80 != 0)
                        .all(|rate| Rate::from_bits(*rate & 0x7f).is_native());
                }
                element_id::DS_PARAMETER_SET => info.channel = contents.first().copied(),
                element_id::RSN => {
                    if let Some(security) = parse_cipher_suites(contents, RSN_OUI, Security::Wpa2) {
                        info.security = security;
                    }
                }
                element_id::VENDOR_SPECIFIC => match contents {
                    [0x00, 0x50, 0xf2, 0x01, suites @ ..] if info.security.security != Security::Wpa2 => {
                        if let Some(security) = parse_cipher_suites(suites, WPA_OUI, Security::Wpa) {
                            info.security = security;
                        }
                    }
                    [0x00, 0x09, 0xbf, HostAdvertisement::TYPE, ..] => {
                        info.host_advertisement = HostAdvertisement::parse(contents);
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        info.compatible &= saw_rates;
        if info.security.security == Security::Wep {
            info.security.group_cipher = Cipher::Wep40;
            info.security.pairwise_cipher = Cipher::Wep40;
        }
        Ok(info)
    }
}

/// Parses version, group cipher, pairwise ciphers and AKM suites, as they appear in both RSN
/// and WPA elements.
fn parse_cipher_suites(contents: &[u8], oui: [u8; 3], security: Security) -> Option<SecurityInfo> {
    let suite = |bytes: &[u8]| -> Option<u8> {
        let bytes = bytes.get(..4)?;
        (bytes[..3] == oui).then_some(bytes[3])
    };
    // Version
    let rest = contents.get(2..)?;
    let group_cipher = Cipher::from_bits(suite(rest)?);
    let rest = rest.get(4..)?;
    let pairwise_count = u16::from_le_bytes([*rest.first()?, *rest.get(1)?]) as usize;
    let rest = rest.get(2..)?;
    // The strongest pairwise cipher is what we'd negotiate.
    let pairwise_cipher = rest
        .get(..pairwise_count * 4)?
        .chunks_exact(4)
        .filter_map(suite)
        .map(Cipher::from_bits)
        .max_by_key(|cipher| match cipher {
            Cipher::Ccmp => 2,
            Cipher::Tkip => 1,
            _ => 0,
        })
        .unwrap_or(group_cipher);
    let rest = &rest[pairwise_count * 4..];
    let akm = rest
        .get(2..6)
        .and_then(suite)
        .map(AkmSuite::from_bits)
        .unwrap_or(AkmSuite::Psk);
    Some(SecurityInfo {
        security,
        group_cipher,
        pairwise_cipher,
        akm,
    })
}

/// The body of an authentication frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Authentication<'a> {
    pub algorithm: AuthAlgorithm,
    pub sequence: u16,
    pub status: StatusCode,
    pub challenge: Option<&'a [u8]>,
}

/// A received frame, classified by type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Beacon(BeaconInfo),
    ProbeResponse(BeaconInfo),
    ProbeRequest {
        transmitter: MacAddress,
        ssid: Option<Ssid>,
    },
    Authentication {
        header: FrameHeader,
        body: Authentication<'a>,
    },
    AssociationRequest {
        header: FrameHeader,
        capabilities: CapabilityInformation,
        ssid: Option<Ssid>,
    },
    AssociationResponse {
        header: FrameHeader,
        status: StatusCode,
        aid: u16,
    },
    Deauthentication {
        header: FrameHeader,
        reason: ReasonCode,
    },
    Disassociation {
        header: FrameHeader,
        reason: ReasonCode,
    },
    Data {
        header: FrameHeader,
        body: &'a [u8],
    },
    Other,
}

/// Classify a received frame.
pub fn parse_frame(bytes: &[u8]) -> FrameResult<Frame<'_>> {
    let (header, body) = FrameHeader::parse(bytes)?;
    let u16_at = |offset: usize| -> FrameResult<u16> {
        body.get(offset..offset + 2)
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
            .ok_or(FrameError::Truncated)
    };
    match header.frame_type() {
        FrameType::Management => {}
        FrameType::Data => {
            return Ok(match DataSubtype::from_bits(header.frame_control.subtype()) {
                DataSubtype::Data => Frame::Data { header, body },
                _ => Frame::Other,
            })
        }
        _ => return Ok(Frame::Other),
    }
    Ok(
        match ManagementSubtype::from_bits(header.frame_control.subtype()) {
            ManagementSubtype::Beacon => Frame::Beacon(BeaconInfo::parse(&header, body)?),
            ManagementSubtype::ProbeResponse => {
                Frame::ProbeResponse(BeaconInfo::parse(&header, body)?)
            }
            ManagementSubtype::ProbeRequest => Frame::ProbeRequest {
                transmitter: header.address_2,
                ssid: Elements::new(body)
                    .find(|(id, _)| *id == element_id::SSID)
                    .and_then(|(_, ssid)| Ssid::new(ssid)),
            },
            ManagementSubtype::Authentication => Frame::Authentication {
                header,
                body: Authentication {
                    algorithm: AuthAlgorithm::from_bits(u16_at(0)?),
                    sequence: u16_at(2)?,
                    status: StatusCode::from_bits(u16_at(4)?),
                    challenge: Elements::new(body.get(6..).unwrap_or_default())
                        .find(|(id, _)| *id == element_id::CHALLENGE_TEXT)
                        .map(|(_, challenge)| challenge),
                },
            },
            ManagementSubtype::AssociationRequest | ManagementSubtype::ReassociationRequest => {
                // Reassociation requests carry the current AP address in front of the elements.
                let elements_offset = if header.is_management(ManagementSubtype::AssociationRequest) {
                    4
                } else {
                    10
                };
                Frame::AssociationRequest {
                    header,
                    capabilities: CapabilityInformation::from_bits(u16_at(0)?),
                    ssid: Elements::new(body.get(elements_offset..).unwrap_or_default())
                        .find(|(id, _)| *id == element_id::SSID)
                        .and_then(|(_, ssid)| Ssid::new(ssid)),
                }
            }
            ManagementSubtype::AssociationResponse | ManagementSubtype::ReassociationResponse => {
                Frame::AssociationResponse {
                    header,
                    status: StatusCode::from_bits(u16_at(2)?),
                    // The two most significant bits are always set.
                    aid: u16_at(4)? & 0x3fff,
                }
            }
            ManagementSubtype::Deauthentication => Frame::Deauthentication {
                header,
                reason: ReasonCode::from_bits(u16_at(0)?),
            },
            ManagementSubtype::Disassociation => Frame::Disassociation {
                header,
                reason: ReasonCode::from_bits(u16_at(0)?),
            },
            _ => Frame::Other,
        },
    )
}

/// A broadcast probe request, optionally for a specific SSID.
pub fn write_probe_request(
    writer: &mut FrameWriter<'_>,
    transmitter: MacAddress,
    ssid: Option<&Ssid>,
    sequence_number: u16,
) -> FrameResult<()> {
    FrameHeader::management(
        ManagementSubtype::ProbeRequest,
        MacAddress::BROADCAST,
        transmitter,
        MacAddress::BROADCAST,
        sequence_number,
    )
    .write(writer)?;
    writer.put_element(element_id::SSID, ssid.map(Ssid::as_bytes).unwrap_or_default())?;
    writer.put_element(element_id::SUPPORTED_RATES, RateSet::Native.element_bytes())
}

#[allow(clippy::too_many_arguments)]
pub fn write_authentication(
    writer: &mut FrameWriter<'_>,
    receiver: MacAddress,
    transmitter: MacAddress,
    bssid: MacAddress,
    sequence_number: u16,
    body: &Authentication<'_>,
    protected: bool,
) -> FrameResult<()> {
    let mut header = FrameHeader::management(
        ManagementSubtype::Authentication,
        receiver,
        transmitter,
        bssid,
        sequence_number,
    );
    header.frame_control.set_protected(protected);
    header.write(writer)?;
    writer.put_u16(body.algorithm.into_bits())?;
    writer.put_u16(body.sequence)?;
    writer.put_u16(body.status.into_bits())?;
    if let Some(challenge) = body.challenge {
        writer.put_element(element_id::CHALLENGE_TEXT, challenge)?;
    }
    Ok(())
}

pub fn write_association_request(
    writer: &mut FrameWriter<'_>,
    bssid: MacAddress,
    transmitter: MacAddress,
    sequence_number: u16,
    ssid: &Ssid,
    privacy: bool,
    rate_set: RateSet,
) -> FrameResult<()> {
    FrameHeader::management(
        ManagementSubtype::AssociationRequest,
        bssid,
        transmitter,
        bssid,
        sequence_number,
    )
    .write(writer)?;
    let capabilities = CapabilityInformation::new()
        .with_is_ess(true)
        .with_privacy(privacy)
        .with_short_preamble(true);
    writer.put_u16(capabilities.into_bits())?;
    // Listen interval
    writer.put_u16(1)?;
    writer.put_element(element_id::SSID, ssid.as_bytes())?;
    writer.put_element(element_id::SUPPORTED_RATES, rate_set.element_bytes())
}

pub fn write_association_response(
    writer: &mut FrameWriter<'_>,
    receiver: MacAddress,
    bssid: MacAddress,
    sequence_number: u16,
    status: StatusCode,
    aid: u16,
) -> FrameResult<()> {
    FrameHeader::management(
        ManagementSubtype::AssociationResponse,
        receiver,
        bssid,
        bssid,
        sequence_number,
    )
    .write(writer)?;
    writer.put_u16(CapabilityInformation::new().with_is_ess(true).into_bits())?;
    writer.put_u16(status.into_bits())?;
    writer.put_u16(aid | 0xc000)?;
    writer.put_element(element_id::SUPPORTED_RATES, RateSet::Native.element_bytes())
}

/// Deauthentication or disassociation, depending on `subtype`.
pub fn write_deauthentication(
    writer: &mut FrameWriter<'_>,
    subtype: ManagementSubtype,
    receiver: MacAddress,
    transmitter: MacAddress,
    bssid: MacAddress,
    sequence_number: u16,
    reason: ReasonCode,
) -> FrameResult<()> {
    FrameHeader::management(subtype, receiver, transmitter, bssid, sequence_number).write(writer)?;
    writer.put_u16(reason.into_bits())
}

/// The contents of a beacon.
#[derive(Clone, Copy, Debug)]
pub struct BeaconTemplate<'a> {
    pub bssid: MacAddress,
    /// In TUs.
    pub beacon_interval: u16,
    pub capabilities: CapabilityInformation,
    pub ssid: &'a Ssid,
    pub channel: u8,
    /// Contents of the supported rates element.
    pub rates: &'a [u8],
    /// Present if we're hosting a local multiplayer session.
    pub host_advertisement: Option<&'a HostAdvertisement>,
    /// Appended verbatim after all other elements.
    pub extra_elements: &'a [u8],
}

pub fn write_beacon(
    writer: &mut FrameWriter<'_>,
    template: &BeaconTemplate<'_>,
    sequence_number: u16,
) -> FrameResult<()> {
    FrameHeader::management(
        ManagementSubtype::Beacon,
        MacAddress::BROADCAST,
        template.bssid,
        template.bssid,
        sequence_number,
    )
    .write(writer)?;
    // The timestamp is filled in by the hardware.
    writer.put_slice(&[0x00; 8])?;
    writer.put_u16(template.beacon_interval)?;
    writer.put_u16(template.capabilities.into_bits())?;
    writer.put_element(element_id::SSID, template.ssid.as_bytes())?;
    writer.put_element(element_id::SUPPORTED_RATES, template.rates)?;
    writer.put_element(element_id::DS_PARAMETER_SET, &[template.channel])?;
    // DTIM count, DTIM period, bitmap control, partial virtual bitmap.
    writer.put_element(element_id::TIM, &[0x00, 0x01, 0x00, 0x00])?;
    if let Some(advertisement) = template.host_advertisement {
        advertisement.write(writer)?;
    }
    writer.put_slice(template.extra_elements)
}

/// Direction of a data frame relative to the distribution system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Station to AP.
    ToDs,
    /// AP to station.
    FromDs,
}

/// Wrap an ethernet payload into a data frame with an LLC/SNAP header.
///
/// `protected` only sets the bit in the frame control field. The actual encryption happens
/// further down.
#[allow(clippy::too_many_arguments)]
pub fn write_data(
    writer: &mut FrameWriter<'_>,
    direction: DataDirection,
    bssid: MacAddress,
    destination: MacAddress,
    source: MacAddress,
    sequence_number: u16,
    protected: bool,
    ethertype: u16,
    payload: &[u8],
) -> FrameResult<()> {
    let frame_control = FrameControl::new()
        .with_frame_type(FrameType::Data.into_bits())
        .with_subtype(DataSubtype::Data.into_bits())
        .with_protected(protected);
    let (frame_control, address_1, address_2, address_3) = match direction {
        DataDirection::ToDs => (frame_control.with_to_ds(true), bssid, source, destination),
        DataDirection::FromDs => (frame_control.with_from_ds(true), destination, bssid, source),
    };
    FrameHeader {
        frame_control,
        duration: 0,
        address_1,
        address_2,
        address_3,
        sequence_control: sequence_number << 4,
    }
    .write(writer)?;
    writer.put_slice(&LLC_SNAP_PREFIX)?;
    writer.put_slice(&ethertype.to_be_bytes())?;
    writer.put_slice(payload)
}

/// A null function frame, which keeps the AP from timing us out.
pub fn write_null_data(
    writer: &mut FrameWriter<'_>,
    bssid: MacAddress,
    transmitter: MacAddress,
    sequence_number: u16,
) -> FrameResult<()> {
    FrameHeader {
        frame_control: FrameControl::new()
            .with_frame_type(FrameType::Data.into_bits())
            .with_subtype(DataSubtype::Null.into_bits())
            .with_to_ds(true),
        duration: 0,
        address_1: bssid,
        address_2: transmitter,
        address_3: bssid,
        sequence_control: sequence_number << 4,
    }
    .write(writer)
}

/// Splits the LLC/SNAP header off a data frame body, returning the ethertype and payload.
pub fn strip_llc_snap(body: &[u8]) -> Option<(u16, &[u8])> {
    if body.get(..6)? != LLC_SNAP_PREFIX {
        return None;
    }
    let ethertype = u16::from_be_bytes([*body.get(6)?, *body.get(7)?]);
    Some((ethertype, &body[LLC_SNAP_LENGTH..]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a beacon the way an AP would send it.
    pub(crate) fn beacon(
        bssid: MacAddress,
        ssid: &[u8],
        channel: u8,
        extra_elements: &[u8],
        privacy: bool,
    ) -> std::vec::Vec<u8> {
        let mut buffer = [0u8; MAX_MANAGEMENT_FRAME_LENGTH];
        let mut writer = FrameWriter::new(&mut buffer);
        let template = BeaconTemplate {
            bssid,
            beacon_interval: 100,
            capabilities: CapabilityInformation::new()
                .with_is_ess(true)
                .with_privacy(privacy),
            ssid: &Ssid::new(ssid).unwrap(),
            channel,
            rates: &[0x82, 0x84, 0x0b, 0x16],
            host_advertisement: None,
            extra_elements,
        };
        write_beacon(&mut writer, &template, 1).unwrap();
        writer.finish().to_vec()
    }

    const BSSID: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    #[test]
    fn parses_open_beacon() {
        let frame = beacon(BSSID, b"TestNet", 6, &[], false);
        let Frame::Beacon(info) = parse_frame(&frame).unwrap() else {
            panic!("Not a beacon.");
        };
        assert_eq!(info.bssid, BSSID);
        assert_eq!(info.ssid, Ssid::new(b"TestNet"));
        assert_eq!(info.channel, Some(6));
        assert!(info.compatible);
        assert_eq!(info.security.security, Security::Open);
        assert_eq!(info.beacon_interval, 100);
    }

    #[test]
    fn classifies_security() {
        let wep = beacon(BSSID, b"Wep", 1, &[], true);
        let Ok(Frame::Beacon(info)) = parse_frame(&wep) else {
            panic!();
        };
        assert_eq!(info.security.security, Security::Wep);
        assert_eq!(info.security.pairwise_cipher, Cipher::Wep40);

        #[rustfmt::skip]
        let rsn = [
            element_id::RSN, 22,
            0x01, 0x00,
            0x00, 0x0f, 0xac, 0x02,
            0x02, 0x00, 0x00, 0x0f, 0xac, 0x02, 0x00, 0x0f, 0xac, 0x04,
            0x01, 0x00, 0x00, 0x0f, 0xac, 0x02,
        ];
        let wpa2 = beacon(BSSID, b"Wpa2", 1, &rsn, true);
        let Ok(Frame::Beacon(info)) = parse_frame(&wpa2) else {
            panic!();
        };
        assert_eq!(
            info.security,
            SecurityInfo {
                security: Security::Wpa2,
                group_cipher: Cipher::Tkip,
                pairwise_cipher: Cipher::Ccmp,
                akm: AkmSuite::Psk,
            }
        );

        #[rustfmt::skip]
        let wpa = [
            element_id::VENDOR_SPECIFIC, 22,
            0x00, 0x50, 0xf2, 0x01,
            0x01, 0x00,
            0x00, 0x50, 0xf2, 0x02,
            0x01, 0x00, 0x00, 0x50, 0xf2, 0x02,
            0x01, 0x00, 0x00, 0x50, 0xf2, 0x02,
        ];
        let wpa = beacon(BSSID, b"Wpa", 1, &wpa, true);
        let Ok(Frame::Beacon(info)) = parse_frame(&wpa) else {
            panic!();
        };
        assert_eq!(info.security.security, Security::Wpa);
        assert_eq!(info.security.pairwise_cipher, Cipher::Tkip);
    }

    #[test]
    fn ofdm_only_basic_rates_are_incompatible() {
        let mut frame = beacon(BSSID, b"G only", 1, &[], false);
        // Mark 5.5 Mbit/s as basic rate.
        let rates = frame.iter().position(|byte| *byte == 0x0b).unwrap();
        frame[rates] |= 0x80;
        let Ok(Frame::Beacon(info)) = parse_frame(&frame) else {
            panic!();
        };
        assert!(!info.compatible);
    }

    #[test]
    fn host_beacon_carries_advertisement() {
        let advertisement = HostAdvertisement {
            game_id: 0x4144_5341,
            stream_code: 0x1234,
            max_peers: 4,
            current_peers: 1,
            accepting_peers: true,
            host_packet_size: 200,
            peer_packet_size: 100,
        };
        let mut buffer = [0u8; MAX_MANAGEMENT_FRAME_LENGTH];
        let mut writer = FrameWriter::new(&mut buffer);
        let template = BeaconTemplate {
            bssid: BSSID,
            beacon_interval: 100,
            capabilities: CapabilityInformation::new().with_is_ess(true),
            ssid: &Ssid::new(b"").unwrap(),
            channel: 11,
            rates: RateSet::Native.element_bytes(),
            host_advertisement: Some(&advertisement),
            extra_elements: &[],
        };
        write_beacon(&mut writer, &template, 7).unwrap();
        let Ok(Frame::Beacon(info)) = parse_frame(writer.finish()) else {
            panic!();
        };
        assert_eq!(info.host_advertisement, Some(advertisement));
        assert_eq!(info.channel, Some(11));
        assert!(info.ssid.unwrap().is_hidden());
    }

    #[test]
    fn association_response_masks_aid() {
        let mut buffer = [0u8; MAX_MANAGEMENT_FRAME_LENGTH];
        let mut writer = FrameWriter::new(&mut buffer);
        let station = MacAddress::new([0x02, 0, 0, 0, 0, 1]);
        write_association_response(&mut writer, station, BSSID, 3, StatusCode::Success, 2).unwrap();
        let Ok(Frame::AssociationResponse { header, status, aid }) = parse_frame(writer.finish()) else {
            panic!();
        };
        assert_eq!(header.address_1, station);
        assert_eq!(status, StatusCode::Success);
        assert_eq!(aid, 2);
    }

    #[test]
    fn data_frame_addressing() {
        let station = MacAddress::new([0x02, 0, 0, 0, 0, 1]);
        let server = MacAddress::new([0x02, 0, 0, 0, 0, 9]);
        let mut buffer = [0u8; 64];
        let mut writer = FrameWriter::new(&mut buffer);
        write_data(&mut writer, DataDirection::ToDs, BSSID, server, station, 5, true, 0x0800, b"ping").unwrap();
        let Ok(Frame::Data { header, body }) = parse_frame(writer.finish()) else {
            panic!();
        };
        assert!(header.frame_control.protected());
        assert_eq!(header.data_bssid(), BSSID);
        assert_eq!(header.data_addresses(), (server, station));
        assert_eq!(strip_llc_snap(body), Some((0x0800, &b"ping"[..])));
    }

    #[test]
    fn writer_refuses_overflow() {
        let mut buffer = [0u8; 10];
        let mut writer = FrameWriter::new(&mut buffer);
        assert_eq!(
            write_null_data(&mut writer, BSSID, BSSID, 0),
            Err(FrameError::BufferTooSmall)
        );
    }

    #[test]
    fn truncated_elements_end_iteration() {
        let elements = [0x00, 0x02, b'a', b'b', 0x01, 0x08, 0x82];
        let mut iter = Elements::new(&elements);
        assert_eq!(iter.next(), Some((0x00, &b"ab"[..])));
        assert_eq!(iter.next(), None);
    }
}
