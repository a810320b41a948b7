//! The link layer state machine running on the radio.
//!
//! It's driven by two entry points: [LinkStateMachine::tick], which is called periodically,
//! and [LinkStateMachine::on_frame_received], which the radio driver calls for every frame.
//! Neither ever blocks. Commands from the host are picked up at the start of a tick.
//!
//! ## Connecting
//! A connection attempt walks through authentication, association and, for WPA networks, the
//! key exchange. Every frame, that requires a reply, is resent after
//! [LinkConfig::resend_interval], if the reply doesn't arrive. Each resend, rejection and
//! restart after a deauthentication consumes one retry and once
//! [LinkConfig::retry_budget] is exceeded, the attempt ends in [Mode::CannotConnect].
//!
//! ## Hosting
//! In [Mode::AccessPoint], we send beacons advertising the session and answer authentication
//! and association requests from peers, which are tracked in the
//! [MultiplayerSessionTable](crate::MultiplayerSessionTable).

use embassy_time::{Duration, Instant};
use macro_bits::serializable_enum;

use crate::{
    ap_table::BeaconObservation,
    config::{HostParameters, LinkConfig},
    frame::{
        parse_frame, strip_llc_snap, write_association_request, write_association_response,
        write_authentication, write_beacon, write_data, write_deauthentication, write_null_data,
        write_probe_request, AuthAlgorithm, Authentication, BeaconInfo, BeaconTemplate,
        CapabilityInformation, DataDirection, Frame, FrameHeader, FrameResult, FrameWriter,
        HostAdvertisement, MacAddress, ManagementSubtype, RateSet, ReasonCode, Security,
        StatusCode, ETHERTYPE_EAPOL, MAX_FRAME_LENGTH,
    },
    radio::{KeyExchange, KeyExchangeState, RadioTransport, TxStatus},
    ring::{RingConsumer, RingError, RingProducer, RingResult},
    session::{PeerState, SessionError, MAX_PEERS},
    shared::{ConnectTarget, LinkCommand, SharedState, Statistics, RX_RING_SIZE, TX_RING_SIZE},
    sync::Processor,
};

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The coarse state of the link.
    pub enum Mode: u8 {
        #[default]
        Disabled => 0,
        Normal => 1,
        Scanning => 2,
        Connecting => 3,
        Connected => 4,
        CannotConnect => 5,
        AccessPoint => 6
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// How far the handshake with the AP has progressed.
    pub enum AuthLevel: u8 {
        #[default]
        Disconnected => 0,
        Authenticated => 1,
        Associated => 2,
        /// The AP disassociated us and the handshake restarts on the next tick.
        Deassociated => 3,
        Error => 4
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Why a connection attempt ended in [Mode::CannotConnect].
    pub enum LinkError: u8 {
        #[default]
        RetryBudgetExhausted => 1,
        AuthenticationRejected => 2,
        AssociationRejected => 3,
        KeyExchangeFailed => 4
    }
}

/// The order in which channels are visited during a scan.
///
/// Most APs sit on 1, 6 or 11, so those are visited three times per round.
const SCAN_ORDER: [u8; 19] = [1, 6, 11, 2, 7, 12, 1, 6, 11, 3, 8, 13, 1, 6, 11, 4, 9, 5, 10];
/// Large enough for any EAPOL key frame.
const EAPOL_BUFFER_LENGTH: usize = 512;
/// Destination, source and ethertype in front of every ring record.
const RECORD_HEADER_LENGTH: usize = 14;
/// Maximum length of a shared key challenge.
const CHALLENGE_LENGTH: usize = 253;

fn next_sequence_number(counter: &mut u16) -> u16 {
    let sequence_number = *counter;
    *counter = (sequence_number + 1) & 0x0fff;
    sequence_number
}
fn elapsed(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeStep {
    /// The first authentication frame is out.
    Authenticate,
    /// The shared key challenge was sent back encrypted.
    Challenge,
    Associate,
    /// Associated, the key exchange is running.
    KeyExchange,
    Done,
}

/// State of one connection attempt.
struct Handshake {
    step: HandshakeStep,
    algorithm: AuthAlgorithm,
    rate_set: RateSet,
    /// The association was already retried with the expanded rate set.
    expanded_rates_tried: bool,
    /// Shared key authentication was refused and we already fell back to open system.
    open_system_tried: bool,
    challenge: [u8; CHALLENGE_LENGTH],
    challenge_length: usize,
    sent_at: Instant,
}
impl Handshake {
    fn new(security: Security, now: Instant) -> Self {
        Self {
            step: HandshakeStep::Authenticate,
            algorithm: if security == Security::Wep {
                AuthAlgorithm::SharedKey
            } else {
                AuthAlgorithm::OpenSystem
            },
            rate_set: RateSet::Native,
            expanded_rates_tried: false,
            open_system_tried: false,
            challenge: [0u8; CHALLENGE_LENGTH],
            challenge_length: 0,
            sent_at: now,
        }
    }
    fn challenge(&self) -> &[u8] {
        &self.challenge[..self.challenge_length]
    }
}

/// The link layer of the radio.
pub struct LinkStateMachine<'a, T: RadioTransport, K: KeyExchange> {
    shared: &'a SharedState,
    transport: T,
    key_exchange: K,
    config: LinkConfig,
    address: MacAddress,
    now: Instant,

    mode: Mode,
    auth_level: AuthLevel,
    channel: u8,
    sequence_number: u16,
    retries: u8,

    scan_position: usize,
    channel_switched_at: Instant,

    target: Option<ConnectTarget>,
    handshake: Handshake,
    /// Frames to the AP have the protected bit set.
    protected: bool,
    last_tx: Instant,
    last_heard: Instant,

    host: Option<HostParameters>,
    next_beacon: Instant,
    current_peers: u8,

    rx: RingProducer<'a, RX_RING_SIZE>,
    tx: RingConsumer<'a, TX_RING_SIZE>,
    frame_buffer: [u8; MAX_FRAME_LENGTH],
}
impl<'a, T: RadioTransport, K: KeyExchange> LinkStateMachine<'a, T, K> {
    /// Attach to `shared` as the producer of the RX ring and consumer of the TX ring.
    pub fn new(
        shared: &'a SharedState,
        transport: T,
        key_exchange: K,
        config: LinkConfig,
    ) -> RingResult<Self> {
        let rx = shared.rx.producer().ok_or(RingError::InUse)?;
        let tx = shared.tx.consumer().ok_or(RingError::InUse)?;
        let address = transport.mac_address();
        shared.publish_mac_address(address);
        shared.publish_mode(Mode::Disabled);
        let start = Instant::from_ticks(0);
        Ok(Self {
            shared,
            transport,
            key_exchange,
            config,
            address,
            now: start,
            mode: Mode::Disabled,
            auth_level: AuthLevel::Disconnected,
            channel: 0,
            sequence_number: 0,
            retries: 0,
            scan_position: 0,
            channel_switched_at: start,
            target: None,
            handshake: Handshake::new(Security::Open, start),
            protected: false,
            last_tx: start,
            last_heard: start,
            host: None,
            next_beacon: start,
            current_peers: 0,
            rx,
            tx,
            frame_buffer: [0u8; MAX_FRAME_LENGTH],
        })
    }
    pub fn mode(&self) -> Mode {
        self.mode
    }
    pub fn auth_level(&self) -> AuthLevel {
        self.auth_level
    }
    pub fn channel(&self) -> u8 {
        self.channel
    }
    pub fn retries(&self) -> u8 {
        self.retries
    }
    pub fn target(&self) -> Option<&ConnectTarget> {
        self.target.as_ref()
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
    pub fn key_exchange(&self) -> &K {
        &self.key_exchange
    }

    // State bookkeeping

    fn set_mode(&mut self, mode: Mode) {
        if !matches!(mode, Mode::Connecting | Mode::Connected)
            && self.auth_level == AuthLevel::Associated
        {
            // The auth level goes first, so the host never sees it associated in another mode.
            self.set_auth_level(AuthLevel::Disconnected);
        }
        if self.mode != mode {
            debug!("Mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
        self.shared.publish_mode(mode);
    }
    fn set_auth_level(&mut self, auth_level: AuthLevel) {
        if self.auth_level != auth_level {
            trace!("Auth level {:?} -> {:?}", self.auth_level, auth_level);
        }
        self.auth_level = auth_level;
        self.shared.publish_auth_level(auth_level);
    }
    fn set_retries(&mut self, retries: u8) {
        self.retries = retries;
        self.shared.publish_retries(retries);
    }
    fn tune(&mut self, channel: u8) {
        self.channel = channel;
        self.transport.set_channel(channel);
        self.shared.publish_channel(channel);
    }
    /// Consume one retry. Returns false and ends the attempt, if the budget is exhausted.
    fn consume_retry(&mut self, failure: LinkError) -> bool {
        self.set_retries(self.retries.saturating_add(1));
        if self.retries > self.config.retry_budget {
            self.fail(failure);
            false
        } else {
            true
        }
    }
    fn fail(&mut self, failure: LinkError) {
        warn!("Connection attempt failed: {:?}", failure);
        if self.auth_level != AuthLevel::Disconnected {
            self.deauthenticate_from_ap(ReasonCode::Leaving);
        }
        self.key_exchange.reset();
        self.protected = false;
        self.set_auth_level(AuthLevel::Error);
        self.set_mode(Mode::CannotConnect);
        self.shared.publish_failure(Some(failure));
    }

    // Transmission

    /// Hand the first `length` bytes of the frame buffer to the radio.
    fn transmit_buffer(&mut self, length: usize) -> bool {
        let statistics = &self.shared.statistics;
        match self.transport.send_frame(&self.frame_buffer[..length]) {
            TxStatus::Accepted => {
                Statistics::count_packet(&statistics.tx_packets, &statistics.tx_bytes, length);
                self.last_tx = self.now;
                true
            }
            TxStatus::QueueFull => {
                Statistics::count(&statistics.tx_queue_full);
                false
            }
        }
    }
    /// Build a frame into the frame buffer and transmit it.
    fn send_with(
        &mut self,
        build: impl FnOnce(&mut FrameWriter<'_>, u16) -> FrameResult<()>,
    ) -> bool {
        let sequence_number = next_sequence_number(&mut self.sequence_number);
        let mut writer = FrameWriter::new(&mut self.frame_buffer);
        if let Err(err) = build(&mut writer, sequence_number) {
            error!("Failed to build frame: {:?}", err);
            return false;
        }
        let length = writer.len();
        self.transmit_buffer(length)
    }
    fn send_deauthentication(&mut self, receiver: MacAddress, bssid: MacAddress, reason: ReasonCode) {
        let address = self.address;
        self.send_with(|writer, sequence_number| {
            write_deauthentication(
                writer,
                ManagementSubtype::Deauthentication,
                receiver,
                address,
                bssid,
                sequence_number,
                reason,
            )
        });
    }
    fn deauthenticate_from_ap(&mut self, reason: ReasonCode) {
        if let Some(target) = self.target {
            let bssid = target.record.bssid;
            self.send_deauthentication(bssid, bssid, reason);
        }
    }
    fn send_probe_request(&mut self) {
        let address = self.address;
        self.send_with(|writer, sequence_number| {
            write_probe_request(writer, address, None, sequence_number)
        });
    }
    /// Send the frame for the current handshake step.
    fn send_handshake_frame(&mut self) {
        let Some(target) = self.target else {
            return;
        };
        let address = self.address;
        let bssid = target.record.bssid;
        let handshake = &self.handshake;
        let algorithm = handshake.algorithm;
        let rate_set = handshake.rate_set;
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        let challenge_length = handshake.challenge_length;
        challenge[..challenge_length].copy_from_slice(handshake.challenge());
        let step = handshake.step;
        match step {
            HandshakeStep::Authenticate => {
                self.send_with(|writer, sequence_number| {
                    write_authentication(
                        writer,
                        bssid,
                        address,
                        bssid,
                        sequence_number,
                        &Authentication {
                            algorithm,
                            sequence: 1,
                            status: StatusCode::Success,
                            challenge: None,
                        },
                        false,
                    )
                });
            }
            HandshakeStep::Challenge => {
                // The radio encrypts the challenge with the installed WEP key.
                self.send_with(|writer, sequence_number| {
                    write_authentication(
                        writer,
                        bssid,
                        address,
                        bssid,
                        sequence_number,
                        &Authentication {
                            algorithm,
                            sequence: 3,
                            status: StatusCode::Success,
                            challenge: Some(&challenge[..challenge_length]),
                        },
                        true,
                    )
                });
            }
            HandshakeStep::Associate => {
                let ssid = target.record.ssid.unwrap_or_default();
                let privacy = target.record.security.security != Security::Open;
                self.send_with(|writer, sequence_number| {
                    write_association_request(
                        writer,
                        bssid,
                        address,
                        sequence_number,
                        &ssid,
                        privacy,
                        rate_set,
                    )
                });
            }
            HandshakeStep::KeyExchange | HandshakeStep::Done => {}
        }
        self.handshake.sent_at = self.now;
    }
    /// Wrap an ethernet payload into a data frame to the AP.
    fn send_data_to_ap(&mut self, destination: MacAddress, ethertype: u16, payload: &[u8]) {
        let Some(target) = self.target else {
            return;
        };
        let (address, protected) = (self.address, self.protected);
        self.send_with(|writer, sequence_number| {
            write_data(
                writer,
                DataDirection::ToDs,
                target.record.bssid,
                destination,
                address,
                sequence_number,
                protected,
                ethertype,
                payload,
            )
        });
    }

    // Commands

    fn process_command(&mut self) {
        let Some((version, command)) = self.shared.commands.take(Processor::Radio) else {
            return;
        };
        let enabled = self.mode != Mode::Disabled;
        match command {
            LinkCommand::Enable => {
                if !enabled {
                    info!("Radio enabled.");
                    self.set_mode(Mode::Normal);
                }
            }
            LinkCommand::PowerOff => {
                if enabled {
                    self.leave_mode();
                    self.set_mode(Mode::Disabled);
                    info!("Radio disabled.");
                }
            }
            _ if !enabled => {
                warn!("Ignoring command, since the radio is disabled.");
            }
            LinkCommand::Stop => self.leave_mode(),
            LinkCommand::Scan => {
                self.leave_mode();
                self.start_scan();
            }
            LinkCommand::Connect(target) => {
                self.leave_mode();
                self.start_connecting(target);
            }
            LinkCommand::Host(parameters) => {
                self.leave_mode();
                self.start_hosting(parameters);
            }
        }
        self.shared.acknowledge(version);
    }
    /// Unwind the current mode and return to [Mode::Normal].
    fn leave_mode(&mut self) {
        match self.mode {
            Mode::Connecting | Mode::Connected => {
                if self.auth_level != AuthLevel::Disconnected {
                    self.deauthenticate_from_ap(ReasonCode::Leaving);
                }
                self.end_link();
            }
            Mode::CannotConnect => self.end_link(),
            Mode::AccessPoint => {
                let shared = self.shared;
                let bssid = self.address;
                if shared
                    .sessions
                    .kick_all(|peer| self.send_deauthentication(peer, bssid, ReasonCode::LeavingBss))
                    .is_err()
                {
                    // We can't reach the table right now, so tell everyone at once.
                    Statistics::count(&shared.statistics.lock_busy);
                    self.send_deauthentication(MacAddress::BROADCAST, bssid, ReasonCode::LeavingBss);
                }
                self.host = None;
                self.current_peers = 0;
            }
            _ => {}
        }
        self.set_auth_level(AuthLevel::Disconnected);
        self.set_mode(Mode::Normal);
    }
    fn end_link(&mut self) {
        self.key_exchange.reset();
        self.transport.install_key(None);
        self.protected = false;
        self.target = None;
        self.shared.publish_ap_slot(None);
        self.shared.publish_aid(0);
    }
    fn start_scan(&mut self) {
        self.shared.access_points.clear_all();
        self.scan_position = 0;
        self.tune(SCAN_ORDER[0]);
        self.channel_switched_at = self.now;
        self.set_mode(Mode::Scanning);
        self.send_probe_request();
    }
    fn start_connecting(&mut self, target: ConnectTarget) {
        let record = target.record;
        info!("Connecting to {:?} on channel {}.", record.bssid.octets(), record.channel);
        let slot = self
            .shared
            .access_points
            .find_bssid(Processor::Radio, record.bssid)
            .map(|(slot, _)| slot);
        self.shared.publish_ap_slot(slot);
        self.shared.publish_failure(None);
        self.shared.publish_aid(0);
        self.set_retries(0);
        self.target = Some(target);
        self.handshake = Handshake::new(record.security.security, self.now);
        self.protected = false;
        if record.security.security == Security::Wep {
            self.transport.install_key(target.key.as_ref());
        }
        self.tune(record.channel);
        self.last_heard = self.now;
        self.set_auth_level(AuthLevel::Disconnected);
        self.set_mode(Mode::Connecting);
        self.send_handshake_frame();
    }
    fn start_hosting(&mut self, parameters: HostParameters) {
        info!("Hosting on channel {} for up to {} peers.", parameters.channel, parameters.max_peers);
        if self
            .shared
            .sessions
            .reset(parameters.max_peers as usize)
            .is_err()
        {
            Statistics::count(&self.shared.statistics.lock_busy);
        }
        self.host = Some(parameters);
        self.current_peers = 0;
        self.tune(parameters.channel);
        self.next_beacon = self.now;
        self.set_auth_level(AuthLevel::Disconnected);
        self.set_mode(Mode::AccessPoint);
    }

    // Periodic work

    /// Advance the state machine. `now` must never go backwards.
    pub fn tick(&mut self, now: Instant) {
        self.now = now;
        self.process_command();
        match self.mode {
            Mode::Scanning => self.scan_tick(),
            Mode::Connecting => self.connecting_tick(),
            Mode::Connected => self.connected_tick(),
            Mode::AccessPoint => self.access_point_tick(),
            _ => self.discard_tx(),
        }
    }
    fn scan_tick(&mut self) {
        if elapsed(self.now, self.channel_switched_at) < self.config.scan_dwell {
            return;
        }
        self.scan_position = (self.scan_position + 1) % SCAN_ORDER.len();
        self.tune(SCAN_ORDER[self.scan_position]);
        self.shared.access_points.tick();
        self.channel_switched_at = self.now;
        self.send_probe_request();
    }
    fn connecting_tick(&mut self) {
        if self.auth_level == AuthLevel::Deassociated {
            self.restart_handshake();
            return;
        }
        if elapsed(self.now, self.handshake.sent_at) < self.config.resend_interval {
            return;
        }
        let failure = if self.handshake.step == HandshakeStep::KeyExchange {
            LinkError::KeyExchangeFailed
        } else {
            LinkError::RetryBudgetExhausted
        };
        if !self.consume_retry(failure) {
            return;
        }
        if self.handshake.step == HandshakeStep::KeyExchange {
            // The AP drives the key exchange, so there's nothing to resend.
            self.handshake.sent_at = self.now;
        } else {
            trace!("No reply, resending.");
            Statistics::count(&self.shared.statistics.retransmissions);
            self.send_handshake_frame();
        }
    }
    /// Start over with authentication, after the AP dropped us.
    fn restart_handshake(&mut self) {
        if !self.consume_retry(LinkError::RetryBudgetExhausted) {
            return;
        }
        self.key_exchange.reset();
        self.protected = false;
        self.handshake.step = HandshakeStep::Authenticate;
        self.handshake.sent_at = self.now;
        self.last_heard = self.now;
        self.shared.publish_aid(0);
        self.set_auth_level(AuthLevel::Disconnected);
        self.set_mode(Mode::Connecting);
        self.send_handshake_frame();
    }
    fn connected_tick(&mut self) {
        if elapsed(self.now, self.last_heard) >= self.config.link_loss_timeout {
            warn!("Lost the AP.");
            self.restart_handshake();
            return;
        }
        self.drain_tx();
        if elapsed(self.now, self.last_tx) >= self.config.keepalive_interval {
            if let Some(target) = self.target {
                let address = self.address;
                self.send_with(|writer, sequence_number| {
                    write_null_data(writer, target.record.bssid, address, sequence_number)
                });
            }
        }
    }
    fn access_point_tick(&mut self) {
        self.process_kicks();
        if let Ok(count) = self.shared.sessions.associated_count(Processor::Radio) {
            self.current_peers = count as u8;
        }
        if self.now >= self.next_beacon {
            self.send_beacon();
            self.next_beacon = self.now + self.config.beacon_period();
        }
        self.drain_tx();
    }
    fn process_kicks(&mut self) {
        let shared = self.shared;
        let bssid = self.address;
        let kicks = shared.take_kick_requests();
        let mut deferred = 0u16;
        for aid in (1..=MAX_PEERS as u16).filter(|aid| kicks & (1 << *aid) != 0) {
            match shared
                .sessions
                .kick(aid, |peer| self.send_deauthentication(peer, bssid, ReasonCode::Unspecified))
            {
                Err(SessionError::Busy) => deferred |= 1 << aid,
                Err(_) => debug!("Nobody to kick with AID {}.", aid),
                Ok(()) => debug!("Kicked AID {}.", aid),
            }
        }
        if deferred != 0 {
            Statistics::count(&shared.statistics.lock_busy);
            shared.defer_kick_requests(deferred);
        }
        if shared.take_kick_unassociated_request() {
            let kicked = shared.sessions.kick_unassociated(|peer| {
                self.send_deauthentication(peer, bssid, ReasonCode::NotAssociated)
            });
            if kicked.is_err() {
                Statistics::count(&shared.statistics.lock_busy);
                shared.request_kick_unassociated();
            }
        }
    }
    fn send_beacon(&mut self) {
        let Some(parameters) = self.host else {
            return;
        };
        let advertisement = HostAdvertisement {
            game_id: parameters.game_id,
            stream_code: parameters.stream_code,
            max_peers: parameters.max_peers,
            current_peers: self.current_peers,
            accepting_peers: self.shared.sessions.is_accepting(),
            host_packet_size: parameters.host_packet_size,
            peer_packet_size: parameters.peer_packet_size,
        };
        let template = BeaconTemplate {
            bssid: self.address,
            beacon_interval: self.config.beacon_interval,
            capabilities: CapabilityInformation::new()
                .with_is_ess(true)
                .with_short_preamble(true),
            ssid: &parameters.ssid,
            channel: parameters.channel,
            rates: RateSet::Native.element_bytes(),
            host_advertisement: Some(&advertisement),
            extra_elements: &[],
        };
        self.send_with(|writer, sequence_number| write_beacon(writer, &template, sequence_number));
    }
    /// Turn TX ring records into data frames.
    ///
    /// Every record starts with the destination, source and ethertype, followed by the payload.
    fn drain_tx(&mut self) {
        let bssid = match self.mode {
            Mode::Connected => match self.target {
                Some(target) => target.record.bssid,
                None => return,
            },
            _ => self.address,
        };
        let direction = if self.mode == Mode::AccessPoint {
            DataDirection::FromDs
        } else {
            DataDirection::ToDs
        };
        for _ in 0..self.config.tx_burst {
            let length = {
                let Some(record) = self.tx.try_pop() else {
                    break;
                };
                let record = record.as_slice();
                let (Some(destination), Some(&[high, low])) =
                    (MacAddress::from_slice(record), record.get(12..RECORD_HEADER_LENGTH))
                else {
                    debug!("Dropping malformed TX record.");
                    continue;
                };
                let sequence_number = next_sequence_number(&mut self.sequence_number);
                let mut writer = FrameWriter::new(&mut self.frame_buffer);
                let result = write_data(
                    &mut writer,
                    direction,
                    bssid,
                    destination,
                    self.address,
                    sequence_number,
                    self.protected,
                    u16::from_be_bytes([high, low]),
                    &record[RECORD_HEADER_LENGTH..],
                );
                if result.is_err() {
                    debug!("TX record too large for a frame.");
                    continue;
                }
                writer.len()
            };
            // The record is released at this point.
            self.transmit_buffer(length);
        }
    }
    fn discard_tx(&mut self) {
        while self.tx.try_pop().is_some() {}
    }

    // Reception

    /// Process a frame received on the current channel.
    pub fn on_frame_received(&mut self, bytes: &[u8], rssi: u8, now: Instant) {
        self.now = now;
        if self.mode == Mode::Disabled {
            return;
        }
        let frame = match parse_frame(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                trace!("Dropping unparsable frame: {:?}", err);
                return;
            }
        };
        match frame {
            Frame::Beacon(info) | Frame::ProbeResponse(info) => self.on_beacon(&info, rssi),
            Frame::Authentication { header, body } => match self.mode {
                Mode::Connecting => self.on_authentication(&header, &body),
                Mode::AccessPoint => self.on_peer_authentication(&header, &body),
                _ => {}
            },
            Frame::AssociationResponse {
                header,
                status,
                aid,
            } if self.mode == Mode::Connecting => self.on_association_response(&header, status, aid),
            Frame::AssociationRequest { header, .. } if self.mode == Mode::AccessPoint => {
                self.on_peer_association(&header)
            }
            Frame::Deauthentication { header, reason } => self.on_deauthentication(&header, reason, true),
            Frame::Disassociation { header, reason } => self.on_deauthentication(&header, reason, false),
            Frame::Data { header, body } => self.on_data(&header, body),
            _ => {}
        }
    }
    fn is_from_target(&self, header: &FrameHeader) -> bool {
        self.target
            .is_some_and(|target| header.address_1 == self.address && header.address_2 == target.record.bssid)
    }
    fn on_beacon(&mut self, info: &BeaconInfo, rssi: u8) {
        let Some(observation) = BeaconObservation::new(info, rssi, self.channel) else {
            trace!("Ignoring AP on an unusable channel.");
            return;
        };
        let slot = match self.shared.access_points.add_or_update(&observation) {
            Ok(slot) => Some(slot),
            Err(_) => {
                Statistics::count(&self.shared.statistics.lock_busy);
                None
            }
        };
        if self
            .target
            .is_some_and(|target| target.record.bssid == info.bssid)
        {
            self.last_heard = self.now;
            if let Some(rssi) = observation.rssi {
                self.shared.publish_rssi(rssi);
            }
            if slot.is_some() {
                self.shared.publish_ap_slot(slot);
            }
        }
    }
    fn on_authentication(&mut self, header: &FrameHeader, body: &Authentication<'_>) {
        if !self.is_from_target(header) {
            return;
        }
        self.last_heard = self.now;
        match (self.handshake.step, body.sequence) {
            (HandshakeStep::Authenticate, 2) if body.status == StatusCode::Success => {
                match (body.algorithm, body.challenge) {
                    (AuthAlgorithm::SharedKey, Some(challenge)) => {
                        let length = challenge.len().min(CHALLENGE_LENGTH);
                        self.handshake.challenge[..length].copy_from_slice(&challenge[..length]);
                        self.handshake.challenge_length = length;
                        self.handshake.step = HandshakeStep::Challenge;
                        self.send_handshake_frame();
                    }
                    (AuthAlgorithm::SharedKey, None) => {
                        self.reject(LinkError::AuthenticationRejected, body.status);
                    }
                    _ => self.authenticated(),
                }
            }
            (HandshakeStep::Authenticate, 2)
                if body.status == StatusCode::UnsupportedAuthAlgorithm
                    && self.handshake.algorithm == AuthAlgorithm::SharedKey
                    && !self.handshake.open_system_tried =>
            {
                debug!("Shared key authentication refused, falling back to open system.");
                self.handshake.algorithm = AuthAlgorithm::OpenSystem;
                self.handshake.open_system_tried = true;
                self.send_handshake_frame();
            }
            (HandshakeStep::Challenge, 4) if body.status == StatusCode::Success => self.authenticated(),
            (HandshakeStep::Authenticate, 2) | (HandshakeStep::Challenge, 4) => {
                self.handshake.step = HandshakeStep::Authenticate;
                self.reject(LinkError::AuthenticationRejected, body.status);
            }
            _ => trace!("Ignoring stale authentication frame."),
        }
    }
    fn authenticated(&mut self) {
        self.set_auth_level(AuthLevel::Authenticated);
        self.handshake.step = HandshakeStep::Associate;
        self.send_handshake_frame();
    }
    /// The AP refused the current step. The step is retried right away, while there's budget.
    fn reject(&mut self, failure: LinkError, status: StatusCode) {
        warn!("Handshake rejected with status {}.", status.into_bits());
        if self.consume_retry(failure) {
            self.send_handshake_frame();
        }
    }
    fn on_association_response(&mut self, header: &FrameHeader, status: StatusCode, aid: u16) {
        if !self.is_from_target(header) || self.handshake.step != HandshakeStep::Associate {
            return;
        }
        self.last_heard = self.now;
        let Some(target) = self.target else {
            return;
        };
        match status {
            StatusCode::Success => {
                self.shared.publish_aid(aid);
                self.set_auth_level(AuthLevel::Associated);
                let security = target.record.security;
                if security.security.is_wpa() {
                    let Some(key) = target.key else {
                        self.fail(LinkError::KeyExchangeFailed);
                        return;
                    };
                    self.handshake.step = HandshakeStep::KeyExchange;
                    self.handshake.sent_at = self.now;
                    self.key_exchange.begin(target.record.bssid, &security, &key);
                } else {
                    self.protected = security.security == Security::Wep;
                    self.link_established();
                }
            }
            StatusCode::UnsupportedRates if !self.handshake.expanded_rates_tried => {
                debug!("Rates refused, retrying with the expanded rate set.");
                self.handshake.rate_set = RateSet::Expanded;
                self.handshake.expanded_rates_tried = true;
                if self.consume_retry(LinkError::AssociationRejected) {
                    self.send_handshake_frame();
                }
            }
            StatusCode::UnsupportedRates => {
                debug!("Expanded rate set refused too.");
                self.fail(LinkError::AssociationRejected);
            }
            _ => self.reject(LinkError::AssociationRejected, status),
        }
    }
    fn link_established(&mut self) {
        self.handshake.step = HandshakeStep::Done;
        self.last_tx = self.now;
        self.last_heard = self.now;
        self.set_mode(Mode::Connected);
        info!("Link established.");
    }
    fn on_deauthentication(&mut self, header: &FrameHeader, reason: ReasonCode, deauthentication: bool) {
        match self.mode {
            Mode::Connecting | Mode::Connected if self.is_from_target(header) => {
                debug!("AP dropped us, reason {}.", reason.into_bits());
                if deauthentication {
                    self.restart_handshake();
                } else {
                    // Restarted on the next tick.
                    self.handshake.step = HandshakeStep::Authenticate;
                    self.protected = false;
                    self.set_auth_level(AuthLevel::Deassociated);
                    self.set_mode(Mode::Connecting);
                }
            }
            Mode::AccessPoint if header.address_1 == self.address => {
                match self.shared.sessions.disconnect(header.address_2) {
                    Err(SessionError::Busy) => Statistics::count(&self.shared.statistics.lock_busy),
                    _ => debug!("Peer {:?} left.", header.address_2.octets()),
                }
            }
            _ => {}
        }
    }
    fn on_peer_authentication(&mut self, header: &FrameHeader, body: &Authentication<'_>) {
        if header.address_1 != self.address || body.sequence != 1 {
            return;
        }
        let peer = header.address_2;
        let status = if body.algorithm != AuthAlgorithm::OpenSystem {
            StatusCode::UnsupportedAuthAlgorithm
        } else {
            match self.shared.sessions.authenticate(peer) {
                Ok(_) => StatusCode::Success,
                Err(SessionError::Busy) => {
                    // The peer will try again.
                    Statistics::count(&self.shared.statistics.lock_busy);
                    return;
                }
                Err(SessionError::Full) => StatusCode::ApFull,
                Err(_) => StatusCode::UnspecifiedFailure,
            }
        };
        let (address, algorithm) = (self.address, body.algorithm);
        self.send_with(|writer, sequence_number| {
            write_authentication(
                writer,
                peer,
                address,
                address,
                sequence_number,
                &Authentication {
                    algorithm,
                    sequence: 2,
                    status,
                    challenge: None,
                },
                false,
            )
        });
    }
    fn on_peer_association(&mut self, header: &FrameHeader) {
        if header.address_1 != self.address {
            return;
        }
        let peer = header.address_2;
        let (status, aid) = match self.shared.sessions.associate(peer) {
            Ok(aid) => (StatusCode::Success, aid),
            Err(SessionError::Busy) => {
                Statistics::count(&self.shared.statistics.lock_busy);
                return;
            }
            Err(_) => (StatusCode::UnspecifiedFailure, 0),
        };
        let address = self.address;
        self.send_with(|writer, sequence_number| {
            write_association_response(writer, peer, address, sequence_number, status, aid)
        });
    }
    fn on_data(&mut self, header: &FrameHeader, body: &[u8]) {
        let control = header.frame_control;
        let (destination, source) = header.data_addresses();
        match self.mode {
            Mode::Connected | Mode::Connecting => {
                let Some(target) = self.target else {
                    return;
                };
                if !control.from_ds()
                    || control.to_ds()
                    || header.data_bssid() != target.record.bssid
                    || !(destination == self.address || destination.is_multicast())
                {
                    return;
                }
                self.last_heard = self.now;
                let Some((ethertype, payload)) = strip_llc_snap(body) else {
                    return;
                };
                if ethertype == ETHERTYPE_EAPOL {
                    self.on_eapol(payload);
                } else if self.mode == Mode::Connected {
                    self.push_rx(destination, source, ethertype, payload);
                }
            }
            Mode::AccessPoint => {
                if !control.to_ds() || control.from_ds() || header.data_bssid() != self.address {
                    return;
                }
                match self.shared.sessions.state_of(Processor::Radio, source) {
                    Ok(PeerState::Associated) => {}
                    Err(SessionError::Busy) => {
                        Statistics::count(&self.shared.statistics.lock_busy);
                        return;
                    }
                    _ => {
                        // Tell the peer to start over.
                        let address = self.address;
                        self.send_deauthentication(source, address, ReasonCode::NotAssociated);
                        return;
                    }
                }
                if let Some((ethertype, payload)) = strip_llc_snap(body) {
                    self.push_rx(destination, source, ethertype, payload);
                }
            }
            _ => {}
        }
    }
    fn on_eapol(&mut self, payload: &[u8]) {
        let Some(target) = self.target else {
            return;
        };
        let mut reply = [0u8; EAPOL_BUFFER_LENGTH];
        let step = self.key_exchange.on_eapol(payload, &mut reply);
        if let Some(reply) = reply.get(..step.reply_length).filter(|reply| !reply.is_empty()) {
            self.send_data_to_ap(target.record.bssid, ETHERTYPE_EAPOL, reply);
        }
        match step.state {
            KeyExchangeState::InProgress => {}
            KeyExchangeState::Complete => {
                self.protected = true;
                if self.handshake.step == HandshakeStep::KeyExchange {
                    self.link_established();
                }
            }
            KeyExchangeState::Failed => self.fail(LinkError::KeyExchangeFailed),
        }
    }
    /// Hand a received payload to the host.
    fn push_rx(&mut self, destination: MacAddress, source: MacAddress, ethertype: u16, payload: &[u8]) {
        let length = RECORD_HEADER_LENGTH + payload.len();
        let pushed = self.rx.push_with(length, |record| {
            record[..6].copy_from_slice(&destination.octets());
            record[6..12].copy_from_slice(&source.octets());
            record[12..RECORD_HEADER_LENGTH].copy_from_slice(&ethertype.to_be_bytes());
            record[RECORD_HEADER_LENGTH..].copy_from_slice(payload);
        });
        if pushed.is_ok() {
            let statistics = &self.shared.statistics;
            Statistics::count_packet(&statistics.rx_packets, &statistics.rx_bytes, length);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        ap_table::AccessPointRecord,
        config::KeyMaterial,
        frame::{tests::beacon, SecurityInfo, Ssid},
        radio::KeyExchangeStep,
    };

    const STATION: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const AP: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const PEER: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    const OTHER_PEER: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x03]);

    #[derive(Default)]
    struct MockRadio {
        sent: Vec<Vec<u8>>,
        channel: u8,
        key: Option<KeyMaterial>,
    }
    impl MockRadio {
        fn last(&self) -> Frame<'_> {
            parse_frame(self.sent.last().expect("Nothing was sent.")).unwrap()
        }
    }
    impl RadioTransport for MockRadio {
        fn send_frame(&mut self, frame: &[u8]) -> TxStatus {
            self.sent.push(frame.to_vec());
            TxStatus::Accepted
        }
        fn set_channel(&mut self, channel: u8) {
            self.channel = channel;
        }
        fn mac_address(&self) -> MacAddress {
            STATION
        }
        fn install_key(&mut self, key: Option<&KeyMaterial>) {
            self.key = key.copied();
        }
    }

    /// Completes after two EAPOL messages, answering each with four bytes.
    #[derive(Default)]
    struct MockKeys {
        received: usize,
        begun: bool,
    }
    impl KeyExchange for MockKeys {
        fn begin(&mut self, authenticator: MacAddress, _security: &SecurityInfo, _key: &KeyMaterial) {
            assert_eq!(authenticator, AP);
            self.begun = true;
        }
        fn on_eapol(&mut self, _payload: &[u8], reply: &mut [u8]) -> KeyExchangeStep {
            self.received += 1;
            reply[..4].copy_from_slice(&[0x01, 0x03, 0x00, self.received as u8]);
            KeyExchangeStep {
                state: if self.received >= 2 {
                    KeyExchangeState::Complete
                } else {
                    KeyExchangeState::InProgress
                },
                reply_length: 4,
            }
        }
        fn reset(&mut self) {
            self.received = 0;
            self.begun = false;
        }
    }

    type Machine<'a> = LinkStateMachine<'a, MockRadio, MockKeys>;

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }
    fn build(f: impl FnOnce(&mut FrameWriter<'_>) -> FrameResult<()>) -> Vec<u8> {
        let mut buffer = [0u8; MAX_FRAME_LENGTH];
        let mut writer = FrameWriter::new(&mut buffer);
        f(&mut writer).unwrap();
        writer.finish().to_vec()
    }
    fn auth_reply(algorithm: AuthAlgorithm, sequence: u16, status: StatusCode, challenge: Option<&[u8]>) -> Vec<u8> {
        build(|writer| {
            write_authentication(
                writer,
                STATION,
                AP,
                AP,
                0,
                &Authentication {
                    algorithm,
                    sequence,
                    status,
                    challenge,
                },
                false,
            )
        })
    }
    fn association_reply(status: StatusCode, aid: u16) -> Vec<u8> {
        build(|writer| write_association_response(writer, STATION, AP, 0, status, aid))
    }
    fn from_ap(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        build(|writer| {
            write_data(writer, DataDirection::FromDs, AP, STATION, PEER, 0, false, ethertype, payload)
        })
    }
    fn target(security: Security, key: Option<&[u8]>) -> ConnectTarget {
        ConnectTarget {
            record: AccessPointRecord {
                bssid: AP,
                ssid: Ssid::new(b"TestNet"),
                channel: 6,
                security: SecurityInfo {
                    security,
                    ..Default::default()
                },
                compatible: true,
                ..Default::default()
            },
            key: key.map(|key| KeyMaterial::new(key).unwrap()),
        }
    }
    fn enabled(shared: &SharedState) -> Machine<'_> {
        let mut machine =
            LinkStateMachine::new(shared, MockRadio::default(), MockKeys::default(), LinkConfig::default())
                .unwrap();
        shared.post_command(LinkCommand::Enable).unwrap();
        machine.tick(at(0));
        assert_eq!(machine.mode(), Mode::Normal);
        machine
    }
    /// Connect to an open AP at t = 0.
    fn connected(shared: &SharedState) -> Machine<'_> {
        let mut machine = enabled(shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(0),
        );
        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(0));
        assert_eq!(machine.mode(), Mode::Connected);
        machine
    }

    #[test]
    fn ring_handles_are_exclusive() {
        let shared = SharedState::new();
        let machine = enabled(&shared);
        assert!(matches!(
            LinkStateMachine::new(&shared, MockRadio::default(), MockKeys::default(), LinkConfig::default()),
            Err(RingError::InUse)
        ));
        drop(machine);
        assert!(shared.rx.producer().is_some());
        assert_eq!(shared.mac_address(), STATION);
    }

    #[test]
    fn commands_need_an_enabled_radio() {
        let shared = SharedState::new();
        let mut machine =
            LinkStateMachine::new(&shared, MockRadio::default(), MockKeys::default(), LinkConfig::default())
                .unwrap();
        let version = shared.post_command(LinkCommand::Scan).unwrap();
        machine.tick(at(0));
        assert_eq!(machine.mode(), Mode::Disabled);
        assert_eq!(shared.status().acknowledged, version);
        assert!(machine.transport().sent.is_empty());
    }

    #[test]
    fn scan_rotates_channels() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let dwell = LinkConfig::default().scan_dwell.as_millis();
        shared.post_command(LinkCommand::Scan).unwrap();
        machine.tick(at(0));
        assert_eq!(machine.mode(), Mode::Scanning);

        let mut now = 0;
        for expected in SCAN_ORDER.iter().chain(&SCAN_ORDER[..3]) {
            assert_eq!(machine.transport().channel, *expected);
            assert_eq!(shared.status().channel, *expected);
            assert!(matches!(machine.transport().last(), Frame::ProbeRequest { .. }));
            // Nothing happens before the dwell time is up.
            machine.tick(at(now + dwell - 1));
            assert_eq!(machine.channel(), *expected);
            now += dwell;
            machine.tick(at(now));
        }
        assert_eq!(machine.transport().sent.len(), SCAN_ORDER.len() + 4);

        let channel = machine.channel();
        machine.on_frame_received(&beacon(AP, b"TestNet", channel, &[], false), 40, at(now));
        let record = shared.access_points.get(Processor::Host, 0).unwrap();
        assert_eq!(record.bssid, AP);
        assert_eq!(record.rssi.latest(), Some(40));
    }

    #[test]
    fn connects_to_open_network() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let version = shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(0));
        assert_eq!(machine.mode(), Mode::Connecting);
        assert_eq!(machine.transport().channel, 6);
        let Frame::Authentication { header, body } = machine.transport().last() else {
            panic!("Expected an authentication frame.");
        };
        assert_eq!(header.address_1, AP);
        assert_eq!((body.algorithm, body.sequence), (AuthAlgorithm::OpenSystem, 1));

        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(10),
        );
        assert_eq!(machine.auth_level(), AuthLevel::Authenticated);
        let Frame::AssociationRequest { ssid, .. } = machine.transport().last() else {
            panic!("Expected an association request.");
        };
        assert_eq!(ssid, Ssid::new(b"TestNet"));

        machine.on_frame_received(&association_reply(StatusCode::Success, 3), 40, at(20));
        let status = shared.status();
        assert_eq!(status.mode, Mode::Connected);
        assert_eq!(status.auth_level, AuthLevel::Associated);
        assert_eq!(status.aid, 3);
        assert_eq!(status.retries, 0);
        assert_eq!(status.acknowledged, version);
        assert_eq!(status.failure, None);
    }

    #[test]
    fn frames_from_other_aps_are_ignored() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(0));
        let stranger = build(|writer| {
            write_authentication(
                writer,
                STATION,
                PEER,
                PEER,
                0,
                &Authentication {
                    algorithm: AuthAlgorithm::OpenSystem,
                    sequence: 2,
                    status: StatusCode::Success,
                    challenge: None,
                },
                false,
            )
        });
        machine.on_frame_received(&stranger, 40, at(10));
        assert_eq!(machine.auth_level(), AuthLevel::Disconnected);
        machine.on_frame_received(&[0x00; 10], 40, at(10));
        assert_eq!(machine.transport().sent.len(), 1);
    }

    #[test]
    fn unsupported_rates_retry_with_expanded_set() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(0),
        );
        assert!(machine.transport().sent.last().unwrap().ends_with(RateSet::Native.element_bytes()));

        machine.on_frame_received(&association_reply(StatusCode::UnsupportedRates, 0), 40, at(10));
        assert_eq!(machine.retries(), 1);
        assert_eq!(machine.mode(), Mode::Connecting);
        assert!(machine.transport().sent.last().unwrap().ends_with(RateSet::Expanded.element_bytes()));

        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(20));
        assert_eq!(machine.mode(), Mode::Connected);
    }

    #[test]
    fn expanded_rates_are_tried_only_once() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(0),
        );
        machine.on_frame_received(&association_reply(StatusCode::UnsupportedRates, 0), 40, at(10));
        machine.on_frame_received(&association_reply(StatusCode::UnsupportedRates, 0), 40, at(20));

        assert_eq!(machine.mode(), Mode::CannotConnect);
        assert_eq!(shared.status().failure, Some(LinkError::AssociationRejected));
        let expanded_requests = machine
            .transport()
            .sent
            .iter()
            .filter(|frame| {
                matches!(parse_frame(frame), Ok(Frame::AssociationRequest { .. }))
                    && frame.ends_with(RateSet::Expanded.element_bytes())
            })
            .count();
        assert_eq!(expanded_requests, 1);

        // Nothing more is sent for the failed attempt.
        let sent = machine.transport().sent.len();
        machine.on_frame_received(&association_reply(StatusCode::UnsupportedRates, 0), 40, at(30));
        machine.tick(at(1_000));
        assert_eq!(machine.transport().sent.len(), sent);
    }

    #[test]
    fn aps_on_unusable_channels_are_ignored() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared.post_command(LinkCommand::Scan).unwrap();
        machine.tick(at(0));
        machine.on_frame_received(&beacon(AP, b"TestNet", 14, &[], false), 40, at(10));
        assert_eq!(shared.access_points.active_count(Processor::Host), 0);
        machine.on_frame_received(&beacon(AP, b"TestNet", 1, &[], false), 40, at(20));
        assert_eq!(shared.access_points.get(Processor::Host, 0).unwrap().channel, 1);
    }

    #[test]
    fn shared_key_authentication() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Wep, Some(b"12345"))))
            .unwrap();
        machine.tick(at(0));
        assert_eq!(machine.transport().key.unwrap().as_bytes(), b"12345");
        let Frame::Authentication { body, .. } = machine.transport().last() else {
            panic!();
        };
        assert_eq!(body.algorithm, AuthAlgorithm::SharedKey);

        let challenge = [0x42; 128];
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::SharedKey, 2, StatusCode::Success, Some(&challenge)),
            40,
            at(10),
        );
        let Frame::Authentication { header, body } = machine.transport().last() else {
            panic!();
        };
        assert!(header.frame_control.protected());
        assert_eq!(body.sequence, 3);
        assert_eq!(body.challenge, Some(&challenge[..]));

        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::SharedKey, 4, StatusCode::Success, None),
            40,
            at(20),
        );
        assert_eq!(machine.auth_level(), AuthLevel::Authenticated);
        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(30));
        assert_eq!(machine.mode(), Mode::Connected);

        // Data to the AP is protected now.
        let mut producer = shared.tx.producer().unwrap();
        producer
            .push(&[&[0xff; 6][..], &STATION.octets()[..], &[0x08, 0x00][..], &b"ping"[..]].concat())
            .unwrap();
        machine.tick(at(40));
        let Frame::Data { header, .. } = machine.transport().last() else {
            panic!();
        };
        assert!(header.frame_control.protected());
    }

    #[test]
    fn shared_key_falls_back_to_open_system() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Wep, Some(b"12345"))))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::SharedKey, 2, StatusCode::UnsupportedAuthAlgorithm, None),
            40,
            at(10),
        );
        let Frame::Authentication { body, .. } = machine.transport().last() else {
            panic!();
        };
        assert_eq!((body.algorithm, body.sequence), (AuthAlgorithm::OpenSystem, 1));
        assert_eq!(machine.retries(), 0);

        // A second refusal counts against the budget.
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::UnsupportedAuthAlgorithm, None),
            40,
            at(20),
        );
        assert_eq!(machine.retries(), 1);
        assert_eq!(machine.mode(), Mode::Connecting);
    }

    #[test]
    fn retry_budget_exhaustion_fails_the_attempt() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let config = LinkConfig::default();
        let interval = config.resend_interval.as_millis();
        shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(0));
        for attempt in 1..=config.retry_budget as u64 {
            machine.tick(at(attempt * interval - 1));
            assert_eq!(machine.retries() as u64, attempt - 1);
            machine.tick(at(attempt * interval));
            assert_eq!(machine.mode(), Mode::Connecting);
        }
        machine.tick(at((config.retry_budget as u64 + 1) * interval));

        let status = shared.status();
        assert_eq!(status.mode, Mode::CannotConnect);
        assert_eq!(status.auth_level, AuthLevel::Error);
        assert_eq!(status.failure, Some(LinkError::RetryBudgetExhausted));
        assert_eq!(machine.transport().sent.len(), config.retry_budget as usize + 1);
        assert_eq!(
            shared.statistics.snapshot().retransmissions,
            config.retry_budget as u32
        );

        // A new attempt starts from scratch.
        shared
            .post_command(LinkCommand::Connect(target(Security::Open, None)))
            .unwrap();
        machine.tick(at(10_000));
        let status = shared.status();
        assert_eq!(status.mode, Mode::Connecting);
        assert_eq!(status.failure, None);
        assert_eq!(status.retries, 0);
    }

    #[test]
    fn dropped_by_the_ap() {
        let shared = SharedState::new();
        let mut machine = connected(&shared);
        let disassociation = build(|writer| {
            write_deauthentication(
                writer,
                ManagementSubtype::Disassociation,
                STATION,
                AP,
                AP,
                0,
                ReasonCode::Inactivity,
            )
        });
        machine.on_frame_received(&disassociation, 40, at(100));
        assert_eq!(machine.auth_level(), AuthLevel::Deassociated);
        assert_eq!(machine.mode(), Mode::Connecting);
        let sent = machine.transport().sent.len();

        machine.tick(at(110));
        assert_eq!(machine.auth_level(), AuthLevel::Disconnected);
        assert_eq!(machine.retries(), 1);
        assert_eq!(machine.transport().sent.len(), sent + 1);
        assert!(matches!(machine.transport().last(), Frame::Authentication { .. }));

        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(120),
        );
        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(130));
        assert_eq!(machine.mode(), Mode::Connected);

        let deauthentication = build(|writer| {
            write_deauthentication(
                writer,
                ManagementSubtype::Deauthentication,
                STATION,
                AP,
                AP,
                0,
                ReasonCode::Unspecified,
            )
        });
        machine.on_frame_received(&deauthentication, 40, at(200));
        assert_eq!(machine.mode(), Mode::Connecting);
        assert_eq!(machine.auth_level(), AuthLevel::Disconnected);
        assert_eq!(machine.retries(), 2);
        assert!(matches!(machine.transport().last(), Frame::Authentication { .. }));
    }

    #[test]
    fn stopping_deauthenticates() {
        let shared = SharedState::new();
        let mut machine = connected(&shared);
        shared.post_command(LinkCommand::Stop).unwrap();
        machine.tick(at(100));
        let Frame::Deauthentication { header, reason } = machine.transport().last() else {
            panic!("Expected a deauthentication.");
        };
        assert_eq!(header.address_1, AP);
        assert_eq!(reason, ReasonCode::Leaving);
        let status = shared.status();
        assert_eq!(status.mode, Mode::Normal);
        assert_eq!(status.auth_level, AuthLevel::Disconnected);
        assert_eq!(status.ap_slot, None);
        assert!(machine.target().is_none());

        shared.post_command(LinkCommand::PowerOff).unwrap();
        machine.tick(at(200));
        assert_eq!(machine.mode(), Mode::Disabled);
    }

    #[test]
    fn keepalive_and_link_loss() {
        let shared = SharedState::new();
        let mut machine = connected(&shared);
        let ap_beacon = beacon(AP, b"TestNet", 6, &[], false);
        machine.on_frame_received(&ap_beacon, 35, at(9_000));
        assert_eq!(shared.status().rssi, 35);
        assert_eq!(shared.status().ap_slot, Some(0));
        machine.on_frame_received(&ap_beacon, 35, at(18_000));
        let sent = machine.transport().sent.len();
        machine.tick(at(19_999));
        assert_eq!(machine.transport().sent.len(), sent);
        machine.tick(at(20_000));
        let Frame::Other = machine.transport().last() else {
            panic!("Expected a null frame.");
        };
        let null = machine.transport().sent.last().unwrap();
        assert_eq!(FrameHeader::parse(null).unwrap().0.address_1, AP);

        machine.tick(at(27_999));
        assert_eq!(machine.mode(), Mode::Connected);
        machine.tick(at(28_000));
        assert_eq!(machine.mode(), Mode::Connecting);
        assert_eq!(machine.retries(), 1);
    }

    #[test]
    fn data_flows_through_the_rings() {
        let shared = SharedState::new();
        let mut machine = connected(&shared);
        let mut host_rx = shared.rx.consumer().unwrap();
        let mut host_tx = shared.tx.producer().unwrap();

        machine.on_frame_received(&from_ap(0x0800, b"hello"), 40, at(10));
        {
            let record = host_rx.try_pop().unwrap();
            let record = record.as_slice();
            assert_eq!(&record[..6], &STATION.octets());
            assert_eq!(&record[6..12], &PEER.octets());
            assert_eq!(&record[12..], &[0x08, 0x00, b'h', b'e', b'l', b'l', b'o']);
        }
        assert_eq!(shared.statistics.snapshot().rx_packets, 1);

        let record = [&PEER.octets()[..], &STATION.octets()[..], &[0x08, 0x06][..], &b"arp"[..]].concat();
        host_tx.push(&record).unwrap();
        machine.tick(at(20));
        let Frame::Data { header, body } = machine.transport().last() else {
            panic!("Expected a data frame.");
        };
        assert!(header.frame_control.to_ds());
        assert!(!header.frame_control.protected());
        assert_eq!(header.data_bssid(), AP);
        assert_eq!(header.data_addresses(), (PEER, STATION));
        assert_eq!(strip_llc_snap(body), Some((0x0806, &b"arp"[..])));
        assert!(shared.tx.is_empty());

        // Other stations' traffic isn't ours.
        let foreign = build(|writer| {
            write_data(writer, DataDirection::FromDs, AP, PEER, OTHER_PEER, 0, false, 0x0800, b"x")
        });
        machine.on_frame_received(&foreign, 40, at(30));
        assert!(host_rx.try_pop().is_none());
    }

    #[test]
    fn tx_records_are_discarded_without_a_link() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let mut host_tx = shared.tx.producer().unwrap();
        host_tx.push(&[0u8; 20]).unwrap();
        machine.tick(at(10));
        assert!(shared.tx.is_empty());
        assert!(machine.transport().sent.is_empty());
    }

    #[test]
    fn wpa_waits_for_the_key_exchange() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Wpa2, Some(b"password"))))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(0),
        );
        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(0));
        assert!(machine.key_exchange().begun);
        assert_eq!(machine.auth_level(), AuthLevel::Associated);
        assert_eq!(machine.mode(), Mode::Connecting);

        // Data frames are held back until the keys are in place.
        let mut host_rx = shared.rx.consumer().unwrap();
        machine.on_frame_received(&from_ap(0x0800, b"early"), 40, at(5));
        assert!(host_rx.try_pop().is_none());

        machine.on_frame_received(&from_ap(ETHERTYPE_EAPOL, &[0x01, 0x03]), 40, at(10));
        let Frame::Data { body, .. } = machine.transport().last() else {
            panic!("Expected an EAPOL reply.");
        };
        assert_eq!(strip_llc_snap(body), Some((ETHERTYPE_EAPOL, &[0x01, 0x03, 0x00, 0x01][..])));
        assert_eq!(machine.mode(), Mode::Connecting);

        machine.on_frame_received(&from_ap(ETHERTYPE_EAPOL, &[0x01, 0x03]), 40, at(20));
        assert_eq!(machine.mode(), Mode::Connected);
        assert_eq!(machine.auth_level(), AuthLevel::Associated);
    }

    #[test]
    fn stalled_key_exchange_fails() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let config = LinkConfig::default();
        shared
            .post_command(LinkCommand::Connect(target(Security::Wpa, Some(b"password"))))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(0),
        );
        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(0));
        let sent = machine.transport().sent.len();
        let interval = config.resend_interval.as_millis();
        for attempt in 1..=config.retry_budget as u64 + 1 {
            machine.tick(at(attempt * interval));
        }
        assert_eq!(shared.status().failure, Some(LinkError::KeyExchangeFailed));
        assert_eq!(machine.mode(), Mode::CannotConnect);
        // Only the deauthentication was sent, nothing was resent.
        assert_eq!(machine.transport().sent.len(), sent + 1);
        assert!(!machine.key_exchange().begun);
    }

    #[test]
    fn wpa_without_key_fails() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        shared
            .post_command(LinkCommand::Connect(target(Security::Wpa2, None)))
            .unwrap();
        machine.tick(at(0));
        machine.on_frame_received(
            &auth_reply(AuthAlgorithm::OpenSystem, 2, StatusCode::Success, None),
            40,
            at(0),
        );
        machine.on_frame_received(&association_reply(StatusCode::Success, 1), 40, at(0));
        let status = shared.status();
        assert_eq!(status.mode, Mode::CannotConnect);
        assert_eq!(status.failure, Some(LinkError::KeyExchangeFailed));
    }

    fn peer_auth(peer: MacAddress) -> Vec<u8> {
        build(|writer| {
            write_authentication(
                writer,
                STATION,
                peer,
                STATION,
                0,
                &Authentication {
                    algorithm: AuthAlgorithm::OpenSystem,
                    sequence: 1,
                    status: StatusCode::Success,
                    challenge: None,
                },
                false,
            )
        })
    }
    fn last_auth_status(machine: &Machine<'_>) -> StatusCode {
        let Frame::Authentication { body, .. } = machine.transport().last() else {
            panic!("Expected an authentication frame.");
        };
        body.status
    }
    fn advertisement(machine: &Machine<'_>) -> HostAdvertisement {
        let Frame::Beacon(info) = machine.transport().last() else {
            panic!("Expected a beacon.");
        };
        info.host_advertisement.unwrap()
    }

    #[test]
    fn hosting_admits_peers() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let parameters = HostParameters::new(b"Session", 11, 0x1234_5678, 2, 64, 32).unwrap();
        shared.sessions.set_accepting(true);
        shared.post_command(LinkCommand::Host(parameters)).unwrap();
        machine.tick(at(0));
        assert_eq!(machine.mode(), Mode::AccessPoint);
        assert_eq!(machine.transport().channel, 11);
        let advertised = advertisement(&machine);
        assert_eq!(advertised.game_id, 0x1234_5678);
        assert_eq!(advertised.max_peers, 2);
        assert!(advertised.accepting_peers);

        machine.on_frame_received(&peer_auth(PEER), 40, at(10));
        assert_eq!(last_auth_status(&machine), StatusCode::Success);
        let request = build(|writer| {
            write_association_request(
                writer,
                STATION,
                PEER,
                0,
                &parameters.ssid,
                false,
                RateSet::Native,
            )
        });
        machine.on_frame_received(&request, 40, at(20));
        let Frame::AssociationResponse { header, status, aid } = machine.transport().last() else {
            panic!("Expected an association response.");
        };
        assert_eq!((header.address_1, status, aid), (PEER, StatusCode::Success, 1));

        // Peer data ends up in the RX ring.
        let mut host_rx = shared.rx.consumer().unwrap();
        let data = build(|writer| {
            write_data(writer, DataDirection::ToDs, STATION, STATION, PEER, 0, false, 0x0800, b"hi")
        });
        machine.on_frame_received(&data, 40, at(25));
        assert_eq!(&host_rx.try_pop().unwrap().as_slice()[6..12], &PEER.octets());

        shared.sessions.set_accepting(false);
        machine.on_frame_received(&peer_auth(OTHER_PEER), 40, at(30));
        assert_eq!(last_auth_status(&machine), StatusCode::UnspecifiedFailure);

        let next_beacon = at(0) + LinkConfig::default().beacon_period();
        machine.tick(next_beacon);
        let advertised = advertisement(&machine);
        assert_eq!(advertised.current_peers, 1);
        assert!(!advertised.accepting_peers);

        shared.request_kick(1).unwrap();
        machine.tick(next_beacon + Duration::from_millis(1));
        let Frame::Deauthentication { header, .. } = machine.transport().last() else {
            panic!("Expected a deauthentication.");
        };
        assert_eq!(header.address_1, PEER);
        assert_eq!(
            shared.sessions.state_of(Processor::Host, PEER),
            Ok(PeerState::Disconnected)
        );
    }

    #[test]
    fn hosting_enforces_the_peer_limit() {
        let shared = SharedState::new();
        let mut machine = enabled(&shared);
        let parameters = HostParameters::new(b"Session", 1, 1, 1, 64, 32).unwrap();
        shared.sessions.set_accepting(true);
        shared.post_command(LinkCommand::Host(parameters)).unwrap();
        machine.tick(at(0));
        machine.on_frame_received(&peer_auth(PEER), 40, at(10));
        assert_eq!(last_auth_status(&machine), StatusCode::Success);
        machine.on_frame_received(&peer_auth(OTHER_PEER), 40, at(20));
        assert_eq!(last_auth_status(&machine), StatusCode::ApFull);

        // Locked tables drop the request without an answer.
        let sent = machine.transport().sent.len();
        let guard = shared.sessions.hold(Processor::Host).unwrap();
        machine.on_frame_received(&peer_auth(OTHER_PEER), 40, at(30));
        drop(guard);
        assert_eq!(machine.transport().sent.len(), sent);
        assert_eq!(shared.statistics.snapshot().lock_busy, 1);

        shared.request_kick_unassociated();
        machine.tick(at(40));
        let Frame::Deauthentication { header, reason } = machine.transport().last() else {
            panic!("Expected a deauthentication.");
        };
        assert_eq!((header.address_1, reason), (PEER, ReasonCode::NotAssociated));

        shared.post_command(LinkCommand::Stop).unwrap();
        machine.tick(at(50));
        assert_eq!(machine.mode(), Mode::Normal);
    }
}
