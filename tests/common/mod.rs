//! A simulated radio and AP, driving both sides of the link in lock step.
#![allow(dead_code)]

use embassy_time::Instant;
use nds_wifi_link::{
    frame::{
        element_id, parse_frame, write_association_response, write_authentication, write_beacon,
        Authentication, BeaconTemplate, CapabilityInformation, Elements, Frame, FrameWriter,
        MacAddress, Ssid, StatusCode, HEADER_LENGTH, MAX_FRAME_LENGTH,
    },
    ConnectionOrchestrator, ConnectionStatus, LinkConfig, LinkStateMachine, Mode, NoKeyExchange,
    Profile, RadioTransport, SharedRegion, SharedState, TxStatus,
};

pub const AP_BSSID: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
pub const STATION: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
/// Time between two ticks of the link.
pub const STEP_MS: u64 = 10;
/// The simulated AP beacons this often.
const BEACON_MS: u64 = 20;

/// Keeps every frame the link sends.
#[derive(Default)]
pub struct RecordingRadio {
    pub sent: Vec<Vec<u8>>,
    pub channel: u8,
}
impl RecordingRadio {
    pub fn last(&self) -> Frame<'_> {
        parse_frame(self.sent.last().expect("Nothing was sent.")).unwrap()
    }
}
impl RadioTransport for RecordingRadio {
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
}

pub fn build(f: impl FnOnce(&mut FrameWriter<'_>) -> nds_wifi_link::frame::FrameResult<()>) -> Vec<u8> {
    let mut buffer = [0u8; MAX_FRAME_LENGTH];
    let mut writer = FrameWriter::new(&mut buffer);
    f(&mut writer).unwrap();
    writer.finish().to_vec()
}

/// An open AP, which answers authentication and association requests.
pub struct SimulatedAp {
    pub bssid: MacAddress,
    pub ssid: Ssid,
    pub channel: u8,
    /// Refuse stations, which only claim the 1 and 2 Mbit rates.
    pub requires_expanded_rates: bool,
    pub beaconing: bool,
    /// For every association request: whether it carried the expanded rate set.
    pub association_requests: Vec<bool>,
}
impl SimulatedAp {
    pub fn new(ssid: &[u8], channel: u8) -> Self {
        Self {
            bssid: AP_BSSID,
            ssid: Ssid::new(ssid).unwrap(),
            channel,
            requires_expanded_rates: false,
            beaconing: true,
            association_requests: Vec::new(),
        }
    }
    pub fn beacon(&self) -> Vec<u8> {
        build(|writer| {
            write_beacon(
                writer,
                &BeaconTemplate {
                    bssid: self.bssid,
                    beacon_interval: 100,
                    capabilities: CapabilityInformation::new().with_is_ess(true),
                    ssid: &self.ssid,
                    channel: self.channel,
                    rates: &[0x82, 0x84, 0x0b, 0x16],
                    host_advertisement: None,
                    extra_elements: &[],
                },
                0,
            )
        })
    }
    /// The reply to a frame sent by the station, if any.
    pub fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        match parse_frame(frame).ok()? {
            Frame::Authentication { header, body }
                if header.address_1 == self.bssid && body.sequence == 1 =>
            {
                Some(build(|writer| {
                    write_authentication(
                        writer,
                        header.address_2,
                        self.bssid,
                        self.bssid,
                        0,
                        &Authentication {
                            algorithm: body.algorithm,
                            sequence: 2,
                            status: StatusCode::Success,
                            challenge: None,
                        },
                        false,
                    )
                }))
            }
            Frame::AssociationRequest { header, .. } if header.address_1 == self.bssid => {
                // Capabilities and listen interval come before the elements.
                let rates = Elements::new(&frame[HEADER_LENGTH + 4..])
                    .find(|(id, _)| *id == element_id::SUPPORTED_RATES)
                    .map(|(_, rates)| rates.len())
                    .unwrap_or_default();
                let expanded = rates > 2;
                self.association_requests.push(expanded);
                let status = if self.requires_expanded_rates && !expanded {
                    StatusCode::UnsupportedRates
                } else {
                    StatusCode::Success
                };
                Some(build(|writer| {
                    write_association_response(writer, header.address_2, self.bssid, 0, status, 1)
                }))
            }
            _ => None,
        }
    }
}

/// Both processors and the AP, advanced in steps of [STEP_MS].
pub struct Harness {
    pub orchestrator: ConnectionOrchestrator,
    pub link: LinkStateMachine<'static, RecordingRadio, NoKeyExchange>,
    pub ap: SimulatedAp,
    pub now: u64,
    /// Every mode the radio published, without repetitions.
    pub modes: Vec<Mode>,
    /// Every status the orchestrator reported, without repetitions.
    pub statuses: Vec<ConnectionStatus>,
    /// Replies of the AP, delivered on the next step.
    pending: Vec<Vec<u8>>,
    answered: usize,
}
impl Harness {
    pub fn new(profiles: &[Profile], ap: SimulatedAp) -> Self {
        let region: &'static SharedRegion = Box::leak(Box::new(SharedRegion::new()));
        let orchestrator = ConnectionOrchestrator::init(region, profiles).unwrap();
        let shared = region.attach().unwrap();
        let link = LinkStateMachine::new(
            shared,
            RecordingRadio::default(),
            NoKeyExchange,
            LinkConfig::default(),
        )
        .unwrap();
        let mut harness = Self {
            orchestrator,
            link,
            ap,
            now: 0,
            modes: vec![shared.status().mode],
            statuses: Vec::new(),
            pending: Vec::new(),
            answered: 0,
        };
        // Let the radio pick up the enable command.
        harness.step();
        harness
    }
    pub fn shared(&self) -> &'static SharedState {
        self.orchestrator.shared()
    }
    pub fn instant(&self) -> Instant {
        Instant::from_millis(self.now)
    }
    pub fn step(&mut self) {
        self.now += STEP_MS;
        let now = self.instant();
        let on_ap_channel = self.link.channel() == self.ap.channel;
        for frame in core::mem::take(&mut self.pending) {
            if on_ap_channel {
                self.link.on_frame_received(&frame, 40, now);
            }
        }
        self.link.tick(now);
        if self.ap.beaconing && self.now % BEACON_MS == 0 && self.link.channel() == self.ap.channel {
            let beacon = self.ap.beacon();
            self.link.on_frame_received(&beacon, 40, now);
        }
        let sent = &self.link.transport().sent;
        for frame in &sent[self.answered..] {
            if let Some(reply) = self.ap.respond(frame) {
                self.pending.push(reply);
            }
        }
        self.answered = sent.len();

        let status = self.orchestrator.poll();
        if self.statuses.last() != Some(&status) {
            self.statuses.push(status);
        }
        let mode = self.shared().status().mode;
        if self.modes.last() != Some(&mode) {
            self.modes.push(mode);
        }
    }
    pub fn run_for(&mut self, millis: u64) {
        for _ in 0..millis / STEP_MS {
            self.step();
        }
    }
    /// Step until `done` returns true, for at most `millis`.
    pub fn run_until(&mut self, millis: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..millis / STEP_MS {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }
}
