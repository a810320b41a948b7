//! The host side.
//!
//! The [ConnectionOrchestrator] turns requests from the application into commands for the
//! radio and folds the status published by the radio into a [ConnectionStatus]. It never
//! blocks: the application calls [ConnectionOrchestrator::poll] from its main loop.

use crate::{
    ap_table::{AccessPointRecord, ApMatcher, TableResult},
    config::{
        ApDescriptor, HostParameters, IpConfig, KeyMaterial, ProfileStore, Profiles, RequestError,
        RequestResult, ScanFilter, MAX_PROFILES,
    },
    link::{AuthLevel, LinkError, Mode},
    session::{PeerInfo, SessionResult},
    shared::{
        ConnectTarget, LinkCommand, SharedRegion, SharedState, StatisticsSnapshot, StatusReport,
    },
    sync::Processor,
};

/// The simplified view of the link, that's reported to the application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// A plain scan without a target is running.
    Scanning,
    /// Waiting for the target to show up in the AP table.
    Searching,
    Authenticating,
    /// Authenticated, waiting for association or the key exchange.
    Associating,
    /// The link is up, but the network stack doesn't have an address yet.
    AcquiringAddress,
    Associated,
    /// The connection attempt failed. See [ConnectionOrchestrator::failure].
    CannotConnect,
    Hosting,
}

/// What the application last asked for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Request {
    #[default]
    Idle,
    Scan,
    Search,
    Connect,
    Host,
}

/// An AP, that we'd connect to, along with what's needed once it's found.
#[derive(Clone, Copy, Debug, Default)]
struct Candidate {
    matcher: ApMatcher,
    key: Option<KeyMaterial>,
    ip: IpConfig,
}

/// The host side of the link.
pub struct ConnectionOrchestrator {
    region: &'static SharedRegion,
    shared: &'static SharedState,
    profiles: Profiles,
    request: Request,
    filter: ScanFilter,
    candidates: [Candidate; MAX_PROFILES],
    candidate_count: usize,
    /// The candidate, which the current connection attempt is for.
    selected: Option<usize>,
    /// Version of the last command we posted.
    posted: u32,
    address_acquired: bool,
}
impl ConnectionOrchestrator {
    /// Allocate the shared region, load the profiles and enable the radio.
    ///
    /// The radio side attaches through [SharedRegion::attach] afterwards.
    pub fn init<S: ProfileStore + ?Sized>(region: &'static SharedRegion, store: &S) -> RequestResult<Self> {
        let shared = region.init()?;
        let profiles = Profiles::load(store);
        let posted = shared.post_command(LinkCommand::Enable)?;
        info!("Orchestrator initialized.");
        Ok(Self {
            region,
            shared,
            profiles,
            request: Request::Idle,
            filter: ScanFilter::All,
            candidates: [Candidate::default(); MAX_PROFILES],
            candidate_count: 0,
            selected: None,
            posted,
            address_acquired: false,
        })
    }
    /// Power off the radio and release the shared region.
    pub fn deinit(self) {
        if self.shared.post_command(LinkCommand::PowerOff).is_err() {
            warn!("Couldn't post the power off command.");
        }
        self.shared.sessions.set_accepting(false);
        self.region.deinit();
    }
    pub fn shared(&self) -> &'static SharedState {
        self.shared
    }
    pub fn profiles(&self) -> &Profiles {
        &self.profiles
    }
    /// Post a command, once the previous one was picked up.
    fn post(&mut self, command: LinkCommand) -> RequestResult<()> {
        if !self.acknowledged(&self.shared.status()) {
            return Err(RequestError::Busy);
        }
        self.posted = self.shared.post_command(command)?;
        Ok(())
    }
    /// Start searching for the current candidates.
    fn search(&mut self) -> RequestResult<()> {
        self.post(LinkCommand::Scan)?;
        self.request = Request::Search;
        self.filter = ScanFilter::Compatible;
        self.selected = None;
        self.address_acquired = false;
        Ok(())
    }

    /// Connect to the AP described by `descriptor`.
    pub fn connect(
        &mut self,
        descriptor: ApDescriptor,
        key: Option<KeyMaterial>,
        ip: IpConfig,
    ) -> RequestResult<()> {
        self.candidates[0] = Candidate {
            matcher: descriptor.matcher(),
            key,
            ip,
        };
        self.candidate_count = 1;
        self.search()
    }
    /// Connect to the first AP, that matches one of the stored profiles.
    ///
    /// Profiles are tried in the order they're stored in.
    pub fn auto_connect(&mut self) -> RequestResult<()> {
        if self.profiles.is_empty() {
            return Err(RequestError::NoProfiles);
        }
        self.candidate_count = 0;
        for (candidate, profile) in self.candidates.iter_mut().zip(self.profiles.iter()) {
            *candidate = Candidate {
                matcher: ApMatcher {
                    bssid: profile.bssid,
                    ssid: Some(profile.ssid),
                },
                key: profile.key,
                ip: profile.ip,
            };
            self.candidate_count += 1;
        }
        self.search()
    }
    /// Scan for APs. The results are available through [Self::access_points].
    pub fn scan(&mut self, filter: ScanFilter) -> RequestResult<()> {
        self.post(LinkCommand::Scan)?;
        self.request = Request::Scan;
        self.filter = filter;
        Ok(())
    }
    /// Host a local multiplayer session.
    pub fn host(&mut self, parameters: HostParameters) -> RequestResult<()> {
        parameters.validate()?;
        self.shared.sessions.set_accepting(true);
        if let Err(err) = self.post(LinkCommand::Host(parameters)) {
            self.shared.sessions.set_accepting(false);
            return Err(err);
        }
        self.request = Request::Host;
        Ok(())
    }
    /// Leave whatever mode the radio is in.
    pub fn disconnect(&mut self) -> RequestResult<()> {
        self.post(LinkCommand::Stop)?;
        self.shared.sessions.set_accepting(false);
        self.request = Request::Idle;
        self.selected = None;
        Ok(())
    }
    /// Open or close the session for new peers.
    pub fn set_admission(&self, accepting: bool) -> RequestResult<()> {
        if self.request != Request::Host {
            return Err(RequestError::InvalidState);
        }
        self.shared.sessions.set_accepting(accepting);
        Ok(())
    }
    pub fn kick(&self, aid: u16) -> RequestResult<()> {
        if self.request != Request::Host {
            return Err(RequestError::InvalidState);
        }
        self.shared.request_kick(aid)
    }
    pub fn kick_unassociated(&self) -> RequestResult<()> {
        if self.request != Request::Host {
            return Err(RequestError::InvalidState);
        }
        self.shared.request_kick_unassociated();
        Ok(())
    }
    /// The network stack obtained an address.
    pub fn notify_address_acquired(&mut self) {
        self.address_acquired = true;
    }

    /// Whether the radio acted upon the last command we posted.
    fn acknowledged(&self, status: &StatusReport) -> bool {
        status.acknowledged.wrapping_sub(self.posted) as i32 >= 0
    }
    /// Advance the request and return the current status.
    pub fn poll(&mut self) -> ConnectionStatus {
        let status = self.shared.status();
        if !self.acknowledged(&status) {
            return match self.request {
                Request::Search => ConnectionStatus::Searching,
                Request::Connect => ConnectionStatus::Authenticating,
                Request::Scan => ConnectionStatus::Scanning,
                Request::Host => ConnectionStatus::Hosting,
                Request::Idle => ConnectionStatus::Disconnected,
            };
        }
        match self.request {
            Request::Idle => ConnectionStatus::Disconnected,
            Request::Scan if status.mode == Mode::Scanning => ConnectionStatus::Scanning,
            Request::Host if status.mode == Mode::AccessPoint => ConnectionStatus::Hosting,
            Request::Scan | Request::Host => ConnectionStatus::Disconnected,
            Request::Search => self.resolve_target(),
            Request::Connect => self.connection_status(&status),
        }
    }
    /// Look for one of the candidates in the AP table and hand it to the radio.
    fn resolve_target(&mut self) -> ConnectionStatus {
        let mut matchers = [ApMatcher::default(); MAX_PROFILES];
        for (matcher, candidate) in matchers.iter_mut().zip(&self.candidates[..self.candidate_count]) {
            *matcher = candidate.matcher;
        }
        let Some(found) = self
            .shared
            .access_points
            .find_matching_by(Processor::Host, &matchers[..self.candidate_count], |record| {
                record.compatible
            })
        else {
            return ConnectionStatus::Searching;
        };
        let candidate = self.candidates[found.candidate];
        let target = ConnectTarget {
            record: found.record,
            key: candidate.key,
        };
        if self.post(LinkCommand::Connect(target)).is_err() {
            // Try again on the next poll.
            return ConnectionStatus::Searching;
        }
        debug!(
            "Resolved candidate {} to {:?} on channel {}.",
            found.candidate,
            found.record.bssid.octets(),
            found.record.channel
        );
        self.request = Request::Connect;
        self.selected = Some(found.candidate);
        ConnectionStatus::Authenticating
    }
    fn connection_status(&self, status: &StatusReport) -> ConnectionStatus {
        match (status.mode, status.auth_level) {
            (Mode::Connecting, AuthLevel::Authenticated | AuthLevel::Associated) => {
                ConnectionStatus::Associating
            }
            (Mode::Connecting, _) => ConnectionStatus::Authenticating,
            (Mode::Connected, _) => {
                let needs_address = self
                    .selected
                    .is_some_and(|index| self.candidates[index].ip.needs_address_acquisition());
                if needs_address && !self.address_acquired {
                    ConnectionStatus::AcquiringAddress
                } else {
                    ConnectionStatus::Associated
                }
            }
            (Mode::CannotConnect, _) => ConnectionStatus::CannotConnect,
            _ => ConnectionStatus::Disconnected,
        }
    }
    /// Why the last connection attempt failed.
    pub fn failure(&self) -> Option<LinkError> {
        self.shared.status().failure
    }
    /// The raw status published by the radio.
    pub fn status_report(&self) -> StatusReport {
        self.shared.status()
    }
    /// The AP we're connected to, if any.
    pub fn connected_access_point(&self) -> Option<AccessPointRecord> {
        let status = self.shared.status();
        if status.mode != Mode::Connected {
            return None;
        }
        self.access_point(status.ap_slot? as usize).ok()
    }

    /// All APs in the table, that pass the current scan filter.
    pub fn access_points(&self) -> impl Iterator<Item = (usize, AccessPointRecord)> + '_ {
        let filter = self.filter;
        self.shared
            .access_points
            .iter(Processor::Host)
            .filter(move |(_, record)| filter.matches(record))
    }
    /// The AP in slot `index`.
    pub fn access_point(&self, index: usize) -> TableResult<AccessPointRecord> {
        self.shared.access_points.get(Processor::Host, index)
    }
    /// Copy the associated peers into `out`, returning how many were written.
    pub fn peers(&self, out: &mut [PeerInfo]) -> SessionResult<usize> {
        self.shared.sessions.peers(Processor::Host, out)
    }
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.statistics.snapshot()
    }
}
