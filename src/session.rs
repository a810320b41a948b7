//! Peers of a local multiplayer session, while we're the host.
//!
//! The whole table sits behind a single [Spinlock]. The radio mutates it in response to
//! frames from the peers and the host reads it to enumerate them.

use portable_atomic::{AtomicBool, Ordering};

use crate::{
    frame::MacAddress,
    sync::{Processor, Spinlock, SpinlockGuard},
};

/// The maximum number of peers in a session.
pub const MAX_PEERS: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// The table lock is held by the other processor. Try again later.
    Busy,
    /// The peer may not join right now.
    Rejected,
    /// All slots are taken.
    Full,
    /// There is no such peer.
    NotFound,
}
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeerState {
    #[default]
    Disconnected,
    Authenticated,
    Associated,
}

/// A copy of a peer's state, as handed out to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerInfo {
    pub address: MacAddress,
    pub aid: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum PeerSlot {
    #[default]
    Free,
    Authenticated(MacAddress),
    Associated(MacAddress),
}
impl PeerSlot {
    fn address(&self) -> Option<MacAddress> {
        match self {
            Self::Free => None,
            Self::Authenticated(address) | Self::Associated(address) => Some(*address),
        }
    }
    fn state(&self) -> PeerState {
        match self {
            Self::Free => PeerState::Disconnected,
            Self::Authenticated(_) => PeerState::Authenticated,
            Self::Associated(_) => PeerState::Associated,
        }
    }
}

/// AIDs are handed out by slot index, so they stay unique as long as the slot is associated.
const fn aid_for_slot(index: usize) -> u16 {
    index as u16 + 1
}

struct Peers {
    slots: [PeerSlot; MAX_PEERS],
    max_peers: usize,
}
impl Peers {
    fn position(&self, address: MacAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.address() == Some(address))
    }
    fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| **slot != PeerSlot::Free)
            .count()
    }
}

/// The peer table of a multiplayer session.
pub struct MultiplayerSessionTable {
    peers: Spinlock<Peers>,
    accepting: AtomicBool,
}
impl MultiplayerSessionTable {
    pub const fn new() -> Self {
        Self {
            peers: Spinlock::new(Peers {
                slots: [PeerSlot::Free; MAX_PEERS],
                max_peers: MAX_PEERS,
            }),
            accepting: AtomicBool::new(false),
        }
    }
    fn lock(&self, processor: Processor) -> SessionResult<SpinlockGuard<'_, Peers>> {
        self.peers.try_lock(processor).ok_or(SessionError::Busy)
    }
    /// Drop all peers and limit the session to `max_peers`.
    ///
    /// The caller is responsible for deauthenticating the peers beforehand.
    pub fn reset(&self, max_peers: usize) -> SessionResult<()> {
        let mut peers = self.lock(Processor::Radio)?;
        peers.slots = [PeerSlot::Free; MAX_PEERS];
        peers.max_peers = max_peers.min(MAX_PEERS);
        Ok(())
    }
    /// Allow or refuse new peers. Peers already in the table aren't affected.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }
    /// Handle a successful authentication from `address`, returning the slot.
    ///
    /// Peers already in the table are moved back to authenticated, as they're starting over.
    pub fn authenticate(&self, address: MacAddress) -> SessionResult<usize> {
        let mut peers = self.lock(Processor::Radio)?;
        if let Some(index) = peers.position(address) {
            peers.slots[index] = PeerSlot::Authenticated(address);
            return Ok(index);
        }
        if !self.is_accepting() {
            debug!("Refusing peer {:?}, admission is closed.", address.octets());
            return Err(SessionError::Rejected);
        }
        if peers.occupied() >= peers.max_peers {
            return Err(SessionError::Full);
        }
        let index = peers
            .slots
            .iter()
            .position(|slot| *slot == PeerSlot::Free)
            .ok_or(SessionError::Full)?;
        peers.slots[index] = PeerSlot::Authenticated(address);
        Ok(index)
    }
    /// Handle an association request from `address`, returning the AID.
    ///
    /// This is idempotent for peers, that are already associated.
    pub fn associate(&self, address: MacAddress) -> SessionResult<u16> {
        let mut peers = self.lock(Processor::Radio)?;
        let index = peers.position(address).ok_or(SessionError::Rejected)?;
        peers.slots[index] = PeerSlot::Associated(address);
        let aid = aid_for_slot(index);
        debug!("Peer {:?} associated with AID {}.", address.octets(), aid);
        Ok(aid)
    }
    /// Remove `address` from the table.
    pub fn disconnect(&self, address: MacAddress) -> SessionResult<()> {
        let mut peers = self.lock(Processor::Radio)?;
        let index = peers.position(address).ok_or(SessionError::NotFound)?;
        peers.slots[index] = PeerSlot::Free;
        Ok(())
    }
    /// Deauthenticate and remove the peer with `aid`.
    ///
    /// `deauthenticate` is called with the peer's address, before the slot is released.
    pub fn kick(&self, aid: u16, deauthenticate: impl FnOnce(MacAddress)) -> SessionResult<()> {
        let mut peers = self.lock(Processor::Radio)?;
        let index = (aid as usize)
            .checked_sub(1)
            .filter(|index| *index < MAX_PEERS)
            .ok_or(SessionError::NotFound)?;
        let PeerSlot::Associated(address) = peers.slots[index] else {
            return Err(SessionError::NotFound);
        };
        deauthenticate(address);
        peers.slots[index] = PeerSlot::Free;
        Ok(())
    }
    /// Deauthenticate and remove all peers, that never completed association.
    ///
    /// Returns the number of peers removed.
    pub fn kick_unassociated(&self, mut deauthenticate: impl FnMut(MacAddress)) -> SessionResult<usize> {
        let mut peers = self.lock(Processor::Radio)?;
        let mut kicked = 0;
        for slot in peers.slots.iter_mut() {
            if let PeerSlot::Authenticated(address) = *slot {
                deauthenticate(address);
                *slot = PeerSlot::Free;
                kicked += 1;
            }
        }
        Ok(kicked)
    }
    /// Deauthenticate and remove every peer.
    pub fn kick_all(&self, mut deauthenticate: impl FnMut(MacAddress)) -> SessionResult<()> {
        let mut peers = self.lock(Processor::Radio)?;
        for slot in peers.slots.iter_mut() {
            if let Some(address) = slot.address() {
                deauthenticate(address);
            }
            *slot = PeerSlot::Free;
        }
        Ok(())
    }
    pub fn state_of(&self, processor: Processor, address: MacAddress) -> SessionResult<PeerState> {
        let peers = self.lock(processor)?;
        Ok(peers
            .position(address)
            .map(|index| peers.slots[index].state())
            .unwrap_or_default())
    }
    /// Copy the associated peers into `out`, returning how many were written.
    pub fn peers(&self, processor: Processor, out: &mut [PeerInfo]) -> SessionResult<usize> {
        let peers = self.lock(processor)?;
        let associated = peers
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                PeerSlot::Associated(address) => Some(PeerInfo {
                    address: *address,
                    aid: aid_for_slot(index),
                }),
                _ => None,
            });
        let mut written = 0;
        for (out, peer) in out.iter_mut().zip(associated) {
            *out = peer;
            written += 1;
        }
        Ok(written)
    }
    pub fn associated_count(&self, processor: Processor) -> SessionResult<usize> {
        let peers = self.lock(processor)?;
        Ok(peers
            .slots
            .iter()
            .filter(|slot| matches!(slot, PeerSlot::Associated(_)))
            .count())
    }
    pub fn max_peers(&self, processor: Processor) -> SessionResult<usize> {
        Ok(self.lock(processor)?.max_peers)
    }
    #[cfg(test)]
    pub(crate) fn hold(&self, processor: Processor) -> Option<impl Drop + '_> {
        self.peers.try_lock(processor)
    }
}
impl Default for MultiplayerSessionTable {
    fn default() -> Self {
        Self::new()
    }
}
