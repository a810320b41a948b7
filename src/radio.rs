//! The boundaries to the radio driver and the cryptography layer.

use embassy_sync::channel::Channel;
use portable_atomic::{AtomicU8, Ordering};

use crate::{
    config::KeyMaterial,
    frame::{MacAddress, SecurityInfo, MAX_FRAME_LENGTH},
    DefaultRawMutex,
};

/// Outcome of handing a frame to the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    Accepted,
    /// The frame was dropped, since the transmit queue is full.
    QueueFull,
}

/// Everything the link layer needs from the radio driver.
///
/// Received frames are passed to [LinkStateMachine::on_frame_received](crate::LinkStateMachine::on_frame_received)
/// by the driver.
pub trait RadioTransport {
    /// Queue a complete frame, without FCS, for transmission.
    fn send_frame(&mut self, frame: &[u8]) -> TxStatus;
    /// Tune to `channel`.
    fn set_channel(&mut self, channel: u8);
    /// The address of our interface.
    fn mac_address(&self) -> MacAddress;
    /// Install the key used for frames with the protected bit set, or remove it.
    fn install_key(&mut self, _key: Option<&KeyMaterial>) {}
}
impl<T: RadioTransport + ?Sized> RadioTransport for &mut T {
    fn send_frame(&mut self, frame: &[u8]) -> TxStatus {
        (**self).send_frame(frame)
    }
    fn set_channel(&mut self, channel: u8) {
        (**self).set_channel(channel)
    }
    fn mac_address(&self) -> MacAddress {
        (**self).mac_address()
    }
    fn install_key(&mut self, key: Option<&KeyMaterial>) {
        (**self).install_key(key)
    }
}

/// A frame waiting for transmission.
#[derive(Clone)]
pub struct QueuedFrame {
    buffer: [u8; MAX_FRAME_LENGTH],
    length: usize,
}
impl QueuedFrame {
    fn new(frame: &[u8]) -> Option<Self> {
        let mut buffer = [0u8; MAX_FRAME_LENGTH];
        buffer.get_mut(..frame.len())?.copy_from_slice(frame);
        Some(Self {
            buffer,
            length: frame.len(),
        })
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

/// A transmit queue between the link layer and an asynchronous radio driver.
///
/// The link layer pushes frames through [QueuedTransport], while the driver task awaits
/// [FrameQueue::receive] and retunes, whenever [FrameQueue::tuned_channel] changes.
pub struct FrameQueue<const DEPTH: usize> {
    frames: Channel<DefaultRawMutex, QueuedFrame, DEPTH>,
    channel: AtomicU8,
    address: MacAddress,
}
impl<const DEPTH: usize> FrameQueue<DEPTH> {
    pub const fn new(address: MacAddress) -> Self {
        Self {
            frames: Channel::new(),
            channel: AtomicU8::new(1),
            address,
        }
    }
    /// Wait for the next frame to transmit.
    pub async fn receive(&self) -> QueuedFrame {
        self.frames.receive().await
    }
    pub fn try_receive(&self) -> Option<QueuedFrame> {
        self.frames.try_receive().ok()
    }
    pub fn tuned_channel(&self) -> u8 {
        self.channel.load(Ordering::Relaxed)
    }
    pub fn transport(&self) -> QueuedTransport<'_, DEPTH> {
        QueuedTransport { queue: self }
    }
}

/// The link layer end of a [FrameQueue].
pub struct QueuedTransport<'a, const DEPTH: usize> {
    queue: &'a FrameQueue<DEPTH>,
}
impl<const DEPTH: usize> RadioTransport for QueuedTransport<'_, DEPTH> {
    fn send_frame(&mut self, frame: &[u8]) -> TxStatus {
        let Some(frame) = QueuedFrame::new(frame) else {
            return TxStatus::QueueFull;
        };
        match self.queue.frames.try_send(frame) {
            Ok(()) => TxStatus::Accepted,
            Err(_) => TxStatus::QueueFull,
        }
    }
    fn set_channel(&mut self, channel: u8) {
        self.queue.channel.store(channel, Ordering::Relaxed);
    }
    fn mac_address(&self) -> MacAddress {
        self.queue.address
    }
}

/// Progress of a key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyExchangeState {
    InProgress,
    /// The keys are installed and protected frames can flow.
    Complete,
    Failed,
}

/// The result of feeding one EAPOL frame into the key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyExchangeStep {
    pub state: KeyExchangeState,
    /// Length of the EAPOL reply written into the reply buffer, if any.
    pub reply_length: usize,
}

/// The WPA handshake, which runs after association.
///
/// The link layer only forwards EAPOL payloads. Deriving and installing the keys is up to the
/// implementation.
pub trait KeyExchange {
    /// A new handshake with `authenticator` begins.
    fn begin(&mut self, authenticator: MacAddress, security: &SecurityInfo, key: &KeyMaterial);
    /// Process an EAPOL payload, writing the reply into `reply`.
    fn on_eapol(&mut self, payload: &[u8], reply: &mut [u8]) -> KeyExchangeStep;
    /// Drop all state and keys.
    fn reset(&mut self);
}
impl<K: KeyExchange + ?Sized> KeyExchange for &mut K {
    fn begin(&mut self, authenticator: MacAddress, security: &SecurityInfo, key: &KeyMaterial) {
        (**self).begin(authenticator, security, key)
    }
    fn on_eapol(&mut self, payload: &[u8], reply: &mut [u8]) -> KeyExchangeStep {
        (**self).on_eapol(payload, reply)
    }
    fn reset(&mut self) {
        (**self).reset()
    }
}

/// For builds without WPA support. Every handshake fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoKeyExchange;
impl KeyExchange for NoKeyExchange {
    fn begin(&mut self, _authenticator: MacAddress, _security: &SecurityInfo, _key: &KeyMaterial) {}
    fn on_eapol(&mut self, _payload: &[u8], _reply: &mut [u8]) -> KeyExchangeStep {
        KeyExchangeStep {
            state: KeyExchangeState::Failed,
            reply_length: 0,
        }
    }
    fn reset(&mut self) {}
}
