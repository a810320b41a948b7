//! # `nds-wifi-link`
//! This is the control plane of a WiFi stack split across two processors, as found in handheld
//! consoles. The radio processor owns the antenna and runs the link layer protocol, while the
//! host processor issues requests like connecting to an AP, scanning or hosting a local
//! multiplayer session and consumes the results.
//! ## Overview
//! This chapter will give a short overview of how the two sides interact.
//!
//! ### Shared state
//! Both processors share a single [SharedState], which is allocated once through a
//! [SharedRegion]. Apart from the [AccessPointTable] and the [MultiplayerSessionTable], every
//! field has exactly one writer. Requests from the host are posted into a latest-wins mailbox
//! and the radio publishes its status along with the version of the last request it acted
//! upon, so the host can tell whether its request was observed.
//!
//! The tables are guarded by a [Spinlock], which never blocks. If it's held by the other side,
//! the operation is abandoned and retried on the next tick.
//!
//! ### Data path
//! Payloads are moved between the processors through two single producer, single consumer
//! [RingChannel]s. The radio is the producer of the RX ring and the consumer of the TX ring.
//! A record, that doesn't fit, is dropped and counted, but never retried.
//!
//! ### Radio side
//! The [LinkStateMachine] is driven by the radio driver, which calls
//! [LinkStateMachine::tick] periodically and [LinkStateMachine::on_frame_received] for every
//! received frame. The driver itself is abstracted through [RadioTransport], the WPA key
//! exchange through [KeyExchange].
//!
//! ### Host side
//! The [ConnectionOrchestrator] turns requests from the application into commands and folds the
//! status of the radio into a [ConnectionStatus].
//!
//! ## Chip variants
//! The first generation radio (`ntr`) and the newer one (`twl`) are selected through Cargo features.
//! The newer radio scans faster, which shortens the scan dwell time and scales up the AP table
//! timeout. It also has space for more auto-connect profiles.

#![cfg_attr(not(test), no_std)]
#![allow(unexpected_cfgs)]
pub(crate) mod fmt;

mod ap_table;
mod config;
pub mod frame;
mod link;
mod orchestrator;
mod radio;
mod ring;
mod session;
mod shared;
mod sync;

pub use ap_table::*;
pub use config::*;
pub use link::*;
pub use orchestrator::*;
pub use radio::*;
pub use ring::*;
pub use session::*;
pub use shared::*;
pub use sync::*;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
