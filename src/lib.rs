#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! Per-client routing and mixing engine for a virtual audio device.
//!
//! A [`ClientEngine`] tracks every client connected to the device, arbitrates
//! when the device as a whole is running, and forwards audio between client
//! processes along gain-weighted [`Route`]s. Administrative calls serialise
//! behind one lock; the IO cycle reads shared state without locking or
//! allocating, through [`ClientEngine::store_client_audio`],
//! [`ClientEngine::mix_routed_audio`] and [`RealtimeProcessor::process_client`].
//!
//! The [`ffi`] module exposes the same surface to a C host driver.

pub mod client;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod io;
pub mod logging;
pub mod notify;
mod reclaim;
pub mod ring;
pub mod routing;
pub mod table;

#[cfg(test)]
mod tests;

pub use client::{ClientIdentity, ClientRecord, ClientVolumeUpdate, EqGains};
pub use config::EngineConfig;
pub use dsp::{RealtimeProcessor, ToneShaper};
pub use engine::{BatchReport, ClientEngine, ClientStatus, EngineStatus};
pub use error::{EngineError, EngineResult};
pub use ffi::*;
pub use notify::{DeviceProperty, NotificationSink, NullSink, PropertiesChanged};
pub use ring::RoutingBuffer;
pub use routing::{Route, RouteUpdate, RoutingGraph};
pub use table::ClientTable;
