//! Engine configuration.

use std::env;

use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Default stereo frame capacity of each client's routing buffer.
pub const DEFAULT_ROUTING_BUFFER_FRAMES: usize = 8_192;
/// Default number of slots in the real-time client lookup table.
pub const DEFAULT_CLIENT_CAPACITY: usize = 256;
/// Default bundle id of the companion control application.
pub const DEFAULT_APP_BUNDLE_ID: &str = "io.loopback.RouterApp";

/// Static parameters fixed for the lifetime of a [`ClientEngine`](crate::ClientEngine).
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Device sample rate in Hertz, used for tone-shaping coefficients.
    pub sample_rate: u32,
    /// Capacity of each routing buffer in stereo frames.
    pub routing_buffer_frames: usize,
    /// Number of slots in the fixed real-time lookup table.
    pub client_capacity: usize,
    /// Bundle id that marks a client as the distinguished app client.
    pub app_bundle_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            routing_buffer_frames: DEFAULT_ROUTING_BUFFER_FRAMES,
            client_capacity: DEFAULT_CLIENT_CAPACITY,
            app_bundle_id: DEFAULT_APP_BUNDLE_ID.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `CLIENT_ENGINE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(rate) = env_parse::<u32>("CLIENT_ENGINE_SAMPLE_RATE") {
            config.sample_rate = rate;
        }
        if let Some(frames) = env_parse::<usize>("CLIENT_ENGINE_ROUTING_FRAMES") {
            config.routing_buffer_frames = frames;
        }
        if let Some(capacity) = env_parse::<usize>("CLIENT_ENGINE_CAPACITY") {
            config.client_capacity = capacity;
        }
        if let Ok(bundle_id) = env::var("CLIENT_ENGINE_APP_BUNDLE_ID") {
            config.app_bundle_id = bundle_id;
        }
        config
    }

    /// Set the device sample rate.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set the routing buffer capacity in frames.
    pub fn with_routing_buffer_frames(mut self, frames: usize) -> Self {
        self.routing_buffer_frames = frames;
        self
    }

    /// Set the real-time table capacity.
    pub fn with_client_capacity(mut self, capacity: usize) -> Self {
        self.client_capacity = capacity;
        self
    }

    /// Set the bundle id of the distinguished app client.
    pub fn with_app_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.app_bundle_id = bundle_id.into();
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(EngineError::InvalidConfig(format!(
                "sample rate {} Hz outside 8000..=384000",
                self.sample_rate
            )));
        }
        if self.routing_buffer_frames == 0 {
            return Err(EngineError::InvalidConfig(
                "routing buffer must hold at least one frame".to_string(),
            ));
        }
        if self.client_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "client table needs at least one slot".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
