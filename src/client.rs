//! Per-client mixing state and the raw-value conversions used to set it.

/// Lowest accepted raw relative volume.
pub const RELATIVE_VOLUME_MIN_RAW: f32 = 0.0;
/// Highest accepted raw relative volume.
pub const RELATIVE_VOLUME_MAX_RAW: f32 = 100.0;
/// Raw pan value for hard left.
pub const PAN_LEFT_RAW: i32 = -100;
/// Raw pan value for center.
pub const PAN_CENTER_RAW: i32 = 0;
/// Raw pan value for hard right.
pub const PAN_RIGHT_RAW: i32 = 100;
/// Lowest accepted EQ band gain, in tenths of a decibel.
pub const EQ_MIN_TENTHS_DB: i32 = -240;
/// Highest accepted EQ band gain, in tenths of a decibel.
pub const EQ_MAX_TENTHS_DB: i32 = 240;
/// Lowest accepted trim in decibels. At or below this the client is silent.
pub const TRIM_MIN_DB: f32 = -96.0;
/// Highest accepted trim input in decibels, before soft-knee limiting.
pub const TRIM_MAX_DB: f32 = 24.0;

/// Identity fields supplied by the host when a client connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Host-assigned id, stable for the lifetime of the connection.
    pub client_id: u32,
    /// Owning process id.
    pub process_id: i32,
    /// Bundle identifier of the owning application, when the host knows it.
    pub bundle_id: Option<String>,
    /// Whether the client's samples use native byte order.
    pub is_native_endian: bool,
}

impl ClientIdentity {
    /// Identity with no bundle id and native byte order.
    pub fn new(client_id: u32, process_id: i32) -> Self {
        Self {
            client_id,
            process_id,
            bundle_id: None,
            is_native_endian: true,
        }
    }

    /// Attach a bundle id.
    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }
}

/// Gains for the three tone-shaping bands. `None` means the band is unset.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EqGains {
    /// Low shelf gain in dB.
    pub low_db: Option<f32>,
    /// Mid peak gain in dB.
    pub mid_db: Option<f32>,
    /// High shelf gain in dB.
    pub high_db: Option<f32>,
}

impl EqGains {
    /// True when every band is unset or flat.
    pub fn is_flat(&self) -> bool {
        [self.low_db, self.mid_db, self.high_db]
            .iter()
            .all(|band| band.is_none_or(|db| db == 0.0))
    }
}

/// One connected client's complete mixing state.
///
/// Cloning copies mix state only. A client's routing buffer lives in its table
/// slot, so it is never duplicated or shared through a record.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRecord {
    /// Connection identity.
    pub identity: ClientIdentity,
    /// Whether the client is currently running IO.
    pub doing_io: bool,
    /// Whether the client belongs to the designated music player.
    pub is_music_player: bool,
    /// Linear gain relative to the device volume. `1.0` leaves audio unchanged.
    pub relative_volume: f32,
    /// Raw pan in `PAN_LEFT_RAW..=PAN_RIGHT_RAW`.
    pub pan_position: i32,
    /// Tone-shaping band gains.
    pub eq: EqGains,
    /// Trim in decibels, soft-limited at the top of the range.
    pub trim_db: f32,
    /// Muted clients render silence.
    pub muted: bool,
    /// While any client is soloed, only soloed clients are heard.
    pub soloed: bool,
}

impl ClientRecord {
    /// Fresh record with neutral mixing state.
    pub fn new(identity: ClientIdentity) -> Self {
        Self {
            identity,
            doing_io: false,
            is_music_player: false,
            relative_volume: 1.0,
            pan_position: PAN_CENTER_RAW,
            eq: EqGains::default(),
            trim_db: 0.0,
            muted: false,
            soloed: false,
        }
    }

    /// Host-assigned client id.
    pub fn client_id(&self) -> u32 {
        self.identity.client_id
    }

    /// Owning process id.
    pub fn process_id(&self) -> i32 {
        self.identity.process_id
    }

    /// Bundle id, if known.
    pub fn bundle_id(&self) -> Option<&str> {
        self.identity.bundle_id.as_deref()
    }

    /// True if either the pid or the bundle id matches.
    pub fn matches(&self, process_id: Option<i32>, bundle_id: Option<&str>) -> bool {
        process_id.is_some_and(|pid| pid == self.process_id())
            || bundle_id.is_some_and(|id| self.bundle_id() == Some(id))
    }
}

/// Typed bulk update for every client matching a pid or bundle id.
///
/// Absent fields are left untouched. Raw values are validated per field, so one
/// bad field does not block the others in the same entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientVolumeUpdate {
    /// Target process id.
    pub process_id: Option<i32>,
    /// Target bundle id.
    pub bundle_id: Option<String>,
    /// Raw relative volume in `RELATIVE_VOLUME_MIN_RAW..=RELATIVE_VOLUME_MAX_RAW`.
    pub relative_volume: Option<f32>,
    /// Raw pan in `PAN_LEFT_RAW..=PAN_RIGHT_RAW`.
    pub pan_position: Option<i32>,
    /// Low band in tenths of a decibel.
    pub eq_low: Option<i32>,
    /// Mid band in tenths of a decibel.
    pub eq_mid: Option<i32>,
    /// High band in tenths of a decibel.
    pub eq_high: Option<i32>,
    /// Trim in decibels.
    pub trim_db: Option<f32>,
    /// Mute flag.
    pub muted: Option<bool>,
    /// Solo flag.
    pub soloed: Option<bool>,
}

impl ClientVolumeUpdate {
    /// Update addressed to a process id.
    pub fn for_pid(process_id: i32) -> Self {
        Self {
            process_id: Some(process_id),
            ..Self::default()
        }
    }

    /// Update addressed to a bundle id.
    pub fn for_bundle_id(bundle_id: impl Into<String>) -> Self {
        Self {
            bundle_id: Some(bundle_id.into()),
            ..Self::default()
        }
    }
}

/// Map a raw relative volume onto a linear gain.
///
/// Square-law curve scaled by four so the midpoint (50) is unity and the top
/// of the range is +12 dB.
pub fn relative_volume_from_raw(raw: f32) -> f32 {
    let normalized = raw / RELATIVE_VOLUME_MAX_RAW;
    normalized * normalized * 4.0
}

/// Inverse of [`relative_volume_from_raw`].
pub fn relative_volume_to_raw(volume: f32) -> f32 {
    (volume.max(0.0) / 4.0).sqrt() * RELATIVE_VOLUME_MAX_RAW
}

/// Convert an EQ gain in tenths of a decibel to decibels.
pub fn eq_tenths_to_db(tenths: i32) -> f32 {
    tenths as f32 / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_raw_volume_is_unity() {
        assert!((relative_volume_from_raw(50.0) - 1.0).abs() < 1e-6);
        assert_eq!(relative_volume_from_raw(0.0), 0.0);
        assert!((relative_volume_from_raw(100.0) - 4.0).abs() < 1e-6);
        assert!((relative_volume_to_raw(1.0) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn record_matches_pid_or_bundle() {
        let record = ClientRecord::new(ClientIdentity::new(3, 42).with_bundle_id("com.a"));
        assert!(record.matches(Some(42), None));
        assert!(record.matches(None, Some("com.a")));
        assert!(record.matches(Some(7), Some("com.a")));
        assert!(!record.matches(Some(7), Some("com.b")));
        assert!(!record.matches(None, None));
    }

    #[test]
    fn cleared_eq_counts_as_flat() {
        let mut eq = EqGains::default();
        assert!(eq.is_flat());
        eq.mid_db = Some(0.0);
        assert!(eq.is_flat());
        eq.high_db = Some(-3.0);
        assert!(!eq.is_flat());
    }
}
