//! Per-client gain pipeline applied to a client's own signal in the IO cycle.
//!
//! Order: mute/solo gate, trim (soft-knee limited), relative volume, pan, then
//! three-band tone shaping. Everything here runs on the real-time path: no
//! allocation, no locking.

use dasp_frame::{Frame, Stereo};

use crate::client::{EqGains, PAN_RIGHT_RAW, TRIM_MIN_DB};
use crate::engine::ClientEngine;

/// Trim level where soft limiting begins.
pub const TRIM_KNEE_DB: f32 = 6.0;
/// Level the soft-limited trim approaches but never reaches.
pub const TRIM_CEILING_DB: f32 = 12.0;

const LOW_SHELF_HZ: f32 = 200.0;
const MID_PEAK_HZ: f32 = 1_000.0;
const MID_PEAK_Q: f32 = 0.707;
const HIGH_SHELF_HZ: f32 = 5_000.0;

/// Linear gain for a trim in dB, soft-limited above [`TRIM_KNEE_DB`].
pub fn trim_gain(trim_db: f32) -> f32 {
    if !trim_db.is_finite() || trim_db <= TRIM_MIN_DB {
        return 0.0;
    }
    let effective = if trim_db <= TRIM_KNEE_DB {
        trim_db
    } else {
        let span = TRIM_CEILING_DB - TRIM_KNEE_DB;
        TRIM_KNEE_DB + span * ((trim_db - TRIM_KNEE_DB) / span).tanh()
    };
    db_to_linear(effective)
}

/// Left/right gains for a raw pan position. Linear balance law, unity at center.
pub fn pan_gains(pan_position: i32) -> Stereo<f32> {
    let pan = (pan_position as f32 / PAN_RIGHT_RAW as f32).clamp(-1.0, 1.0);
    [(1.0 - pan).min(1.0), (1.0 + pan).min(1.0)]
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BandShape {
    LowShelf,
    Peak,
    HighShelf,
}

/// Normalised biquad coefficients with per-channel transposed direct form II state.
#[derive(Clone, Copy, Debug)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: Stereo<f32>,
    z2: Stereo<f32>,
}

impl Biquad {
    const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
        z1: [0.0; 2],
        z2: [0.0; 2],
    };

    fn design(&mut self, shape: BandShape, gain_db: f32, sample_rate: f32) {
        let (freq, q) = match shape {
            BandShape::LowShelf => (LOW_SHELF_HZ, std::f32::consts::FRAC_1_SQRT_2),
            BandShape::Peak => (MID_PEAK_HZ, MID_PEAK_Q),
            BandShape::HighShelf => (HIGH_SHELF_HZ, std::f32::consts::FRAC_1_SQRT_2),
        };
        let freq = freq.min(sample_rate * 0.45);
        let a = 10f32.powf(gain_db / 40.0);
        let w0 = std::f32::consts::TAU * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        let sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match shape {
            BandShape::Peak => (
                1.0 + alpha * a,
                -2.0 * cos,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos,
                1.0 - alpha / a,
            ),
            BandShape::LowShelf => (
                a * ((a + 1.0) - (a - 1.0) * cos + sqrt_a_alpha),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                a * ((a + 1.0) - (a - 1.0) * cos - sqrt_a_alpha),
                (a + 1.0) + (a - 1.0) * cos + sqrt_a_alpha,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                (a + 1.0) + (a - 1.0) * cos - sqrt_a_alpha,
            ),
            BandShape::HighShelf => (
                a * ((a + 1.0) + (a - 1.0) * cos + sqrt_a_alpha),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                a * ((a + 1.0) + (a - 1.0) * cos - sqrt_a_alpha),
                (a + 1.0) - (a - 1.0) * cos + sqrt_a_alpha,
                2.0 * ((a - 1.0) - (a + 1.0) * cos),
                (a + 1.0) - (a - 1.0) * cos - sqrt_a_alpha,
            ),
        };
        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    #[inline]
    fn process(&mut self, input: Stereo<f32>) -> Stereo<f32> {
        let mut out = Stereo::<f32>::EQUILIBRIUM;
        for ch in 0..2 {
            let x = input[ch];
            let y = self.b0 * x + self.z1[ch];
            self.z1[ch] = self.b1 * x - self.a1 * y + self.z2[ch];
            self.z2[ch] = self.b2 * x - self.a2 * y;
            out[ch] = y;
        }
        out
    }

    fn reset(&mut self) {
        self.z1 = [0.0; 2];
        self.z2 = [0.0; 2];
    }
}

/// Three-band stereo equaliser for one client.
#[derive(Clone, Debug)]
pub struct ToneShaper {
    bands: [Biquad; 3],
    designed_for: EqGains,
    sample_rate: f32,
}

impl ToneShaper {
    /// Flat shaper for `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            bands: [Biquad::IDENTITY; 3],
            designed_for: EqGains::default(),
            sample_rate: sample_rate as f32,
        }
    }

    /// Recompute coefficients if `gains` differ from the current design.
    pub fn set_gains(&mut self, gains: EqGains) {
        if gains == self.designed_for {
            return;
        }
        let shapes = [BandShape::LowShelf, BandShape::Peak, BandShape::HighShelf];
        let values = [gains.low_db, gains.mid_db, gains.high_db];
        for ((band, shape), value) in self.bands.iter_mut().zip(shapes).zip(values) {
            band.design(shape, value.unwrap_or(0.0), self.sample_rate);
        }
        self.designed_for = gains;
    }

    /// Clear filter history, keeping coefficients.
    pub fn reset(&mut self) {
        self.bands.iter_mut().for_each(Biquad::reset);
    }

    /// Filter one frame through all three bands.
    #[inline]
    pub fn process(&mut self, frame: Stereo<f32>) -> Stereo<f32> {
        self.bands
            .iter_mut()
            .fold(frame, |acc, band| band.process(acc))
    }
}

#[derive(Clone, Debug)]
struct ToneSlot {
    client_id: Option<u32>,
    shaper: ToneShaper,
}

/// State the IO cycle owns exclusively: one tone shaper per table slot.
///
/// Create it once, off the real-time path, and hand it to the audio thread.
pub struct RealtimeProcessor {
    tone: Box<[ToneSlot]>,
}

impl RealtimeProcessor {
    /// Pre-allocate state for every slot of `engine`'s client table.
    pub fn new(engine: &ClientEngine) -> Self {
        let config = engine.config();
        let slot = ToneSlot {
            client_id: None,
            shaper: ToneShaper::new(config.sample_rate),
        };
        Self {
            tone: vec![slot; engine.table_capacity()].into_boxed_slice(),
        }
    }

    /// Apply the client's gain pipeline to its interleaved stereo `buffer` in place.
    ///
    /// Unknown clients are left untouched and `false` is returned.
    pub fn process_client(
        &mut self,
        engine: &ClientEngine,
        client_id: u32,
        buffer: &mut [f32],
        frame_count: usize,
    ) -> bool {
        let Some((slot_index, record)) = engine.client_slot_rt(client_id) else {
            return false;
        };
        let frames = frame_count.min(buffer.len() / 2);
        let samples = &mut buffer[..frames * 2];

        if record.muted || (engine.solo_active_rt() && !record.soloed) {
            samples.fill(0.0);
            return true;
        }

        let gain = trim_gain(record.trim_db) * record.relative_volume;
        let pan = pan_gains(record.pan_position);

        let Some(slot) = self.tone.get_mut(slot_index) else {
            return true;
        };
        if slot.client_id != Some(client_id) {
            slot.client_id = Some(client_id);
            slot.shaper.reset();
        }
        let shape = !record.eq.is_flat();
        if shape {
            slot.shaper.set_gains(record.eq);
        }

        for chunk in samples.chunks_exact_mut(2) {
            let mut frame: Stereo<f32> = [chunk[0], chunk[1]];
            frame = frame.scale_amp(gain).mul_amp(pan);
            if shape {
                frame = slot.shaper.process(frame);
            }
            chunk[0] = frame[0];
            chunk[1] = frame[1];
        }
        true
    }
}
