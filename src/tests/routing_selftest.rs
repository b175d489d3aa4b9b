use dasp_signal::{self as signal, Signal};

use crate::{ClientEngine, ClientIdentity, ClientRecord, ClientVolumeUpdate, EngineConfig, NullSink};
use crate::RealtimeProcessor;

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_FRAMES: usize = 256;

fn sine_block_stream(total_frames: usize) -> Vec<f32> {
    let mut sine = signal::rate(SAMPLE_RATE as f64).const_hz(1_000.0).sine();
    let mut input = Vec::with_capacity(total_frames * 2);
    for _ in 0..total_frames {
        let sample = sine.next() as f32 * 0.5;
        input.push(sample);
        input.push(sample);
    }
    input
}

fn engine_with_route(gain: f32) -> ClientEngine {
    let engine = ClientEngine::new(
        EngineConfig::default().with_routing_buffer_frames(BLOCK_FRAMES * 8),
        NullSink,
    )
    .unwrap();
    engine
        .add_client(ClientRecord::new(ClientIdentity::new(1, 100)))
        .unwrap();
    engine
        .add_client(ClientRecord::new(ClientIdentity::new(2, 200)))
        .unwrap();
    engine.set_route(100, 200, gain, true).unwrap();
    engine
}

#[test]
fn routing_selftest_sine_through_engine() {
    let engine = engine_with_route(1.0);
    let input = sine_block_stream((SAMPLE_RATE / 10) as usize);

    let mut recorded = Vec::with_capacity(input.len());
    for chunk in input.chunks(BLOCK_FRAMES * 2) {
        let frames = chunk.len() / 2;
        engine.store_client_audio(1, chunk, frames);
        let mut output = vec![0.0f32; frames * 2];
        engine.mix_routed_audio(2, &mut output, frames);
        recorded.extend_from_slice(&output);
    }

    assert_eq!(recorded.len(), input.len());
    let expected_rms = rms(&input);
    let actual_rms = rms(&recorded);
    assert!(
        (expected_rms - actual_rms).abs() < 1e-4,
        "RMS mismatch: expected {expected_rms}, got {actual_rms}"
    );
    let corr = correlation(&input, &recorded);
    assert!(corr > 0.999, "phase correlation too low: {corr}");
}

#[test]
fn routed_audio_is_taken_before_the_source_gain_stage() {
    let engine = engine_with_route(0.5);
    engine.set_clients_relative_volumes(&[ClientVolumeUpdate {
        relative_volume: Some(0.0),
        ..ClientVolumeUpdate::for_pid(100)
    }]);
    let mut rt = RealtimeProcessor::new(&engine);

    let mut source = sine_block_stream(BLOCK_FRAMES);
    let original = source.clone();
    engine.store_client_audio(1, &source, BLOCK_FRAMES);
    rt.process_client(&engine, 1, &mut source, BLOCK_FRAMES);
    assert!(source.iter().all(|s| *s == 0.0));

    let mut output = vec![0.0f32; BLOCK_FRAMES * 2];
    engine.mix_routed_audio(2, &mut output, BLOCK_FRAMES);
    let expected = rms(&original) * 0.5;
    assert!((rms(&output) - expected).abs() < 1e-4);
}

fn rms(signal: &[f32]) -> f32 {
    let energy: f32 = signal.iter().map(|s| s * s).sum();
    (energy / signal.len() as f32).sqrt()
}

fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut energy_a = 0.0f64;
    let mut energy_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        energy_a += (*x as f64).powi(2);
        energy_b += (*y as f64).powi(2);
    }
    if energy_a == 0.0 || energy_b == 0.0 {
        0.0
    } else {
        (dot / (energy_a.sqrt() * energy_b.sqrt())) as f32
    }
}
