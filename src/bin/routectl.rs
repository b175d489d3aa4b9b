use std::env;
use std::process;

use dasp_signal::{self as signal, Signal};

use client_engine::client::relative_volume_to_raw;
use client_engine::logging::init_tracing;
use client_engine::{
    ClientEngine, ClientIdentity, ClientRecord, ClientVolumeUpdate, EngineConfig,
    PropertiesChanged, RealtimeProcessor,
};

const DEMO_BLOCK_FRAMES: usize = 256;
const DEMO_BLOCKS: usize = 8;

fn print_status(engine: &ClientEngine) {
    let status = engine.status();
    println!("Running IO  : {}", status.clients_running_io);
    println!("Not app IO  : {}", status.clients_other_than_app_running_io);
    if let Some(pid) = status.music_player_pid {
        println!("Music player: pid {pid}");
    }
    if let Some(bundle) = &status.music_player_bundle_id {
        println!("Music player: {bundle}");
    }
    println!("Clients:");
    for client in &status.clients {
        let record = &client.record;
        println!(
            "  [{}] pid={} bundle={} io={} vol={:.0} ({:.2}x) pan={} muted={} routing={}",
            record.client_id(),
            record.process_id(),
            record.bundle_id().unwrap_or("-"),
            if record.doing_io { "yes" } else { "no" },
            relative_volume_to_raw(record.relative_volume),
            record.relative_volume,
            record.pan_position,
            if record.muted { "yes" } else { "no" },
            if client.has_routing_buffer { "yes" } else { "no" },
        );
    }
    println!("Routes:");
    for route in &status.routes {
        println!(
            "  {} -> {} gain={:.2} {}",
            route.source_pid,
            route.dest_pid,
            route.gain,
            if route.enabled { "enabled" } else { "disabled" },
        );
    }
}

fn rms(samples: &[f32]) -> f32 {
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len().max(1) as f32).sqrt()
}

fn run_demo() -> Result<(), client_engine::EngineError> {
    let config = EngineConfig::from_env();
    let sample_rate = config.sample_rate;
    let engine = ClientEngine::new(config, |change: PropertiesChanged| {
        let names: Vec<String> = change.properties().map(|p| format!("{p:?}")).collect();
        println!("notification: {}", names.join(", "));
    })?;

    let app_bundle = engine.config().app_bundle_id.clone();
    engine.add_client(ClientRecord::new(
        ClientIdentity::new(1, 4_001).with_bundle_id("com.example.Player"),
    ))?;
    engine.add_client(ClientRecord::new(
        ClientIdentity::new(2, 4_002).with_bundle_id("com.example.Recorder"),
    ))?;
    engine.add_client(ClientRecord::new(
        ClientIdentity::new(3, 4_003).with_bundle_id(app_bundle),
    ))?;

    engine.set_music_player_bundle_id("com.example.Player");
    engine.set_route(4_001, 4_002, 0.5, true)?;
    engine.set_clients_relative_volumes(&[ClientVolumeUpdate {
        pan_position: Some(-50),
        ..ClientVolumeUpdate::for_pid(4_001)
    }]);

    for client_id in 1..=3 {
        engine.start_io(client_id)?;
    }

    let mut rt = RealtimeProcessor::new(&engine);
    let mut sine = signal::rate(sample_rate as f64).const_hz(440.0).sine();
    let mut routed_rms = 0.0;
    for _ in 0..DEMO_BLOCKS {
        let mut player: Vec<f32> = (0..DEMO_BLOCK_FRAMES)
            .flat_map(|_| {
                let sample = sine.next() as f32 * 0.5;
                [sample, sample]
            })
            .collect();
        engine.store_client_audio(1, &player, DEMO_BLOCK_FRAMES);
        rt.process_client(&engine, 1, &mut player, DEMO_BLOCK_FRAMES);

        let mut recorder = vec![0.0f32; DEMO_BLOCK_FRAMES * 2];
        rt.process_client(&engine, 2, &mut recorder, DEMO_BLOCK_FRAMES);
        engine.mix_routed_audio(2, &mut recorder, DEMO_BLOCK_FRAMES);
        routed_rms = rms(&recorder);
    }

    print_status(&engine);
    println!("Routed RMS  : {routed_rms:.3}");

    for client_id in 1..=3 {
        engine.stop_io(client_id)?;
    }
    engine.remove_client(1)?;
    println!("After player disconnect: {} route(s)", engine.export_routes().len());
    Ok(())
}

fn main() {
    init_tracing();
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("--demo") | Some("-d") => {
            if let Err(err) = run_demo() {
                eprintln!("routectl: {err}");
                process::exit(1);
            }
        }
        None | Some("--help") | Some("-h") => {
            println!(
                "Usage: routectl [--demo]\n\n--demo wires three clients together, routes a sine \
                 tone between them and prints the resulting engine state."
            );
        }
        Some(other) => {
            eprintln!("routectl: unknown argument '{other}'");
            process::exit(1);
        }
    }
}
