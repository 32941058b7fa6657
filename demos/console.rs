//! Live console on the default microphone and output
//!
//! Run with: cargo run --example console --features cpal_sink [settings.json]

use std::thread::sleep;
use std::time::{Duration, Instant};

use micdeck::host::CpalHost;
use micdeck::settings::JsonFileSettings;
use micdeck::{Engine, EngineConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "micdeck.json".into());
    let config = EngineConfig::default();
    let host = CpalHost::new();
    let settings = JsonFileSettings::open(path)?;

    let mut engine = Engine::new(host, settings, config);
    engine.start()?;
    for device in engine.outputs() {
        println!("output: {} ({})", device.label, device.id);
    }
    println!("Live on {:?}. Ctrl+C to stop", engine.selection().main_output);

    engine.update_parameters(|p| {
        p.reverb_mix = 0.25;
        p.delay_mix = 0.15;
    });
    engine.play_test_tone()?;

    let start = Instant::now();
    let mut last_print = start;
    loop {
        engine.catch_up(start.elapsed());
        engine.tick(Instant::now())?;

        if last_print.elapsed() >= Duration::from_millis(250) {
            let levels = engine.sample_levels();
            println!("in {:>5.2}  out {:>5.2}", levels.input, levels.output);
            last_print = Instant::now();
        }
        sleep(Duration::from_micros(500));
    }
}
