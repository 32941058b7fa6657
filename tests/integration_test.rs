use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use serde_json::json;

use micdeck::host::{CaptureConstraints, OutputKind, PermissionOutcome, VirtualHost};
use micdeck::router::Mechanism;
use micdeck::settings::{
    load_string, JsonFileSettings, MemorySettings, SettingsStore, INPUT_DEVICE_KEY, MONITOR_DEVICE_KEY,
    OUTPUT_DEVICE_KEY, PARAMS_KEY,
};
use micdeck::{
    AudioDevice, DeviceId, DeviceRole, EffectParameters, Engine, EngineConfig, EngineState, Error, OutputRole,
    SmoothingPolicy, BLOCK_SIZE,
};

const RATE: usize = 48_000;

fn host() -> VirtualHost {
    VirtualHost::new()
        .with_device(AudioDevice::new("mic", "Mic", DeviceRole::Input))
        .with_device(AudioDevice::new("cable", "Virtual Cable", DeviceRole::Output))
        .with_device(AudioDevice::new("phones", "Headphones", DeviceRole::Output))
}

/// Monitor on the headphones so the cable only ever carries the main mix.
fn settings() -> MemorySettings {
    let mut settings = MemorySettings::new();
    settings.save(MONITOR_DEVICE_KEY, json!("phones")).unwrap();
    settings
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.reverb.seed = Some(42);
    config
}

fn instant_config() -> EngineConfig {
    let mut config = config();
    config.smoothing = SmoothingPolicy::Instant;
    config
}

fn started(host: &VirtualHost, config: EngineConfig) -> Engine<VirtualHost, MemorySettings> {
    let mut engine = Engine::new(host.clone(), settings(), config);
    engine.start().unwrap();
    engine
}

/// Feed one block of mono input per rendered block.
fn run_with_input(engine: &mut Engine<VirtualHost, MemorySettings>, host: &VirtualHost, input: &[f32]) {
    for block in input.chunks(BLOCK_SIZE) {
        host.feed_input(block);
        assert!(engine.process());
    }
}

fn run(engine: &mut Engine<VirtualHost, MemorySettings>, blocks: usize) {
    for _ in 0..blocks {
        assert!(engine.process());
    }
}

fn left(interleaved: &[f32]) -> Vec<f32> {
    interleaved.iter().step_by(2).copied().collect()
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

fn energy(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s * s).sum()
}

fn cable() -> DeviceId {
    DeviceId::new("cable")
}

fn phones() -> DeviceId {
    DeviceId::new("phones")
}

#[test]
fn cold_start_glides_up_from_silence() {
    let host = host();
    let mut engine = started(&host, config());
    run_with_input(&mut engine, &host, &vec![0.5; RATE]);

    let out = left(&host.drain_output(&cable(), OutputKind::Direct));
    assert!(out.len() >= RATE - BLOCK_SIZE);
    assert!(peak(&out[..BLOCK_SIZE]) < 0.01, "pop at start: {}", peak(&out[..BLOCK_SIZE]));
    assert_abs_diff_eq!(out[out.len() - 1], 0.5, epsilon = 0.01);
}

#[test]
fn capture_is_requested_without_voice_processing() {
    let host = host();
    let _engine = started(&host, config());
    assert_eq!(host.last_constraints(), Some(CaptureConstraints::raw()));
    assert_eq!(host.live_captures(), 1);
}

#[test]
fn configured_permission_timeout_reaches_the_host() {
    let mut config = config();
    config.permission_timeout = Duration::from_secs(3);

    let silent = host();
    silent.set_permission(PermissionOutcome::Unanswered);
    let mut engine = Engine::new(silent, settings(), config.clone());
    match engine.start() {
        Err(Error::PermissionDenied(reason)) => assert_eq!(reason, "unanswered after 3s"),
        other => panic!("expected a denied capture, got {other:?}"),
    }

    let host = host();
    let _engine = started(&host, config);
    let constraints = host.last_constraints().unwrap();
    assert_eq!(constraints.permission_timeout, Duration::from_secs(3));
    assert!(!constraints.echo_cancellation && !constraints.noise_suppression && !constraints.auto_gain_control);
}

#[test]
fn applying_the_same_snapshot_twice_changes_nothing() {
    let host = host();
    let mut engine = started(&host, config());
    let params = EffectParameters {
        input_gain: 1.4,
        reverb_mix: 0.3,
        delay_mix: 0.2,
        delay_time: 0.45,
        delay_feedback: 0.6,
        ..EffectParameters::default()
    };

    engine.set_parameters(params);
    let first = engine.signal().unwrap().targets();
    engine.set_parameters(params);
    assert_eq!(engine.signal().unwrap().targets(), first);
    assert_eq!(first.delay_time, 0.45);
    assert_eq!(first.delay_feedback, 0.6);
}

#[test]
fn mute_silences_output_but_keeps_master_gain() {
    let host = host();
    let mut engine = started(&host, config());
    engine.update_parameters(|p| p.master_gain = 1.3);
    engine.update_parameters(|p| p.is_muted = true);
    assert_eq!(engine.parameters().master_gain, 1.3);
    assert_eq!(engine.signal().unwrap().targets().master_gain, 0.0);

    run_with_input(&mut engine, &host, &vec![0.5; RATE / 2]);
    let out = left(&host.drain_output(&cable(), OutputKind::Direct));
    assert!(peak(&out[out.len() - BLOCK_SIZE..]) < 1e-3);

    let restored = engine.update_parameters(|p| p.is_muted = false);
    assert_eq!(restored.master_gain, 1.3);
    assert_eq!(engine.signal().unwrap().targets().master_gain, 1.3);
}

#[test]
fn feedback_at_or_above_one_is_clamped() {
    let host = host();
    let mut engine = started(&host, config());
    let stored = engine.update_parameters(|p| p.delay_feedback = 1.5);
    assert!(stored.delay_feedback < 1.0);
    assert_eq!(engine.signal().unwrap().targets().delay_feedback, stored.delay_feedback);
}

#[test]
fn delay_echoes_decay() {
    let host = host();
    let mut engine = started(&host, instant_config());
    engine.set_parameters(EffectParameters {
        delay_mix: 1.0,
        delay_time: 0.05,
        delay_feedback: 0.9,
        reverb_mix: 0.0,
        ..EffectParameters::default()
    });

    let mut input = vec![0.0; RATE / 2];
    input[10 * BLOCK_SIZE] = 1.0;
    run_with_input(&mut engine, &host, &input);
    let out = left(&host.drain_output(&cable(), OutputKind::Direct));

    let t0 = out.iter().position(|s| s.abs() > 0.5).expect("dry impulse");
    let echo = 2_400;
    let peaks: Vec<f32> = (1..=5)
        .map(|k| peak(&out[t0 + k * echo - 50..t0 + k * echo + 50]))
        .collect();
    assert!(peaks[0] > 0.9, "first echo {peaks:?}");
    assert!(peaks.windows(2).all(|w| w[1] < w[0]), "echoes must decay: {peaks:?}");
    assert!(peak(&out) < 1.5);
}

#[test]
fn reverb_tail_outlasts_the_dry_impulse() {
    let host = host();
    let mut engine = started(&host, instant_config());
    engine.set_parameters(EffectParameters {
        reverb_mix: 1.0,
        reverb_decay: 0.5,
        delay_mix: 0.0,
        ..EffectParameters::default()
    });

    let mut input = vec![0.0; RATE / 2];
    input[10 * BLOCK_SIZE] = 1.0;
    run_with_input(&mut engine, &host, &input);
    let out = left(&host.drain_output(&cable(), OutputKind::Direct));

    let t0 = out.iter().position(|s| s.abs() > 0.5).expect("dry impulse");
    let early = energy(&out[t0 + 2_400..t0 + 7_200]);
    let late = energy(&out[t0 + 14_400..t0 + 19_200]);
    assert!(early > 1e-6, "no reverb tail: {early}");
    assert!(late < early, "tail should decay: early {early}, late {late}");
}

#[test]
fn test_tone_rises_quickly_and_dies_away() {
    let host = host();
    let mut config = config();
    config.analyser.smoothing = 0.0;
    let mut engine = started(&host, config);

    engine.play_test_tone().unwrap();
    assert_eq!(engine.signal().unwrap().active_tones(), 1);

    // ~50 ms
    run(&mut engine, 37);
    let early = engine.sample_levels();
    assert!(early.output > 0.02, "tone not visible: {early:?}");

    // ~1.1 s
    run(&mut engine, 825 - 37);
    let late = engine.sample_levels();
    assert!(late.output < 0.02, "tone still audible: {late:?}");
    assert_eq!(engine.signal().unwrap().active_tones(), 0);
}

#[test]
fn spectrum_fills_the_callers_buffer() {
    let host = host();
    let mut engine = started(&host, config());
    let mut bins = vec![7u8; engine.frequency_bin_count()];
    engine.sample_spectrum(&mut bins);
    assert!(bins.iter().all(|&b| b == 0));

    engine.play_test_tone().unwrap();
    run(&mut engine, 40);
    engine.sample_spectrum(&mut bins);
    assert!(bins.iter().any(|&b| b > 0));
}

#[test]
fn switching_input_never_holds_two_captures() {
    let host = host().with_device(AudioDevice::new("usb", "USB Interface", DeviceRole::Input));
    let mut engine = started(&host, config());
    run(&mut engine, 4);

    let chosen = engine.select_input(DeviceId::new("usb")).unwrap();
    assert_eq!(chosen, DeviceId::new("usb"));
    assert_eq!(engine.state(), EngineState::Live);
    assert_eq!(host.capture_requests(), 2);
    assert_eq!(host.live_captures(), 1);
    assert_eq!(host.max_live_captures(), 1);
    assert_eq!(load_string(engine.settings(), INPUT_DEVICE_KEY).as_deref(), Some("usb"));
}

#[test]
fn no_outputs_then_a_device_appears() {
    let host = VirtualHost::new().with_device(AudioDevice::new("mic", "Mic", DeviceRole::Input));
    let mut engine = Engine::new(host.clone(), MemorySettings::new(), config());
    engine.start().unwrap();
    assert!(engine.selection().main_output.is_none());
    assert!(engine.selection().monitor.is_none());
    assert_eq!(engine.mechanism(OutputRole::Main), None);
    run(&mut engine, 4);

    host.add_device(AudioDevice::new("cable", "Virtual Cable", DeviceRole::Output));
    engine.refresh_devices().unwrap();
    assert_eq!(engine.selection().main_output, Some(cable()));
    assert_eq!(engine.mechanism(OutputRole::Main), Some(Mechanism::Direct));
    assert!(host.output_open(&cable(), OutputKind::Direct));
}

#[test]
fn labels_show_up_once_permission_is_granted() {
    let host = host();
    let engine = started(&host, config());
    assert_eq!(engine.inputs()[0].label, "Mic");
    assert_eq!(engine.outputs().len(), 2);
}

#[test]
fn legacy_main_output_plays_through_the_element() {
    let host = host();
    host.set_direct_supported(false);
    let mut engine = started(&host, config());
    assert_eq!(engine.mechanism(OutputRole::Main), Some(Mechanism::Stream));

    let router = engine.router().unwrap();
    let element = router.element(OutputRole::Main);
    assert!(element.is_open());
    assert!(!element.is_muted());
    assert_eq!(element.sink_id(), Some(&cable()));
    assert!(!engine.signal().unwrap().is_direct_connected());
    assert_eq!(host.output_format(&cable(), OutputKind::Stream), Some((2, 44_100)));

    engine.play_test_tone().unwrap();
    run(&mut engine, 100);
    let out = host.drain_output(&cable(), OutputKind::Stream);
    assert!(peak(&out) > 0.05);
    assert!(host.drain_output(&cable(), OutputKind::Direct).is_empty());
}

#[test]
fn monitoring_for_every_mechanism_and_flag() {
    for direct in [true, false] {
        for enabled in [true, false] {
            let host = host();
            host.set_direct_supported(direct);
            let mut engine = started(&host, config());
            engine.update_parameters(|p| p.monitoring_enabled = enabled);

            let mechanism = engine.mechanism(OutputRole::Monitor);
            let router = engine.router().unwrap();
            let element = router.element(OutputRole::Monitor);
            let gain = router.monitor_context().gain_target();
            let case = format!("direct={direct} enabled={enabled}");

            if direct {
                assert_eq!(mechanism, Some(Mechanism::Direct), "{case}");
                assert_eq!(gain, if enabled { 1.0 } else { 0.0 }, "{case}");
                assert!(element.is_muted(), "{case}");
            } else {
                assert_eq!(mechanism, Some(Mechanism::Stream), "{case}");
                assert_eq!(gain, 0.0, "{case}");
                assert_eq!(element.is_muted(), !enabled, "{case}");
            }

            engine.play_test_tone().unwrap();
            run(&mut engine, 100);
            let kind = if direct { OutputKind::Direct } else { OutputKind::Stream };
            let heard = peak(&host.drain_output(&phones(), kind));
            if enabled {
                assert!(heard > 0.05, "{case}: monitor silent");
            } else {
                assert!(heard < 1e-4, "{case}: monitor leaked {heard}");
            }
        }
    }
}

#[test]
fn monitoring_is_rederived_across_mechanism_switches() {
    let host = host().with_device(AudioDevice::new("speakers", "Speakers", DeviceRole::Output));
    let mut engine = started(&host, config());
    engine.update_parameters(|p| p.monitoring_enabled = true);
    assert_eq!(engine.mechanism(OutputRole::Monitor), Some(Mechanism::Direct));

    host.set_direct_supported(false);
    engine.select_monitor_output(DeviceId::new("speakers")).unwrap();
    let router = engine.router().unwrap();
    assert_eq!(router.mechanism(OutputRole::Monitor), Some(Mechanism::Stream));
    assert!(!router.element(OutputRole::Monitor).is_muted());
    assert_eq!(router.monitor_context().gain_target(), 0.0);

    host.set_direct_supported(true);
    engine.select_monitor_output(phones()).unwrap();
    let router = engine.router().unwrap();
    assert_eq!(router.mechanism(OutputRole::Monitor), Some(Mechanism::Direct));
    assert!(router.element(OutputRole::Monitor).is_muted());
    assert_eq!(router.monitor_context().gain_target(), 1.0);
    assert_eq!(load_string(engine.settings(), MONITOR_DEVICE_KEY).as_deref(), Some("phones"));
}

#[test]
fn unroutable_device_keeps_current_output() {
    let host = host();
    let mut engine = started(&host, config());
    host.set_direct_supported(false);
    host.set_stream_supported(false);

    let err = engine.select_main_output(phones()).unwrap_err();
    assert!(matches!(
        &err,
        Error::RoutingUnsupported { role: OutputRole::Main, device } if device == &phones()
    ));
    assert!(err.is_user_visible());
    assert_eq!(engine.state(), EngineState::Live);
    assert_eq!(engine.selection().main_output, Some(cable()));
    assert_eq!(engine.mechanism(OutputRole::Main), Some(Mechanism::Direct));
    assert!(host.output_open(&cable(), OutputKind::Direct));
}

#[test]
fn missing_device_is_replaced_not_fatal() {
    let host = host();
    let mut settings = settings();
    settings.save(OUTPUT_DEVICE_KEY, json!("gone")).unwrap();
    let mut engine = Engine::new(host.clone(), settings, config());
    engine.start().unwrap();

    // Pending selection: routed to the default device meanwhile
    assert_eq!(engine.selection().main_output, Some(DeviceId::new("gone")));
    assert_eq!(engine.mechanism(OutputRole::Main), Some(Mechanism::Direct));

    let chosen = engine.select_main_output(DeviceId::new("gone")).unwrap();
    assert_eq!(chosen, cable());
    assert_eq!(engine.selection().main_output, Some(cable()));
    assert_eq!(load_string(engine.settings(), OUTPUT_DEVICE_KEY).as_deref(), Some("cable"));
}

#[test]
fn context_failure_is_fatal_and_releases_the_microphone() {
    let host = host();
    host.set_fail_context(true);
    let mut engine = Engine::new(host.clone(), settings(), config());

    let err = engine.start().unwrap_err();
    assert!(matches!(err, Error::GraphConstructionFailed(_)));
    assert_eq!(engine.state(), EngineState::Uninitialized);
    assert_eq!(host.live_captures(), 0);
    assert!(engine.signal().is_none());
}

#[test]
fn denied_or_unanswered_permission_is_reported() {
    for outcome in [PermissionOutcome::Deny, PermissionOutcome::Unanswered] {
        let host = host();
        host.set_permission(outcome);
        let mut engine = Engine::new(host.clone(), settings(), config());

        let err = engine.start().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)), "{outcome:?}");
        assert!(err.is_user_visible());
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert_eq!(engine.sample_levels().output, 0.0);
    }
}

#[test]
fn stored_parameters_merge_over_defaults() {
    let mut settings = settings();
    settings
        .save(PARAMS_KEY, json!({ "reverbMix": 0.4, "knobColor": "red", "delayMix": "loud" }))
        .unwrap();
    let engine = Engine::new(host(), settings, config());

    let params = engine.parameters();
    assert_eq!(params.reverb_mix, 0.4);
    assert_eq!(params.delay_mix, EffectParameters::default().delay_mix);
    assert_eq!(params.master_gain, EffectParameters::default().master_gain);
}

#[test]
fn parameter_saves_are_debounced() {
    let host = host();
    let mut engine = started(&host, config());
    engine.update_parameters(|p| p.reverb_mix = 0.25);

    assert!(!engine.tick(Instant::now()).unwrap());
    assert!(engine.settings().load(PARAMS_KEY).is_none());

    assert!(engine.tick(Instant::now() + Duration::from_millis(300)).unwrap());
    let saved = engine.settings().load(PARAMS_KEY).unwrap();
    assert_eq!(saved["reverbMix"], json!(0.25));
    assert!(!engine.tick(Instant::now() + Duration::from_secs(1)).unwrap());
}

#[test]
fn selections_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("micdeck.json");
    let host = host().with_device(AudioDevice::new("usb", "USB Interface", DeviceRole::Input));

    {
        let settings = JsonFileSettings::open(&path).unwrap();
        let mut engine = Engine::new(host.clone(), settings, config());
        engine.select_input(DeviceId::new("usb")).unwrap();
        engine.update_parameters(|p| p.delay_mix = 0.5);
        engine.stop().unwrap();
    }

    let settings = JsonFileSettings::open(&path).unwrap();
    let engine = Engine::new(host, settings, config());
    assert_eq!(engine.selection().input, Some(DeviceId::new("usb")));
    assert_eq!(engine.parameters().delay_mix, 0.5);
}

#[test]
fn two_engines_run_side_by_side() {
    let a = host();
    let b = host();
    let mut first = started(&a, config());
    let mut second = started(&b, config());
    first.update_parameters(|p| p.is_muted = true);

    assert!(!second.parameters().is_muted);
    run(&mut first, 2);
    run(&mut second, 2);
    assert_eq!(first.blocks_processed(), 2);
    assert_eq!(second.blocks_processed(), 2);
}

#[test]
fn stereo_capture_at_another_rate_is_adapted() {
    let host = host();
    host.set_capture_format(2, 44_100);
    let mut engine = started(&host, config());

    // 60 stereo frames per block stays just ahead of the 58.8 consumed
    let chunk = vec![0.5; 120];
    for _ in 0..375 {
        host.feed_input(&chunk);
        assert!(engine.process());
    }
    let out = left(&host.drain_output(&cable(), OutputKind::Direct));
    assert_abs_diff_eq!(out[out.len() - 1], 0.5, epsilon = 0.01);
}

#[test]
fn element_plays_at_the_device_native_rate() {
    let host = host();
    host.set_direct_supported(false);
    host.set_stream_rate(48_000);
    let engine = started(&host, config());
    assert_eq!(host.output_format(&cable(), OutputKind::Stream), Some((2, 48_000)));
    assert_eq!(engine.mechanism(OutputRole::Monitor), Some(Mechanism::Stream));
}

#[test]
fn unplugged_monitor_is_replaced_on_next_selection() {
    let host = host();
    let mut engine = started(&host, config());
    host.remove_device(&phones());

    assert!(engine.refresh_devices().unwrap().is_empty());
    assert_eq!(engine.selection().monitor, Some(phones()));

    let chosen = engine.select_monitor_output(phones()).unwrap();
    assert_eq!(chosen, cable());
    assert_eq!(engine.mechanism(OutputRole::Monitor), Some(Mechanism::Direct));
    assert_eq!(load_string(engine.settings(), MONITOR_DEVICE_KEY).as_deref(), Some("cable"));
}

#[test]
fn stored_outputs_are_routed_when_they_come_back() {
    let host = VirtualHost::new().with_device(AudioDevice::new("mic", "Mic", DeviceRole::Input));
    let mut settings = settings();
    settings.save(OUTPUT_DEVICE_KEY, json!("cable")).unwrap();
    let mut engine = Engine::new(host.clone(), settings, config());
    engine.start().unwrap();
    assert_eq!(engine.mechanism(OutputRole::Main), None);
    assert_eq!(engine.router().unwrap().device(OutputRole::Monitor), None);
    run(&mut engine, 4);

    host.add_device(AudioDevice::new("cable", "Virtual Cable", DeviceRole::Output));
    host.add_device(AudioDevice::new("phones", "Headphones", DeviceRole::Output));
    // Both roles already had a choice, so nothing is auto-selected
    assert!(engine.refresh_devices().unwrap().is_empty());

    let router = engine.router().unwrap();
    assert_eq!(router.device(OutputRole::Main), Some(&cable()));
    assert_eq!(router.device(OutputRole::Monitor), Some(&phones()));
    assert_eq!(engine.mechanism(OutputRole::Main), Some(Mechanism::Direct));
    assert!(host.output_open(&cable(), OutputKind::Direct));
    assert_eq!(engine.selection().main_output, Some(cable()));
    run(&mut engine, 4);
}

#[test]
fn failed_fallback_route_keeps_selection_and_setting() {
    let host = VirtualHost::new()
        .with_device(AudioDevice::new("mic", "Mic", DeviceRole::Input))
        .with_device(AudioDevice::new("phones", "Headphones", DeviceRole::Output))
        .with_device(AudioDevice::new("cable", "Virtual Cable", DeviceRole::Output));
    let mut settings = settings();
    settings.save(OUTPUT_DEVICE_KEY, json!("cable")).unwrap();
    let mut engine = Engine::new(host.clone(), settings, config());
    engine.start().unwrap();
    assert_eq!(engine.router().unwrap().device(OutputRole::Main), Some(&cable()));

    host.set_direct_supported(false);
    host.set_stream_supported(false);
    // "ghost" falls back to the first output, which cannot be routed
    let err = engine.select_main_output(DeviceId::new("ghost")).unwrap_err();
    assert!(matches!(
        &err,
        Error::RoutingUnsupported { role: OutputRole::Main, device } if device == &phones()
    ));

    assert_eq!(engine.state(), EngineState::Live);
    assert_eq!(engine.selection().main_output, Some(cable()));
    assert_eq!(load_string(engine.settings(), OUTPUT_DEVICE_KEY).as_deref(), Some("cable"));
    assert_eq!(engine.router().unwrap().device(OutputRole::Main), Some(&cable()));
}
