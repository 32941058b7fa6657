//! Engine - lifecycle, device switching and the control surface
//!
//! An [`Engine`] owns everything: the host, the settings store, the device
//! directory, the parameter store and (once started) the signal graph and
//! output router. The caller drives rendering by calling
//! [`process`](Engine::process) or [`catch_up`](Engine::catch_up) and polls
//! levels and spectra at whatever cadence suits it.

use core::fmt;
use std::time::{Duration, Instant};

use delegate::delegate;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::device::{AudioDevice, DeviceDirectory, DeviceId, OutputRole, RoutingSelection, SelectionRole};
use crate::error::{Error, Result};
use crate::host::{AudioHost, CaptureConstraints, CaptureStream, StreamHandle};
use crate::meter::Levels;
use crate::node::BLOCK_SIZE;
use crate::params::{EffectParameters, ParameterStore};
use crate::resample::ResamplingReader;
use crate::router::{Mechanism, OutputRouter};
use crate::settings::{
    load_string, merge_over_defaults, SettingsStore, INPUT_DEVICE_KEY, MONITOR_DEVICE_KEY, OUTPUT_DEVICE_KEY,
    PARAMS_KEY,
};
use crate::signal::SignalGraph;

/// Lifecycle of an [`Engine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing built; no capture open.
    Uninitialized,
    /// Graph built and wired, every gain still at zero.
    Armed,
    /// Parameters applied; audio flows.
    Live,
    /// A device swap is in flight.
    Reconfiguring,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Armed => "armed",
            EngineState::Live => "live",
            EngineState::Reconfiguring => "reconfiguring",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Active {
    signal: SignalGraph,
    router: OutputRouter,
    capture: Option<StreamHandle>,
}

/// The console engine.
///
/// Built explicitly and owned by the application; any number can coexist.
pub struct Engine<H: AudioHost, S: SettingsStore> {
    host: H,
    settings: S,
    config: EngineConfig,
    directory: DeviceDirectory,
    params: ParameterStore,
    state: EngineState,
    active: Option<Active>,
}

impl<H: AudioHost, S: SettingsStore> Engine<H, S> {
    /// Create an engine, restoring parameters and device selections from `settings`.
    ///
    /// Nothing is opened until [`start`](Self::start).
    pub fn new(host: H, settings: S, config: EngineConfig) -> Self {
        let restored: EffectParameters = merge_over_defaults(settings.load(PARAMS_KEY).as_ref());
        let selection = RoutingSelection {
            input: load_string(&settings, INPUT_DEVICE_KEY).map(DeviceId::new),
            main_output: load_string(&settings, OUTPUT_DEVICE_KEY).map(DeviceId::new),
            monitor: load_string(&settings, MONITOR_DEVICE_KEY).map(DeviceId::new),
        };
        debug!(host = host.name(), ?selection, "engine created");

        Self {
            params: ParameterStore::new(restored, config.max_delay_secs),
            directory: DeviceDirectory::with_selection(selection),
            host,
            settings,
            config,
            state: EngineState::Uninitialized,
            active: None,
        }
    }

    delegate! {
        to self.directory {
            /// Enumerated inputs, as of the last refresh.
            pub fn inputs(&self) -> &[AudioDevice];
            /// Enumerated outputs, as of the last refresh.
            pub fn outputs(&self) -> &[AudioDevice];
            /// Current device choice per role.
            pub fn selection(&self) -> &RoutingSelection;
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    /// The current parameter snapshot.
    #[inline]
    pub fn parameters(&self) -> EffectParameters {
        self.params.get()
    }

    /// The main signal graph, once started.
    pub fn signal(&self) -> Option<&SignalGraph> {
        self.active.as_ref().map(|a| &a.signal)
    }

    /// The output router, once started.
    pub fn router(&self) -> Option<&OutputRouter> {
        self.active.as_ref().map(|a| &a.router)
    }

    /// Mechanism currently carrying `role`, if routed.
    pub fn mechanism(&self, role: OutputRole) -> Option<Mechanism> {
        self.router().and_then(|r| r.mechanism(role))
    }

    /// Raw capture, answered within the configured permission timeout.
    fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints::raw().with_permission_timeout(self.config.permission_timeout)
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    /// Re-enumerate devices, auto-selecting for roles without a choice.
    ///
    /// Returns the roles that were auto-selected (and persisted). While
    /// running, every output whose selected device is present but not the one
    /// it plays on is routed right away; this covers auto-selections as well as
    /// stored devices that were unplugged at start and have come back.
    pub fn refresh_devices(&mut self) -> Result<Vec<SelectionRole>> {
        let devices = self.host.enumerate_devices()?;
        let picked = self.directory.refresh(devices);
        for &role in &picked {
            self.persist_selection(role)?;
        }
        for role in OutputRole::ALL {
            self.route_selected(role);
        }
        Ok(picked)
    }

    fn route_selected(&mut self, role: OutputRole) {
        let Some(id) = self.present(SelectionRole::Output(role)) else {
            return;
        };
        if let Some(active) = self.active.as_mut() {
            if active.router.device(role) == Some(&id) {
                return;
            }
            debug!(%role, %id, "routing present selection");
            if let Err(err) = active.router.set_output(&self.host, &mut active.signal, role, Some(&id)) {
                warn!(%role, %id, %err, "keeping previous route");
            }
        }
    }

    fn persist_selection(&mut self, role: SelectionRole) -> Result<()> {
        let key = match role {
            SelectionRole::Input => INPUT_DEVICE_KEY,
            SelectionRole::Output(OutputRole::Main) => OUTPUT_DEVICE_KEY,
            SelectionRole::Output(OutputRole::Monitor) => MONITOR_DEVICE_KEY,
        };
        match self.directory.selection().get(role) {
            Some(id) => self.settings.save(key, Value::String(id.as_str().to_owned())),
            None => self.settings.remove(key),
        }
    }

    /// The selection for `role` if its device is currently present.
    fn present(&self, role: SelectionRole) -> Option<DeviceId> {
        self.directory
            .selection()
            .get(role)
            .filter(|id| self.directory.contains(role.device_role(), id))
            .cloned()
    }

    /// Open the microphone, build the graph, route the outputs and go live.
    ///
    /// The capture is requested with every voice-processing stage off. The
    /// graph is armed with all gains at zero and only opened by applying the
    /// stored parameters, so the first rendered block is already at the
    /// intended levels (gliding up from silence).
    ///
    /// Fails with [`PermissionDenied`](Error::PermissionDenied) or
    /// [`GraphConstructionFailed`](Error::GraphConstructionFailed); in both
    /// cases nothing stays open.
    pub fn start(&mut self) -> Result<()> {
        if self.state != EngineState::Uninitialized {
            return Err(self.invalid("start"));
        }

        self.refresh_devices()?;
        let input = self.present(SelectionRole::Input);
        let capture = self.host.request_capture(input.as_ref(), &self.capture_constraints())?;
        info!(device = ?input, channels = capture.channels, rate = capture.sample_rate, "capture granted");
        // Labels are only visible now that permission is granted
        self.refresh_devices()?;

        let rate = self.host.create_context(self.config.sample_rate).map_err(|err| match err {
            Error::GraphConstructionFailed(_) => err,
            other => Error::GraphConstructionFailed(other.to_string()),
        })?;
        let mut signal = SignalGraph::build(rate, &self.config, &self.params.get())?;
        let mut router = OutputRouter::new(&self.host, &mut signal, &self.config)?;

        let (reader, capture) = capture_reader(&self.config, capture, rate);
        signal.attach_capture(reader)?;

        // Main: the selected device if present, else the default device
        let main = self.present(SelectionRole::Output(OutputRole::Main));
        let routed = main
            .as_ref()
            .map(|id| router.set_output(&self.host, &mut signal, OutputRole::Main, Some(id)));
        if !matches!(routed, Some(Ok(_))) {
            if let Some(Err(err)) = routed {
                warn!(%err, "selected main output unavailable, using the default device");
            }
            if let Err(err) = router.set_output(&self.host, &mut signal, OutputRole::Main, None) {
                warn!(%err, "default output unavailable");
            }
        }
        if let Some(id) = self.present(SelectionRole::Output(OutputRole::Monitor)) {
            if let Err(err) = router.set_output(&self.host, &mut signal, OutputRole::Monitor, Some(&id)) {
                warn!(%id, %err, "monitor output unavailable");
            }
        }

        self.active = Some(Active {
            signal,
            router,
            capture: Some(capture),
        });
        self.state = EngineState::Armed;
        info!(rate, "engine armed");

        self.apply_current();
        self.state = EngineState::Live;
        info!("engine live");
        Ok(())
    }

    /// Tear everything down in reverse order and return to `Uninitialized`.
    ///
    /// Pending parameter changes are persisted first.
    pub fn stop(&mut self) -> Result<()> {
        let flushed = self.flush_parameters();
        if let Some(mut active) = self.active.take() {
            let mut silent = self.params.get();
            silent.is_muted = true;
            active.signal.apply_parameters(&silent);
            drop(active.capture.take());
            active.signal.release_capture();
            active.router.shutdown(&mut active.signal);
            info!("engine stopped");
        }
        self.state = EngineState::Uninitialized;
        flushed
    }

    fn apply_current(&mut self) {
        let params = self.params.get();
        if let Some(active) = self.active.as_mut() {
            active.signal.apply_parameters(&params);
            active.router.apply_monitoring(params.monitoring_enabled);
        }
    }

    /// Render one block of the main graph and everything downstream of it.
    ///
    /// Returns `false` (and renders nothing) unless the engine is running.
    pub fn process(&mut self) -> bool {
        if !matches!(self.state, EngineState::Live | EngineState::Reconfiguring) {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let reaped = active.signal.reap_tones();
        if reaped > 0 {
            debug!(reaped, "test tone finished");
        }
        active.signal.process();
        active.router.after_block(active.signal.graph().blocks_processed());
        true
    }

    /// Render until the timeline is `lookahead_blocks` ahead of `elapsed`
    /// wall-clock time since start. Returns the blocks rendered.
    pub fn catch_up(&mut self, elapsed: Duration) -> usize {
        let Some(active) = self.active.as_ref() else {
            return 0;
        };
        let rate = active.signal.sample_rate() as u128;
        let due = elapsed.as_nanos() * rate / (BLOCK_SIZE as u128 * 1_000_000_000);
        let target = due as u64 + self.config.lookahead_blocks as u64;
        let mut rendered = 0;
        while self.blocks_processed() < target && self.process() {
            rendered += 1;
        }
        rendered
    }

    /// Blocks of the main graph rendered since start.
    pub fn blocks_processed(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.signal.graph().blocks_processed())
    }

    /// Persist the parameter snapshot once it has been stable for the debounce period.
    ///
    /// Returns whether anything was written.
    pub fn tick(&mut self, now: Instant) -> Result<bool> {
        match self.params.take_pending(now, self.config.persist_debounce) {
            Some(params) => {
                self.settings.save(PARAMS_KEY, serde_json::to_value(params)?)?;
                debug!("parameters persisted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn flush_parameters(&mut self) -> Result<()> {
        self.tick(Instant::now() + self.config.persist_debounce).map(|_| ())
    }

    /// Replace the whole parameter snapshot. Returns what was stored after clamping.
    ///
    /// Before [`start`](Self::start) the snapshot is only stored; it is applied
    /// in full once the graph is armed.
    pub fn set_parameters(&mut self, params: EffectParameters) -> EffectParameters {
        let stored = self.params.set_all(params);
        self.apply_current();
        stored
    }

    /// Copy the current snapshot, let `f` change it, and apply the result.
    pub fn update_parameters(&mut self, f: impl FnOnce(&mut EffectParameters)) -> EffectParameters {
        let stored = self.params.update(f);
        self.apply_current();
        stored
    }

    /// Resolve `id` for `role`, refreshing the directory if it isn't known.
    ///
    /// A device that is still missing is replaced by the role's first
    /// available device; with none available the call fails with
    /// [`DeviceUnavailable`](Error::DeviceUnavailable). The selection is left
    /// untouched; callers commit the result once it is in use.
    fn resolve(&mut self, role: SelectionRole, id: DeviceId) -> Result<DeviceId> {
        if self.directory.contains(role.device_role(), &id) {
            return Ok(id);
        }
        self.refresh_devices()?;
        if self.directory.contains(role.device_role(), &id) {
            return Ok(id);
        }

        match self.directory.replacement(role) {
            Some(replacement) => {
                warn!(?role, %id, %replacement, "device unavailable, using the first available");
                Ok(replacement.clone())
            }
            None => Err(Error::DeviceUnavailable(id)),
        }
    }

    fn begin_reconfigure(&mut self) -> bool {
        if self.state == EngineState::Live {
            self.state = EngineState::Reconfiguring;
            true
        } else {
            false
        }
    }

    fn end_reconfigure(&mut self) {
        self.state = EngineState::Live;
    }

    /// Switch the microphone. Returns the device actually selected.
    ///
    /// While running, the current capture is stopped before the new one is
    /// requested, so two captures are never open at once. If the new request
    /// fails the input stays silent until the next successful selection.
    pub fn select_input(&mut self, id: DeviceId) -> Result<DeviceId> {
        let id = self.resolve(SelectionRole::Input, id)?;
        self.directory.select(SelectionRole::Input, id.clone());
        self.persist_selection(SelectionRole::Input)?;

        if !self.begin_reconfigure() {
            return Ok(id);
        }
        let result = self.swap_capture(&id);
        self.end_reconfigure();
        result.map(|()| id)
    }

    fn swap_capture(&mut self, id: &DeviceId) -> Result<()> {
        let constraints = self.capture_constraints();
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if let Some(previous) = active.capture.take() {
            active.signal.release_capture();
            drop(previous);
            debug!("previous capture stopped");
        }

        let capture = self.host.request_capture(Some(id), &constraints)?;
        let (reader, handle) = capture_reader(&self.config, capture, active.signal.sample_rate());
        active.signal.attach_capture(reader)?;
        active.capture = Some(handle);
        info!(device = %id, "input switched");
        Ok(())
    }

    /// Route the main output to `id`. Returns the device actually selected.
    pub fn select_main_output(&mut self, id: DeviceId) -> Result<DeviceId> {
        self.select_output(OutputRole::Main, id)
    }

    /// Route the monitor output to `id`. Returns the device actually selected.
    pub fn select_monitor_output(&mut self, id: DeviceId) -> Result<DeviceId> {
        self.select_output(OutputRole::Monitor, id)
    }

    /// The selection is recorded and persisted only once routing succeeds; on
    /// [`RoutingUnsupported`](Error::RoutingUnsupported) the previous route,
    /// selection and stored setting stay in place.
    fn select_output(&mut self, role: OutputRole, id: DeviceId) -> Result<DeviceId> {
        let selection = SelectionRole::Output(role);
        let id = self.resolve(selection, id)?;

        if self.begin_reconfigure() {
            let routed = match self.active.as_mut() {
                Some(active) => active
                    .router
                    .set_output(&self.host, &mut active.signal, role, Some(&id))
                    .map(|_| ()),
                None => Ok(()),
            };
            self.end_reconfigure();
            routed?;
        }

        self.directory.select(selection, id.clone());
        self.persist_selection(selection)?;
        Ok(id)
    }

    /// Play the diagnostic tone into the master stage.
    pub fn play_test_tone(&mut self) -> Result<()> {
        if self.state != EngineState::Live {
            return Err(self.invalid("play_test_tone"));
        }
        let settings = self.config.test_tone;
        if let Some(active) = self.active.as_mut() {
            active.signal.play_tone(settings);
        }
        Ok(())
    }

    /// Current input and output levels; zero while stopped.
    pub fn sample_levels(&mut self) -> Levels {
        match self.active.as_mut() {
            Some(active) => active.signal.meter_mut().levels(),
            None => Levels::default(),
        }
    }

    /// Fill `out` with the output spectrum, one byte per bin; zeros while stopped.
    pub fn sample_spectrum(&mut self, out: &mut [u8]) {
        match self.active.as_mut() {
            Some(active) => active.signal.meter_mut().spectrum(out),
            None => out.iter_mut().for_each(|b| *b = 0),
        }
    }

    /// Bins a full spectrum read produces.
    pub fn frequency_bin_count(&self) -> usize {
        self.config.analyser.fft_size.max(32).next_power_of_two() / 2
    }
}

fn capture_reader(config: &EngineConfig, capture: CaptureStream, graph_rate: u32) -> (ResamplingReader, StreamHandle) {
    let backlog = (config.capture_max_backlog_secs * capture.sample_rate as f32) as usize;
    let reader = ResamplingReader::new(capture.consumer, capture.channels, capture.sample_rate, graph_rate)
        .with_max_backlog(backlog);
    (reader, capture.handle)
}

impl<H: AudioHost, S: SettingsStore> Drop for Engine<H, S> {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(err) = self.stop() {
                warn!(%err, "engine teardown");
            }
        }
    }
}
