//! Device descriptors and the directory tracking per-role selections.

use core::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Opaque platform identifier of an audio endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Direction of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Input,
    Output,
}

/// The two independently routed outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRole {
    /// Broadcast-facing output.
    Main,
    /// Optional local listening copy.
    Monitor,
}

impl OutputRole {
    pub const ALL: [OutputRole; 2] = [OutputRole::Main, OutputRole::Monitor];
}

impl fmt::Display for OutputRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputRole::Main => "main",
            OutputRole::Monitor => "monitor",
        })
    }
}

/// One of the three user selections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectionRole {
    Input,
    Output(OutputRole),
}

impl SelectionRole {
    pub const ALL: [SelectionRole; 3] = [
        SelectionRole::Input,
        SelectionRole::Output(OutputRole::Main),
        SelectionRole::Output(OutputRole::Monitor),
    ];

    /// Which device list this selection draws from.
    pub fn device_role(self) -> DeviceRole {
        match self {
            SelectionRole::Input => DeviceRole::Input,
            SelectionRole::Output(_) => DeviceRole::Output,
        }
    }
}

/// An enumerated endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: DeviceId,
    /// Display label; may be empty before capture permission was granted.
    pub label: String,
    pub role: DeviceRole,
}

impl AudioDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            id: DeviceId::new(id),
            label: label.into(),
            role,
        }
    }
}

/// The user's device choice per role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSelection {
    pub input: Option<DeviceId>,
    pub main_output: Option<DeviceId>,
    pub monitor: Option<DeviceId>,
}

impl RoutingSelection {
    pub fn get(&self, role: SelectionRole) -> Option<&DeviceId> {
        self.slot(role).as_ref()
    }

    fn slot(&self, role: SelectionRole) -> &Option<DeviceId> {
        match role {
            SelectionRole::Input => &self.input,
            SelectionRole::Output(OutputRole::Main) => &self.main_output,
            SelectionRole::Output(OutputRole::Monitor) => &self.monitor,
        }
    }

    fn slot_mut(&mut self, role: SelectionRole) -> &mut Option<DeviceId> {
        match role {
            SelectionRole::Input => &mut self.input,
            SelectionRole::Output(OutputRole::Main) => &mut self.main_output,
            SelectionRole::Output(OutputRole::Monitor) => &mut self.monitor,
        }
    }
}

/// Available endpoints plus the current selection for each role.
///
/// Lists are snapshots replaced only by [`refresh`](Self::refresh). A
/// selection whose device vanished stays in place as *pending* until the
/// device returns or a new choice for the role is selected.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    inputs: Vec<AudioDevice>,
    outputs: Vec<AudioDevice>,
    selection: RoutingSelection,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory starting from a restored selection.
    pub fn with_selection(selection: RoutingSelection) -> Self {
        Self {
            selection,
            ..Self::default()
        }
    }

    /// Replace the device lists with a fresh enumeration.
    ///
    /// Labels are made unique and non-empty. Every role without a selection
    /// gets the first device of its list; roles whose list is empty stay unset.
    /// Returns the roles that were auto-selected.
    pub fn refresh(&mut self, devices: Vec<AudioDevice>) -> Vec<SelectionRole> {
        let (inputs, outputs): (Vec<_>, Vec<_>) = devices.into_iter().partition(|d| d.role == DeviceRole::Input);
        self.inputs = disambiguate(inputs, "Microphone");
        self.outputs = disambiguate(outputs, "Output");
        debug!(inputs = self.inputs.len(), outputs = self.outputs.len(), "device lists refreshed");

        let mut selected = Vec::new();
        for role in SelectionRole::ALL {
            if self.selection.get(role).is_some() {
                if self.is_pending(role) {
                    warn!(?role, device = ?self.selection.get(role), "selected device not present");
                }
                continue;
            }
            if let Some(first) = self.list(role.device_role()).first() {
                info!(?role, device = %first.id, "auto-selected device");
                *self.selection.slot_mut(role) = Some(first.id.clone());
                selected.push(role);
            }
        }
        selected
    }

    /// Enumerated inputs.
    pub fn inputs(&self) -> &[AudioDevice] {
        &self.inputs
    }

    /// Enumerated outputs (main and monitor share this list).
    pub fn outputs(&self) -> &[AudioDevice] {
        &self.outputs
    }

    fn list(&self, role: DeviceRole) -> &[AudioDevice] {
        match role {
            DeviceRole::Input => &self.inputs,
            DeviceRole::Output => &self.outputs,
        }
    }

    /// Current selections.
    pub fn selection(&self) -> &RoutingSelection {
        &self.selection
    }

    /// Look up an enumerated device.
    pub fn find(&self, role: DeviceRole, id: &DeviceId) -> Option<&AudioDevice> {
        self.list(role).iter().find(|d| &d.id == id)
    }

    /// Whether `id` is currently enumerated for `role`.
    pub fn contains(&self, role: DeviceRole, id: &DeviceId) -> bool {
        self.find(role, id).is_some()
    }

    /// Record a selection. The id is kept even if not currently enumerated.
    pub fn select(&mut self, role: SelectionRole, id: DeviceId) {
        *self.selection.slot_mut(role) = Some(id);
    }

    /// Whether `role` has a selection that isn't currently enumerated.
    pub fn is_pending(&self, role: SelectionRole) -> bool {
        match self.selection.get(role) {
            Some(id) => !self.contains(role.device_role(), id),
            None => false,
        }
    }

    /// The device a pending selection for `role` falls back to: the first of its list.
    ///
    /// Nothing is changed; the caller commits it with [`select`](Self::select)
    /// once the device is actually in use.
    pub fn replacement(&self, role: SelectionRole) -> Option<&DeviceId> {
        self.list(role.device_role()).first().map(|d| &d.id)
    }
}

fn disambiguate(devices: Vec<AudioDevice>, fallback: &str) -> Vec<AudioDevice> {
    let mut devices: Vec<_> = devices
        .into_iter()
        .enumerate()
        .map(|(i, mut d)| {
            if d.label.trim().is_empty() {
                d.label = format!("{fallback} {}", i + 1);
            }
            d
        })
        .collect();

    let counts = devices.iter().map(|d| d.label.clone()).counts();
    let mut seen = hashbrown::HashMap::<String, usize>::new();
    for d in devices.iter_mut().filter(|d| counts[&d.label] > 1) {
        let n = seen.entry(d.label.clone()).or_insert(0);
        *n += 1;
        if *n > 1 {
            d.label = format!("{} ({n})", d.label);
        }
    }
    devices
}
