//! micdeck - real-time microphone effects console engine
//!
//! Captures a microphone, runs it through a fixed chain (input trim, plate
//! reverb, feedback delay, master gain and mute), meters it, and sends the
//! result to a main output device plus an optional local monitor device.
//!
//! Design principles:
//! - The graph is built once, fully wired and silent; parameters only glide
//!   control values, never rewire
//! - Nodes receive parameters via message ring buffers, not shared state
//! - Every output role tries the direct low-latency mechanism first and falls
//!   back to a buffered stream element
//! - The monitor runs in its own context, fed only by a read-only stream tap
//! - Platforms sit behind [`host::AudioHost`]; tests use [`host::VirtualHost`]
//!
//! ```
//! use micdeck::host::VirtualHost;
//! use micdeck::settings::MemorySettings;
//! use micdeck::{AudioDevice, DeviceRole, Engine, EngineConfig, EngineState};
//!
//! let host = VirtualHost::new()
//!     .with_device(AudioDevice::new("mic", "USB Mic", DeviceRole::Input))
//!     .with_device(AudioDevice::new("cable", "Virtual Cable", DeviceRole::Output));
//! let mut engine = Engine::new(host, MemorySettings::new(), EngineConfig::default());
//!
//! engine.start().unwrap();
//! assert_eq!(engine.state(), EngineState::Live);
//! engine.update_parameters(|p| p.reverb_mix = 0.3);
//! engine.process();
//! let levels = engine.sample_levels();
//! assert!(levels.output <= 1.0);
//! ```

extern crate alloc;

mod config;
mod device;
mod engine;
mod error;
mod graph;
pub mod host;
mod impulse;
mod meter;
mod node;
pub mod nodes;
mod params;
pub mod resample;
pub mod router;
pub mod settings;
mod signal;
mod smoothing;

pub use config::{AnalyserConfig, EngineConfig, ReverbConfig};
pub use device::{AudioDevice, DeviceDirectory, DeviceId, DeviceRole, OutputRole, RoutingSelection, SelectionRole};
pub use engine::{Engine, EngineState};
pub use error::{Error, Result};
pub use graph::{AudioGraph, Handle, MESSAGE_QUEUE_SIZE};
pub use impulse::ImpulseResponse;
pub use meter::{Levels, Meter};
pub use node::{AudioNode, NodeId, ProcessContext, BLOCK_SIZE};
pub use params::{EffectParameters, ParameterStore, GAIN_RANGE, REVERB_DECAY_RANGE};
pub use signal::{ControlTargets, SignalGraph};
pub use smoothing::{Smoother, SmoothingPolicy};
