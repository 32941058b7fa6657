//! cpal-backed host for real hardware

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, SupportedStreamConfig};
use itertools::Itertools;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use super::{AudioHost, CaptureConstraints, CaptureStream, OutputStream, SinkCapability, StreamHandle};
use crate::device::{AudioDevice, DeviceId, DeviceRole};
use crate::error::{Error, Result};

/// Seconds of audio a capture ring holds.
const CAPTURE_BUFFER_SECS: f32 = 0.5;
/// Seconds of audio a direct output ring holds; kept short for latency.
const DIRECT_BUFFER_SECS: f32 = 0.04;
/// Seconds of audio a stream output ring holds.
const STREAM_BUFFER_SECS: f32 = 0.2;
/// How long opening an output stream may take.
const OUTPUT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Host talking to the platform's default cpal backend.
///
/// cpal streams aren't `Send` on every platform, so each one lives on a
/// dedicated thread that builds it, starts it and parks until the owning
/// [`StreamHandle`] is dropped.
///
/// Device ids are device names; repeated names get a ` #2`, ` #3` suffix in
/// enumeration order.
pub struct CpalHost {
    host: cpal::Host,
}

impl CpalHost {
    pub fn new() -> Self {
        let host = cpal::default_host();
        info!(host = host.id().name(), "cpal host initialized");
        Self { host }
    }

    fn devices(&self, role: DeviceRole) -> Vec<(DeviceId, String, cpal::Device)> {
        let devices = match role {
            DeviceRole::Input => self.host.input_devices().map(|d| d.collect::<Vec<_>>()),
            DeviceRole::Output => self.host.output_devices().map(|d| d.collect::<Vec<_>>()),
        };
        let devices = match devices {
            Ok(d) => d,
            Err(err) => {
                warn!(?role, %err, "device enumeration failed");
                return Vec::new();
            }
        };

        let named: Vec<_> = devices
            .into_iter()
            .map(|d| (d.name().unwrap_or_default(), d))
            .collect();
        let counts = named.iter().map(|(name, _)| name.clone()).counts();
        let mut seen = hashbrown::HashMap::<String, usize>::new();

        named
            .into_iter()
            .map(|(name, device)| {
                let n = seen.entry(name.clone()).or_insert(0);
                *n += 1;
                let id = if counts[&name] > 1 && *n > 1 {
                    format!("{name} #{n}")
                } else {
                    name.clone()
                };
                (DeviceId::new(id), name, device)
            })
            .collect()
    }

    fn find(&self, role: DeviceRole, id: Option<&DeviceId>) -> Result<cpal::Device> {
        match id {
            Some(id) => self
                .devices(role)
                .into_iter()
                .find(|(candidate, _, _)| candidate == id)
                .map(|(_, _, d)| d)
                .ok_or_else(|| Error::DeviceUnavailable(id.clone())),
            None => match role {
                DeviceRole::Input => self.host.default_input_device(),
                DeviceRole::Output => self.host.default_output_device(),
            }
            .ok_or_else(|| Error::Stream(format!("no default {role:?} device"))),
        }
    }

    fn output_config_at(device: &cpal::Device, sample_rate: u32) -> Option<SupportedStreamConfig> {
        let rate = cpal::SampleRate(sample_rate);
        device
            .supported_output_configs()
            .ok()?
            .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .sorted_by_key(|range| {
                (
                    range.sample_format() != SampleFormat::F32,
                    range.channels() != 2,
                    range.channels(),
                )
            })
            .next()
            .map(|range| range.with_sample_rate(rate))
    }

    fn open_output(&self, device: cpal::Device, config: SupportedStreamConfig, buffer_secs: f32) -> Result<OutputStream> {
        let channels = config.channels() as usize;
        let sample_rate = config.sample_rate().0;
        let capacity = ((sample_rate as f32 * buffer_secs) as usize * channels).next_power_of_two();
        let (producer, consumer) = RingBuffer::new(capacity.max(1024));

        let thread = StreamThread::spawn("micdeck-output", OUTPUT_OPEN_TIMEOUT, move || {
            build_output(&device, &config, consumer)
        })?;

        info!(channels, sample_rate, "output stream started");
        Ok(OutputStream {
            producer,
            channels,
            sample_rate,
            handle: StreamHandle::new(thread),
        })
    }
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for CpalHost {
    fn name(&self) -> &str {
        "cpal"
    }

    fn enumerate_devices(&self) -> Result<Vec<AudioDevice>> {
        let mut all = Vec::new();
        for role in [DeviceRole::Input, DeviceRole::Output] {
            all.extend(
                self.devices(role)
                    .into_iter()
                    .map(|(id, label, _)| AudioDevice { id, label, role }),
            );
        }
        Ok(all)
    }

    fn create_context(&self, preferred_rate: Option<u32>) -> Result<u32> {
        if let Some(rate) = preferred_rate {
            return Ok(rate);
        }
        let output_rate = self
            .host
            .default_output_device()
            .and_then(|d| d.default_output_config().ok())
            .map(|c| c.sample_rate().0);
        let input_rate = || {
            self.host
                .default_input_device()
                .and_then(|d| d.default_input_config().ok())
                .map(|c| c.sample_rate().0)
        };
        output_rate
            .or_else(input_rate)
            .ok_or_else(|| Error::GraphConstructionFailed("no audio device to derive a context rate from".into()))
    }

    fn request_capture(&self, device: Option<&DeviceId>, constraints: &CaptureConstraints) -> Result<CaptureStream> {
        // Hardware captures carry no voice processing; only the timeout applies.
        debug!(?constraints, "capture requested");
        let device = self
            .find(DeviceRole::Input, device)
            .map_err(|e| Error::PermissionDenied(e.to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| Error::PermissionDenied(e.to_string()))?;

        let channels = config.channels() as usize;
        let sample_rate = config.sample_rate().0;
        let capacity = ((sample_rate as f32 * CAPTURE_BUFFER_SECS) as usize * channels).next_power_of_two();
        let (producer, consumer) = RingBuffer::new(capacity);

        let thread = StreamThread::spawn("micdeck-capture", constraints.permission_timeout, move || {
            build_input(&device, &config, producer)
        })
        .map_err(|e| match e {
            Error::Stream(reason) => Error::PermissionDenied(reason),
            other => other,
        })?;

        info!(channels, sample_rate, "capture stream started");
        Ok(CaptureStream {
            consumer,
            channels,
            sample_rate,
            handle: StreamHandle::new(thread),
        })
    }

    fn direct_capability(&self, device: Option<&DeviceId>, sample_rate: u32) -> SinkCapability {
        match self.find(DeviceRole::Output, device) {
            Ok(d) if Self::output_config_at(&d, sample_rate).is_some() => SinkCapability::Supported,
            _ => SinkCapability::Unsupported,
        }
    }

    fn open_direct(&self, device: Option<&DeviceId>, sample_rate: u32) -> Result<OutputStream> {
        let device = self.find(DeviceRole::Output, device)?;
        let config = Self::output_config_at(&device, sample_rate)
            .ok_or_else(|| Error::Stream(format!("device cannot run at {sample_rate} Hz")))?;
        self.open_output(device, config, DIRECT_BUFFER_SECS)
    }

    fn stream_capability(&self, device: Option<&DeviceId>) -> SinkCapability {
        match self.find(DeviceRole::Output, device) {
            Ok(d) if d.default_output_config().is_ok() => SinkCapability::Supported,
            _ => SinkCapability::Unsupported,
        }
    }

    fn open_stream(&self, device: Option<&DeviceId>) -> Result<OutputStream> {
        let device = self.find(DeviceRole::Output, device)?;
        let config = device.default_output_config().map_err(|e| Error::Stream(e.to_string()))?;
        self.open_output(device, config, STREAM_BUFFER_SECS)
    }
}

/// Thread owning one cpal stream. Dropping it stops and joins the thread.
struct StreamThread {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, timeout: Duration, build: F) -> Result<Self>
    where
        F: FnOnce() -> core::result::Result<cpal::Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<core::result::Result<(), String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until the handle goes away
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| Error::Stream(e.to_string()))?;

        let mut guard = Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        };

        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(guard),
            Ok(Err(err)) => Err(Error::Stream(err)),
            Err(RecvTimeoutError::Timeout) => {
                // Still stuck in the platform call; let it finish on its own.
                guard.thread = None;
                Err(Error::Stream("stream did not start in time".into()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Stream("stream thread exited".into())),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_input(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    producer: Producer<f32>,
) -> core::result::Result<cpal::Stream, String> {
    let stream_config = config.config();
    let result = match config.sample_format() {
        SampleFormat::F32 => input_stream::<f32>(device, &stream_config, producer),
        SampleFormat::I16 => input_stream::<i16>(device, &stream_config, producer),
        SampleFormat::U16 => input_stream::<u16>(device, &stream_config, producer),
        other => return Err(format!("unsupported sample format: {other:?}")),
    };
    result.map_err(|e| e.to_string())
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: Producer<f32>,
) -> core::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                // Engine fell behind: drop the rest of this callback
                if producer.push(f32::from_sample_(sample)).is_err() {
                    break;
                }
            }
        },
        |err| warn!(%err, "capture stream error"),
        None,
    )
}

fn build_output(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    consumer: Consumer<f32>,
) -> core::result::Result<cpal::Stream, String> {
    let stream_config = config.config();
    let result = match config.sample_format() {
        SampleFormat::F32 => output_stream::<f32>(device, &stream_config, consumer),
        SampleFormat::I16 => output_stream::<i16>(device, &stream_config, consumer),
        SampleFormat::U16 => output_stream::<u16>(device, &stream_config, consumer),
        other => return Err(format!("unsupported sample format: {other:?}")),
    };
    result.map_err(|e| e.to_string())
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: Consumer<f32>,
) -> core::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for sample in data.iter_mut() {
                // Underrun plays silence
                let s = consumer.pop().unwrap_or(0.0);
                *sample = T::from_sample_(s.clamp(-1.0, 1.0));
            }
        },
        |err| warn!(%err, "output stream error"),
        None,
    )
}
