//! Microphone capture pipeline.
//!
//! A dedicated thread owns the cpal input stream (cpal streams are not
//! `Send`), accumulates device callbacks into fixed-size blocks, and emits
//! one [`AudioFrame`] per block with a mean-absolute loudness attached.
//! Capture never gates on session state; frames always flow so the UI
//! loudness signal stays live. Gating on agent speech happens in the
//! orchestrator.

use crate::audio::{BLOCK_SIZE, INPUT_SAMPLE_RATE};
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::thread;

/// Capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per emitted frame.
    pub block_size: usize,
    /// Mean-absolute amplitude above which a frame counts as speech.
    /// Advisory only; turn detection is the remote service's job.
    pub vad_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { sample_rate: INPUT_SAMPLE_RATE, block_size: BLOCK_SIZE, vad_threshold: 0.005 }
    }
}

/// One block of mono float samples with its loudness signal.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw samples in [-1, 1].
    pub samples: Vec<f32>,
    /// Mean absolute amplitude over the block.
    pub loudness: f32,
}

impl AudioFrame {
    /// Build a frame, computing the loudness signal from the samples.
    pub fn from_samples(samples: Vec<f32>) -> Self {
        let loudness = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
        };
        Self { samples, loudness }
    }

    /// Whether this frame clears the advisory speech threshold.
    pub fn is_speech(&self, threshold: f32) -> bool {
        self.loudness > threshold
    }
}

/// Callback invoked once per captured frame, on the capture thread.
pub type FrameCallback = Box<dyn Fn(AudioFrame) + Send + Sync + 'static>;

/// A running capture stream. Dropping it stops capture.
pub trait CaptureStream: Send {
    /// Release the microphone. Idempotent.
    fn stop(&mut self);
}

/// Source of microphone frames. Implemented by [`CpalMic`] for real
/// hardware and by fakes in tests.
pub trait MicSource: Send + Sync {
    /// Request microphone access and begin emitting frames until the
    /// returned stream is stopped.
    fn start(&self, config: &CaptureConfig, on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>>;
}

/// Microphone source backed by the default cpal input device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalMic;

struct CaptureHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureStream for CaptureHandle {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MicSource for CpalMic {
    fn start(&self, config: &CaptureConfig, on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let config = config.clone();
        let thread_config = config.clone();

        let thread = thread::Builder::new()
            .name("voiceline-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(&thread_config, on_frame) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(VoiceError::permission(err.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until stop() or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::device(format!("capture thread spawn failed: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(
                    sample_rate = config.sample_rate,
                    block_size = config.block_size,
                    "audio capture started"
                );
                Ok(Box::new(CaptureHandle { stop_tx: Some(stop_tx), thread: Some(thread) }))
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::device("capture thread exited before reporting readiness"))
            }
        }
    }
}

fn build_input_stream(config: &CaptureConfig, on_frame: FrameCallback) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::device("no input device available"))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| VoiceError::permission(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(config.sample_rate)
                && c.max_sample_rate() >= SampleRate(config.sample_rate)
        })
        .ok_or_else(|| VoiceError::device("no suitable input config found"))?;

    let stream_config = supported.with_sample_rate(SampleRate(config.sample_rate)).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate,
        "audio capture initialized"
    );

    let block_size = config.block_size;
    let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);

    device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                pending.extend_from_slice(data);
                while pending.len() >= block_size {
                    let samples: Vec<f32> = pending.drain(..block_size).collect();
                    on_frame(AudioFrame::from_samples(samples));
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| VoiceError::permission(e.to_string()))
}
