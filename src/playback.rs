//! Playback scheduling for server audio.
//!
//! Server audio arrives in bursts; the scheduler serializes arrivals into
//! gapless, ordered output against a single cursor (the next playback
//! instant). A fixed 50 ms jitter margin absorbs arrival-time variance when
//! the queue drains. The cursor lives here, behind one critical section —
//! never module-global.

use crate::audio::{self, OUTPUT_SAMPLE_RATE};
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// Scheduling delay applied when the queue is empty or the cursor has
/// fallen behind the clock, to prevent crackling on late chunks.
pub const JITTER_MARGIN: Duration = Duration::from_millis(50);

/// Destination for decoded playback samples.
///
/// [`CpalSink`] feeds real hardware; tests substitute recording fakes.
pub trait OutputSink: Send + Sync {
    /// Hand samples to the device. Fails with [`VoiceError::Device`] when
    /// the device is unavailable; callers drop the chunk and continue.
    fn write(&self, samples: &[f32]) -> Result<()>;

    /// Discard everything handed to the device but not yet played.
    fn clear(&self);
}

/// Factory for output sinks, one per session.
pub trait OutputDevice: Send + Sync {
    /// Acquire the output device.
    fn open(&self) -> Result<Arc<dyn OutputSink>>;
}

/// A chunk accepted by the scheduler.
#[derive(Debug)]
pub struct PlaybackHandle {
    duration: Duration,
    finished: oneshot::Receiver<()>,
}

impl PlaybackHandle {
    /// Intrinsic duration of the scheduled chunk.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Resolves when the chunk finishes playing, or immediately if it was
    /// discarded by [`PlaybackScheduler::reset`] or a device failure.
    pub async fn finished(self) {
        let _ = self.finished.await;
    }
}

/// Serializes bursty chunk arrivals into ordered, gapless playback.
pub struct PlaybackScheduler {
    sink: Arc<dyn OutputSink>,
    cursor: Mutex<Option<Instant>>,
    epoch: Arc<AtomicU64>,
}

impl PlaybackScheduler {
    /// Create a scheduler over an open output sink.
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self { sink, cursor: Mutex::new(None), epoch: Arc::new(AtomicU64::new(0)) }
    }

    /// Clear the cursor and discard every scheduled or in-flight chunk.
    ///
    /// Chunks not yet handed to the device are cancelled via the epoch;
    /// samples already queued on the device are flushed via the sink.
    pub async fn reset(&self) {
        let mut cursor = self.cursor.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *cursor = None;
        self.sink.clear();
    }

    /// Schedule a raw PCM16 chunk for playback.
    ///
    /// Decodes the chunk, then atomically reads and advances the cursor:
    /// an unset or stale cursor snaps to `now + 50ms`, otherwise the chunk
    /// starts exactly where the previous one ends. Returns a handle whose
    /// `finished()` future resolves when the chunk ends.
    pub async fn enqueue(&self, pcm: &[u8]) -> Result<PlaybackHandle> {
        let samples = audio::f32_from_pcm16(pcm)?;
        let duration = audio::duration_of(samples.len(), OUTPUT_SAMPLE_RATE);

        let (start, scheduled_epoch) = {
            let mut cursor = self.cursor.lock().await;
            let now = Instant::now();
            let start = match *cursor {
                Some(at) if at > now => at,
                _ => now + JITTER_MARGIN,
            };
            *cursor = Some(start + duration);
            (start, self.epoch.load(Ordering::SeqCst))
        };

        let (done_tx, done_rx) = oneshot::channel();
        let sink = Arc::clone(&self.sink);
        let epoch = Arc::clone(&self.epoch);
        tokio::spawn(async move {
            tokio::time::sleep_until(start).await;
            if epoch.load(Ordering::SeqCst) != scheduled_epoch {
                return;
            }
            if let Err(err) = sink.write(&samples) {
                tracing::warn!(error = %err, "output device rejected chunk, dropping");
                return;
            }
            tokio::time::sleep(duration).await;
            if epoch.load(Ordering::SeqCst) == scheduled_epoch {
                let _ = done_tx.send(());
            }
        });

        Ok(PlaybackHandle { duration, finished: done_rx })
    }
}

/// Output sink backed by the default cpal output device.
///
/// A dedicated thread owns the cpal stream; the stream callback drains a
/// shared sample queue, emitting silence when it runs dry.
pub struct CpalSink {
    queue: Arc<parking_lot::Mutex<VecDeque<f32>>>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    /// Open the default output device at the playback rate.
    pub fn open() -> Result<Self> {
        let queue = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let stream_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name("voiceline-playback".into())
            .spawn(move || {
                let stream = match build_output_stream(stream_queue) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(VoiceError::device(err.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::device(format!("playback thread spawn failed: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(sample_rate = OUTPUT_SAMPLE_RATE, "audio playback initialized");
                Ok(Self { queue, stop_tx: Some(stop_tx), thread: Some(thread) })
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::device("playback thread exited before reporting readiness"))
            }
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            tracing::debug!("audio playback stopped");
        }
    }
}

impl OutputSink for CpalSink {
    fn write(&self, samples: &[f32]) -> Result<()> {
        if self.thread.is_none() {
            return Err(VoiceError::device("output device closed"));
        }
        self.queue.lock().extend(samples.iter().copied());
        Ok(())
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output device factory backed by the default cpal host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalOutput;

impl OutputDevice for CpalOutput {
    fn open(&self) -> Result<Arc<dyn OutputSink>> {
        Ok(Arc::new(CpalSink::open()?))
    }
}

fn build_output_stream(queue: Arc<parking_lot::Mutex<VecDeque<f32>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::device("no output device available"))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| VoiceError::device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: stereo, duplicating the mono signal.
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| VoiceError::device("no suitable output config found"))?;

    let config = supported.with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE)).config();
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        channels = config.channels,
        "audio playback device opened"
    );

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| VoiceError::device(e.to_string()))
}
