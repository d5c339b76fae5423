//! ALSA-backed codec for the Linux host board.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O: one thread
//! reads capture periods, one drains the playback queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::{AudioCodec, AudioSignals};
use crate::config::AudioSettings;

/// Captured periods held before the oldest are dropped.
const CAPTURE_BACKLOG: usize = 64;
/// Playback asks for more audio below this many queued buffers.
const PLAYBACK_LOW_WATER: usize = 2;
const PLAYBACK_POLL: Duration = Duration::from_millis(20);

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

fn open_pcm(device: &str, direction: Direction, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );
    Ok((pcm, params))
}

struct Shared {
    captured: Mutex<VecDeque<Vec<i16>>>,
    playback: Mutex<VecDeque<Vec<i16>>>,
    playback_cond: Condvar,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    volume: AtomicU8,
    running: AtomicBool,
}

pub struct AlsaAudioCodec {
    capture_params: AlsaParams,
    playback_params: AlsaParams,
    input_reference: bool,
    devices: Mutex<Option<(PCM, PCM)>>,
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AlsaAudioCodec {
    pub fn open(settings: &AudioSettings) -> Result<Self> {
        let (capture, capture_params) = open_pcm(
            &settings.capture_device,
            Direction::Capture,
            settings.input_sample_rate,
            settings.input_channels as u32,
        )?;
        let (playback, playback_params) = open_pcm(
            &settings.playback_device,
            Direction::Playback,
            settings.output_sample_rate,
            settings.output_channels as u32,
        )?;

        Ok(Self {
            capture_params,
            playback_params,
            input_reference: settings.input_reference,
            devices: Mutex::new(Some((capture, playback))),
            shared: Arc::new(Shared {
                captured: Mutex::new(VecDeque::new()),
                playback: Mutex::new(VecDeque::new()),
                playback_cond: Condvar::new(),
                input_enabled: AtomicBool::new(true),
                output_enabled: AtomicBool::new(true),
                volume: AtomicU8::new(settings.output_volume.min(100)),
                running: AtomicBool::new(true),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }
}

impl Drop for AlsaAudioCodec {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.playback_cond.notify_all();
        for h in self.threads.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            let _ = h.join();
        }
    }
}

impl AudioCodec for AlsaAudioCodec {
    fn input_sample_rate(&self) -> u32 {
        self.capture_params.sample_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.playback_params.sample_rate
    }

    fn input_channels(&self) -> u16 {
        self.capture_params.channels as u16
    }

    fn output_channels(&self) -> u16 {
        self.playback_params.channels as u16
    }

    fn input_reference(&self) -> bool {
        self.input_reference
    }

    fn start(&self, signals: AudioSignals) -> Result<()> {
        let Some((capture, playback)) = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            anyhow::bail!("ALSA codec already started");
        };

        let record = {
            let shared = self.shared.clone();
            let signals = signals.clone();
            let params = self.capture_params.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(&capture, &params, &shared, &signals) {
                        log::error!("Recording thread error: {}", e);
                    }
                })?
        };
        let play = {
            let shared = self.shared.clone();
            let params = self.playback_params.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(&playback, &params, &shared, &signals) {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([record, play]);
        Ok(())
    }

    fn input_data(&self) -> Option<Vec<i16>> {
        self.shared
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn output_data(&self, pcm: Vec<i16>) {
        if !self.shared.output_enabled.load(Ordering::SeqCst) {
            return;
        }
        self.shared
            .playback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(pcm);
        self.shared.playback_cond.notify_all();
    }

    fn enable_input(&self, enable: bool) {
        self.shared.input_enabled.store(enable, Ordering::SeqCst);
        if !enable {
            self.shared
                .captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    fn enable_output(&self, enable: bool) {
        self.shared.output_enabled.store(enable, Ordering::SeqCst);
        if !enable {
            self.shared
                .playback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    fn output_enabled(&self) -> bool {
        self.shared.output_enabled.load(Ordering::SeqCst)
    }

    fn set_output_volume(&self, volume: u8) {
        self.shared.volume.store(volume.min(100), Ordering::SeqCst);
    }
}

// ======================== Recording thread ========================

fn record_thread(pcm: &PCM, params: &AlsaParams, shared: &Shared, signals: &AudioSignals) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;
    let mut read_buf = vec![0i16; params.period_size * channels];

    while shared.running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                if !shared.input_enabled.load(Ordering::Relaxed) {
                    continue;
                }
                {
                    let mut captured = shared.captured.lock().unwrap_or_else(PoisonError::into_inner);
                    if captured.len() >= CAPTURE_BACKLOG {
                        captured.pop_front();
                    }
                    captured.push_back(read_buf[..frames * channels].to_vec());
                }
                signals.input_ready();
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare().context("Failed to recover PCM capture")?;
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

// ======================== Playback thread ========================

fn play_thread(pcm: &PCM, params: &AlsaParams, shared: &Shared, signals: &AudioSignals) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;

    while shared.running.load(Ordering::Relaxed) {
        let next = {
            let queue = shared.playback.lock().unwrap_or_else(PoisonError::into_inner);
            let (mut queue, _) = shared
                .playback_cond
                .wait_timeout_while(queue, PLAYBACK_POLL, |q| {
                    q.is_empty() && shared.running.load(Ordering::Relaxed)
                })
                .unwrap_or_else(PoisonError::into_inner);
            let next = queue.pop_front();
            if queue.len() < PLAYBACK_LOW_WATER {
                signals.output_ready();
            }
            next
        };

        let Some(mut pcm_data) = next else {
            continue;
        };

        let volume = shared.volume.load(Ordering::Relaxed) as i32;
        if volume < 100 {
            for s in pcm_data.iter_mut() {
                *s = (*s as i32 * volume / 100) as i16;
            }
        }

        // Write with retry to handle short writes and XRUN recovery
        let total_frames = pcm_data.len() / channels;
        let mut frames_written = 0;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&pcm_data[offset..]) {
                Ok(n) => frames_written += n,
                Err(e) => {
                    log::warn!("ALSA playback error: {}, recovering...", e);
                    pcm.prepare().context("Failed to recover PCM playback")?;
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
