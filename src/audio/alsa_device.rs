//! ALSA PCM setup for the microphone and the speaker.
//!
//! Both directions use interleaved S16LE at a fixed rate; a device that
//! cannot run at exactly the requested rate is rejected.

use std::fmt;

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result, bail};

/// Playback keeps this many periods queued in the device.
const PLAYBACK_PERIODS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Capture,
    Playback,
}

impl Stream {
    fn direction(self) -> Direction {
        match self {
            Stream::Capture => Direction::Capture,
            Stream::Playback => Direction::Playback,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Capture => "capture",
            Stream::Playback => "playback",
        })
    }
}

/// What the hardware actually agreed to.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per period
    pub period_size: usize,
}

struct PcmRequest<'a> {
    device: &'a str,
    stream: Stream,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
}

pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    PcmRequest {
        device,
        stream: Stream::Capture,
        sample_rate,
        channels,
        period_size: None,
    }
    .open()
}

/// Playback starts as soon as the first period is written so the output
/// clock tracks wall time from the beginning.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    PcmRequest {
        device,
        stream: Stream::Playback,
        sample_rate,
        channels,
        period_size,
    }
    .open()
}

impl PcmRequest<'_> {
    fn open(&self) -> Result<(PCM, AlsaParams)> {
        let pcm = PCM::new(self.device, self.stream.direction(), false).with_context(|| {
            format!("Failed to open {} device '{}'", self.stream, self.device)
        })?;

        self.configure_hw(&pcm)
            .with_context(|| format!("{} device '{}' rejected S16LE setup", self.stream, self.device))?;
        let params = self.negotiated(&pcm)?;
        if self.stream == Stream::Playback {
            start_on_first_period(&pcm, params.period_size)?;
        }

        log::info!(
            "ALSA {}: device={}, rate={}, channels={}, period_size={}",
            self.stream,
            self.device,
            params.sample_rate,
            params.channels,
            params.period_size,
        );
        Ok((pcm, params))
    }

    fn configure_hw(&self, pcm: &PCM) -> Result<()> {
        let hwp = HwParams::any(pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(self.channels)?;
        hwp.set_rate(self.sample_rate, ValueOr::Nearest)?;
        if let Some(frames) = self.period_size {
            hwp.set_period_size_near(frames as Frames, ValueOr::Nearest)?;
            hwp.set_buffer_size_near((frames * PLAYBACK_PERIODS) as Frames)?;
        }
        pcm.hw_params(&hwp)?;
        Ok(())
    }

    fn negotiated(&self, pcm: &PCM) -> Result<AlsaParams> {
        let hwp = pcm.hw_params_current()?;
        let params = AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        };
        // Nothing downstream resamples.
        if params.sample_rate != self.sample_rate {
            bail!(
                "{} device '{}' runs at {} Hz, {} Hz required",
                self.stream,
                self.device,
                params.sample_rate,
                self.sample_rate
            );
        }
        Ok(params)
    }
}

fn start_on_first_period(pcm: &PCM, period_size: usize) -> Result<()> {
    let swp = pcm.sw_params_current()?;
    swp.set_start_threshold(period_size.max(1) as Frames)?;
    pcm.sw_params(&swp)?;
    Ok(())
}
