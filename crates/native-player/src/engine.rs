//! Decode engine boundary and its Symphonia binding.
//!
//! A [`DecodeEngine`] probes a byte source, hands out compressed units one at a time and
//! turns them into [`NativeFrame`]s. Only the decoding adapter talks to it.

use std::io;
use std::time::Duration;

use symphonia::core::audio::{AudioBufferRef, SampleBuffer, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{PlayerError, Result};
use crate::pcm::{NativeFrame, SampleFormat, SampleLayout};

/// Rational unit in which a stream expresses timestamps (`numer / denom` seconds per tick).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub numer: u32,
    pub denom: u32,
}

impl TimeBase {
    /// Timestamp (in ticks) for a wall-clock position, rounded down.
    pub fn ts_for(&self, position: Duration) -> u64 {
        if self.numer == 0 {
            return 0;
        }
        let ticks = position.as_nanos() * u128::from(self.denom)
            / (u128::from(self.numer) * 1_000_000_000);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Wall-clock length of `ts` ticks.
    pub fn duration_of(&self, ts: u64) -> Duration {
        if self.denom == 0 {
            return Duration::ZERO;
        }
        let nanos =
            u128::from(ts) * u128::from(self.numer) * 1_000_000_000 / u128::from(self.denom);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Stream parameters learned while probing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub time_base: TimeBase,
    /// Total frames when the container declares them.
    pub n_frames: Option<u64>,
    /// Best-effort codec label.
    pub codec: Option<String>,
}

impl StreamInfo {
    /// Container-level duration, or zero when unknown.
    pub fn duration(&self) -> Duration {
        self.n_frames
            .map(|frames| self.time_base.duration_of(frames))
            .unwrap_or(Duration::ZERO)
    }
}

/// Result of feeding one unit (or an empty flush input) to the codec.
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(NativeFrame),
    /// The codec consumed input without producing output.
    NeedMoreInput,
    /// A flush produced nothing more.
    EndOfStream,
}

/// Capability contract of a native decode engine.
pub trait DecodeEngine: Send {
    /// Compressed data unit (packet).
    type Unit;

    fn info(&self) -> &StreamInfo;

    /// Next compressed unit of the selected stream; `None` at end of data.
    fn read_unit(&mut self) -> Result<Option<Self::Unit>>;

    /// Decode `unit`, or with `None` drain whatever the codec still buffers.
    fn decode(&mut self, unit: Option<&Self::Unit>) -> Result<DecodeOutcome>;

    /// Backward-biased seek to timestamp `ts` (stream time base).
    fn seek(&mut self, ts: u64) -> Result<()>;

    /// Drop codec state left over from before a seek.
    fn flush(&mut self);
}

/// Symphonia-backed decode engine.
pub struct SymphoniaEngine {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    info: StreamInfo,
    /// Frames before this timestamp are decoded but not emitted (post-seek trim).
    skip_until: Option<u64>,
}

impl SymphoniaEngine {
    /// Probe `source` and open a codec for its first audio track.
    ///
    /// Fails with [`PlayerError::NoDecoder`] when the container is unrecognized, there is no
    /// audio track, or no codec is available.
    pub fn open(source: Box<dyn MediaSource>, hint: &Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::IoError(io) => PlayerError::from_io(io),
                other => PlayerError::NoDecoder(format!("probe: {other}")),
            })?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlayerError::NoDecoder("no audio stream".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| PlayerError::NoDecoder(format!("codec: {e}")))?;
        let info = stream_info(&params)?;
        tracing::debug!(
            codec = info.codec.as_deref().unwrap_or("unknown"),
            rate_hz = info.sample_rate,
            channels = info.channels,
            frames = ?info.n_frames,
            "decode engine opened"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            info,
            skip_until: None,
        })
    }
}

impl DecodeEngine for SymphoniaEngine {
    type Unit = Packet;

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_unit(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() != self.track_id => continue,
                Ok(packet) => return Ok(Some(packet)),
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                // Chained streams change the track list; treat as end of this track.
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(SymphoniaError::IoError(e)) => return Err(PlayerError::from_io(e)),
                Err(e) => return Err(PlayerError::Decode(format!("demux: {e}"))),
            }
        }
    }

    fn decode(&mut self, unit: Option<&Packet>) -> Result<DecodeOutcome> {
        let Some(packet) = unit else {
            // Symphonia codecs keep no delayed frames.
            return Ok(DecodeOutcome::EndOfStream);
        };

        let skip_frames = match self.skip_until {
            Some(target) if packet.ts().saturating_add(packet.dur()) <= target => {
                // Decode to keep codec state warm, emit nothing.
                if let Err(e) = self.decoder.decode(packet).map(|_| ()) {
                    absorb_decode_error(self.decoder.as_mut(), packet.ts(), e)?;
                }
                return Ok(DecodeOutcome::NeedMoreInput);
            }
            Some(target) => {
                self.skip_until = None;
                target.saturating_sub(packet.ts()) as usize
            }
            None => 0,
        };

        let err = match self.decoder.decode(packet) {
            Ok(buf) => return Ok(DecodeOutcome::Frame(native_frame(buf, skip_frames))),
            Err(e) => e,
        };
        absorb_decode_error(self.decoder.as_mut(), packet.ts(), err)?;
        Ok(DecodeOutcome::NeedMoreInput)
    }

    fn seek(&mut self, ts: u64) -> Result<()> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| PlayerError::Seek(e.to_string()))?;
        tracing::debug!(
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            "engine seek"
        );
        self.skip_until = (seeked.actual_ts < seeked.required_ts).then_some(seeked.required_ts);
        Ok(())
    }

    fn flush(&mut self) {
        self.decoder.reset();
    }
}

/// `Ok` when decoding can go on with the next packet: corrupt packets are skipped and a
/// codec asking for a reset gets one.
fn absorb_decode_error(
    decoder: &mut dyn symphonia::core::codecs::Decoder,
    ts: u64,
    err: SymphoniaError,
) -> Result<()> {
    match err {
        SymphoniaError::DecodeError(msg) => {
            tracing::warn!(ts, "skipping undecodable packet: {msg}");
            Ok(())
        }
        SymphoniaError::ResetRequired => {
            decoder.reset();
            Ok(())
        }
        SymphoniaError::IoError(e) => Err(PlayerError::from_io(e)),
        e => Err(PlayerError::Decode(e.to_string())),
    }
}

fn stream_info(params: &CodecParameters) -> Result<StreamInfo> {
    let sample_rate = params
        .sample_rate
        .filter(|rate| *rate > 0)
        .ok_or_else(|| PlayerError::NoDecoder("unknown sample rate".to_string()))?;
    let channels = params
        .channels
        .map(|c| c.count() as u16)
        .filter(|c| *c > 0)
        .ok_or_else(|| PlayerError::NoDecoder("unknown channel layout".to_string()))?;
    let time_base = params
        .time_base
        .map(|tb| TimeBase {
            numer: tb.numer,
            denom: tb.denom,
        })
        .unwrap_or(TimeBase {
            numer: 1,
            denom: sample_rate,
        });
    Ok(StreamInfo {
        sample_rate,
        channels,
        time_base,
        n_frames: params.n_frames,
        codec: codec_name(params),
    })
}

/// Copy a decoded Symphonia buffer into a native frame, dropping `skip` leading frames.
///
/// 16-bit and 32-bit float buffers keep their planar layout; anything else is converted to
/// interleaved `f32` by Symphonia.
fn native_frame(buf: AudioBufferRef<'_>, skip: usize) -> NativeFrame {
    let spec = *buf.spec();
    let channels = spec.channels.count();
    let frames = buf.frames();
    let skip = skip.min(frames);
    let samples = frames - skip;

    match buf {
        AudioBufferRef::S16(planes) => {
            let mut data = Vec::with_capacity(channels * samples * 2);
            for ch in 0..channels {
                for v in &planes.chan(ch)[skip..] {
                    data.extend_from_slice(&v.to_le_bytes());
                }
            }
            NativeFrame {
                format: SampleFormat::S16,
                layout: SampleLayout::Planar,
                channels,
                samples,
                data,
            }
        }
        AudioBufferRef::F32(planes) => {
            let mut data = Vec::with_capacity(channels * samples * 4);
            for ch in 0..channels {
                for v in &planes.chan(ch)[skip..] {
                    data.extend_from_slice(&v.to_le_bytes());
                }
            }
            NativeFrame {
                format: SampleFormat::F32,
                layout: SampleLayout::Planar,
                channels,
                samples,
                data,
            }
        }
        other => {
            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
            sample_buf.copy_interleaved_ref(other);
            let data = sample_buf.samples()[skip * channels..]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            NativeFrame {
                format: SampleFormat::F32,
                layout: SampleLayout::Interleaved,
                channels,
                samples,
                data,
            }
        }
    }
}

/// Best-effort codec label for logs.
fn codec_name(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
