//! Source decoding into cacheable PCM.
//!
//! Uses Symphonia to:
//! - probe the input container/codec
//! - decode packets into interleaved signed little-endian integers
//! - write them to the caller's sink (the cache's `.part` file)
//!
//! Decoding is blocking; the cache runs it on the blocking pool.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use relay_proto::FormatId;
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Result of a completed decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAudio {
    pub format: FormatId,
    /// Interleaved frames written.
    pub frames: u64,
}

/// Turns a source locator into PCM.
pub trait Decoder: Send + Sync {
    /// Decode `source` and write interleaved PCM to `out`. Blocking.
    fn decode(&self, source: &str, out: &mut dyn Write) -> Result<DecodedAudio>;

    /// Best-effort duration in seconds, without decoding. Blocking.
    fn probe_duration(&self, source: &str) -> Result<Option<f64>>;
}

/// In-process Symphonia decoder for local files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl Decoder for SymphoniaDecoder {
    fn decode(&self, source: &str, out: &mut dyn Write) -> Result<DecodedAudio> {
        let path = source_path(source)?;
        let (mut format, codec_params) = open(&path)?;

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;
        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count() as u32;
        let bits = output_bits(codec_params.bits_per_sample);
        let track_id = format
            .default_track()
            .map(|t| t.id)
            .ok_or_else(|| anyhow!("No default audio track"))?;

        let mut decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        let mut frames = 0u64;
        let mut bytes = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(e).with_context(|| format!("read packet from {source}")),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(reason)) => {
                    tracing::debug!(source, reason, "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("decode {source}")),
            };

            frames += decoded.frames() as u64;
            bytes.clear();
            encode_interleaved(decoded, bits, &mut bytes);
            out.write_all(&bytes)?;
        }
        out.flush()?;

        Ok(DecodedAudio {
            format: FormatId::pcm(sample_rate, bits, channels),
            frames,
        })
    }

    fn probe_duration(&self, source: &str) -> Result<Option<f64>> {
        let path = source_path(source)?;
        let (_, codec_params) = open(&path)?;
        Ok(duration_secs_from_codec_params(&codec_params))
    }
}

/// Resolve a local path or `file://` URL.
pub fn source_path(source: &str) -> Result<PathBuf> {
    if let Some(rest) = source.strip_prefix("file://") {
        let decoded =
            urlencoding::decode(rest).with_context(|| format!("decode file url {source}"))?;
        return Ok(PathBuf::from(decoded.into_owned()));
    }
    if source.contains("://") {
        bail!("unsupported source {source}");
    }
    Ok(PathBuf::from(source))
}

/// True when `source` names something [`SymphoniaDecoder`] can open.
pub fn is_local_source(source: &str) -> bool {
    source_path(source).is_ok_and(|p| p.is_file())
}

fn open(path: &Path) -> Result<(Box<dyn FormatReader>, CodecParameters)> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probe {:?}", path))?;

    let format = probed.format;
    let codec_params = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?
        .codec_params
        .clone();
    Ok((format, codec_params))
}

/// Output width for a source bit depth. Unknown depth (lossy codecs) gets 24.
fn output_bits(source_bits: Option<u32>) -> u32 {
    match source_bits {
        Some(b) if b <= 16 => 16,
        Some(b) if b <= 24 => 24,
        Some(_) => 32,
        None => 24,
    }
}

fn encode_interleaved(decoded: AudioBufferRef<'_>, bits: u32, out: &mut Vec<u8>) {
    let spec = *decoded.spec();
    let duration = decoded.capacity() as u64;
    if bits == 16 {
        let mut buf = SampleBuffer::<i16>::new(duration, spec);
        buf.copy_interleaved_ref(decoded);
        for s in buf.samples() {
            out.extend_from_slice(&s.to_le_bytes());
        }
        return;
    }

    let mut buf = SampleBuffer::<i32>::new(duration, spec);
    buf.copy_interleaved_ref(decoded);
    for s in buf.samples() {
        let le = s.to_le_bytes();
        if bits == 24 {
            // Top three bytes of the full-scale i32.
            out.extend_from_slice(&le[1..4]);
        } else {
            out.extend_from_slice(&le);
        }
    }
}

/// Best-effort duration from codec metadata.
fn duration_secs_from_codec_params(codec_params: &CodecParameters) -> Option<f64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / f64::from(rate))
}
