use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use rustfft::{num_complex::Complex, FftPlanner};
use tracing::{debug, info, warn};

/// Sample rate expected by the speech recogniser.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Windows shorter than this are not worth transcribing.
const MIN_WINDOW_MS: u64 = 1_000;

const RESAMPLE_CHUNK: usize = 4096;

/// Decodes an audio file into mono f32 samples at 16 kHz, normalised to [-1, 1].
///
/// Non-WAV input is converted with ffmpeg first; the intermediate file is
/// removed afterwards.
pub fn load_samples(path: &Path, ffmpeg_bin: &str, noise_reduction: bool) -> Result<Vec<f32>> {
    let wav_path = ensure_wav_format(path, ffmpeg_bin)?;
    let decoded = read_wav_file(&wav_path);

    if wav_path != path {
        match std::fs::remove_file(&wav_path) {
            Ok(_) => debug!("Removed temporary WAV file: {:?}", wav_path),
            Err(e) => warn!("Failed to remove temporary WAV file {:?}: {}", wav_path, e),
        }
    }

    let (samples, num_channels, sample_rate) = decoded?;
    let mono = convert_to_mono(&samples, num_channels);
    let normalized = normalize_audio(&mono);
    let cleaned = if noise_reduction {
        spectral_noise_reduction(&normalized, 2048, 0.75, 0.55)
    } else {
        normalized
    };

    if sample_rate == TARGET_SAMPLE_RATE {
        Ok(cleaned)
    } else {
        resample_audio(&cleaned, sample_rate)
    }
}

/// Converts `path` to 16 kHz mono 16-bit WAV with ffmpeg unless it already is a WAV file.
fn ensure_wav_format(path: &Path, ffmpeg_bin: &str) -> Result<PathBuf> {
    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if is_wav {
        return Ok(path.to_path_buf());
    }

    let output_path = path.with_extension("converted.wav");
    info!("Converting {:?} to WAV", path);

    let output = Command::new(ffmpeg_bin)
        .arg("-y")
        .arg("-i")
        .arg(path)
        .args(["-acodec", "pcm_s16le", "-ac", "1", "-ar"])
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg(&output_path)
        .output()
        .with_context(|| format!("failed to execute {}", ffmpeg_bin))?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffmpeg conversion failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(output_path)
}

/// Reads interleaved samples scaled to [-1, 1], with the channel count and sample rate.
fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to read WAV file {}", path.display()))?;
    let spec = reader.spec();
    let num_channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|val| val as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(anyhow!("unsupported WAV sample format: {:?} with {} bits", format, bits));
        }
    };

    debug!(
        "Read {} samples from {} ({} Hz, {} channels)",
        samples.len(),
        path.display(),
        spec.sample_rate,
        num_channels
    );
    Ok((samples, num_channels, spec.sample_rate))
}

/// Reads a mono 16 kHz WAV window written by [`write_wav`].
pub fn read_window(path: &Path) -> Result<Vec<f32>> {
    let (samples, num_channels, sample_rate) = read_wav_file(path)?;
    let mono = convert_to_mono(&samples, num_channels);
    if sample_rate == TARGET_SAMPLE_RATE {
        Ok(mono)
    } else {
        resample_audio(&mono, sample_rate)
    }
}

fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

fn peak(samples: &[f32]) -> f32 {
    samples.par_iter().map(|s| s.abs()).reduce(|| 0.0, f32::max)
}

fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let max_abs = peak(samples);
    if max_abs == 0.0 {
        return samples.to_vec();
    }
    samples.par_iter().map(|&s| s / max_abs).collect()
}

fn resample_audio(samples: &[f32], original_sample_rate: u32) -> Result<Vec<f32>> {
    debug!("Resampling from {} Hz to {} Hz", original_sample_rate, TARGET_SAMPLE_RATE);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = TARGET_SAMPLE_RATE as f64 / original_sample_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| anyhow!("failed to create resampler: {}", e))?;

    let mut resampled = Vec::with_capacity((samples.len() as f64 * ratio) as usize + RESAMPLE_CHUNK);
    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let out = resampler
            .process(&[chunk], None)
            .map_err(|e| anyhow!("resampling failed: {}", e))?;
        resampled.extend_from_slice(&out[0]);
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let out = resampler
            .process_partial(Some(&[remainder]), None)
            .map_err(|e| anyhow!("resampling failed: {}", e))?;
        resampled.extend_from_slice(&out[0]);
    }

    Ok(resampled)
}

/// Spectral noise reduction with a Wiener-style gain per FFT bin.
///
/// The noise floor is estimated from the first frames of the signal.
pub fn spectral_noise_reduction(samples: &[f32], frame_size: usize, overlap: f32, strength: f32) -> Vec<f32> {
    let step_size = ((frame_size as f32 * (1.0 - overlap)) as usize).max(1);
    if samples.len() < frame_size {
        return samples.to_vec();
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(frame_size);
    let ifft = planner.plan_fft_inverse(frame_size);

    let frames = samples.windows(frame_size).step_by(step_size).collect::<Vec<_>>();
    let noise_power = estimate_noise_power(&frames, &fft);

    let processed_frames: Vec<Vec<Complex<f32>>> = frames
        .par_iter()
        .map(|frame| {
            let mut buffer: Vec<Complex<f32>> = frame
                .iter()
                .enumerate()
                .map(|(i, &s)| Complex::new(s * hann_window(i, frame_size), 0.0))
                .collect();

            fft.process(&mut buffer);

            for (i, bin) in buffer.iter_mut().enumerate() {
                let snr = bin.norm_sqr() / (noise_power[i] + 1e-10);
                let gain = 1.0 - (strength / (snr + 1.0)).min(1.0);
                *bin *= gain.sqrt();
            }

            ifft.process(&mut buffer);
            buffer
        })
        .collect();

    let mut output = vec![0.0; samples.len()];
    for (i, frame) in processed_frames.iter().enumerate() {
        let start = i * step_size;
        for (j, bin) in frame.iter().enumerate() {
            if let Some(out) = output.get_mut(start + j) {
                *out += bin.re / frame_size as f32;
            }
        }
    }

    let mut output = smooth_signal(&output, 5);
    remove_dc_offset(&mut output);

    // restore the input's peak level
    let output_peak = peak(&output);
    if output_peak > 0.0 {
        let gain = peak(samples) / output_peak;
        output.iter_mut().for_each(|x| *x *= gain);
    }

    output
}

fn estimate_noise_power(frames: &[&[f32]], fft: &Arc<dyn rustfft::Fft<f32>>) -> Vec<f32> {
    let frame_size = fft.len();
    let mut noise_power = vec![0.0; frame_size];
    let num_frames = frames.len().min(20);

    for frame in frames.iter().take(num_frames) {
        let mut buffer: Vec<Complex<f32>> = frame
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * hann_window(i, frame_size), 0.0))
            .collect();
        fft.process(&mut buffer);

        for (i, bin) in buffer.iter().enumerate() {
            noise_power[i] += bin.norm_sqr() / num_frames as f32;
        }
    }

    smooth_signal(&noise_power, 7)
}

fn hann_window(i: usize, size: usize) -> f32 {
    0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
}

fn smooth_signal(signal: &[f32], window_size: usize) -> Vec<f32> {
    let half_window = window_size / 2;
    (0..signal.len())
        .map(|i| {
            let start = i.saturating_sub(half_window);
            let end = (i + half_window + 1).min(signal.len());
            signal[start..end].iter().sum::<f32>() / (end - start) as f32
        })
        .collect()
}

fn remove_dc_offset(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
    samples.iter_mut().for_each(|s| *s -= mean);
}

/// A slice of the input audio, positioned by its offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    pub index: usize,
    pub start_ms: u64,
    pub samples: Vec<f32>,
}

impl AudioWindow {
    pub fn duration_ms(&self) -> u64 {
        samples_to_ms(self.samples.len())
    }
}

fn ms_to_samples(ms: u64) -> usize {
    (ms * TARGET_SAMPLE_RATE as u64 / 1000) as usize
}

fn samples_to_ms(samples: usize) -> u64 {
    samples as u64 * 1000 / TARGET_SAMPLE_RATE as u64
}

/// Cuts 16 kHz audio into overlapping windows of `window_ms`, advancing by
/// `window_ms - overlap_ms`. Trailing windows under one second are dropped.
pub fn split_windows(samples: &[f32], window_ms: u64, overlap_ms: u64) -> Result<Vec<AudioWindow>> {
    if overlap_ms >= window_ms {
        return Err(anyhow!("overlap ({} ms) must be shorter than the window ({} ms)", overlap_ms, window_ms));
    }
    let window = ms_to_samples(window_ms);
    let step = ms_to_samples(window_ms - overlap_ms);
    let min_len = ms_to_samples(MIN_WINDOW_MS);

    let windows = (0..samples.len())
        .step_by(step)
        .enumerate()
        .filter_map(|(index, start)| {
            let end = (start + window).min(samples.len());
            (end - start >= min_len).then(|| AudioWindow {
                index,
                start_ms: samples_to_ms(start),
                samples: samples[start..end].to_vec(),
            })
        })
        .collect();
    Ok(windows)
}

/// Writes mono 16 kHz samples in [-1, 1] as 16-bit PCM.
pub fn write_wav(path: &Path, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tone(seconds: f32, sample_rate: u32) -> Vec<f32> {
        let len = (seconds * sample_rate as f32) as usize;
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_split_windows_overlap_and_tail() {
        // 45 s: windows start at 0, 18, 36 s; the last one is 9 s long
        let samples = tone(45.0, TARGET_SAMPLE_RATE);
        let windows = split_windows(&samples, 20_000, 2_000).unwrap();

        let starts: Vec<u64> = windows.iter().map(|w| w.start_ms).collect();
        assert_eq!(starts, vec![0, 18_000, 36_000]);
        assert_eq!(windows[0].duration_ms(), 20_000);
        assert_eq!(windows[2].duration_ms(), 9_000);
        assert_eq!(windows[2].index, 2);
    }

    #[test]
    fn test_split_windows_drops_short_tail() {
        // 36.5 s leaves a 0.5 s window at 36 s
        let samples = tone(36.5, TARGET_SAMPLE_RATE);
        let windows = split_windows(&samples, 20_000, 2_000).unwrap();
        assert_eq!(windows.len(), 2);

        assert!(split_windows(&tone(0.5, TARGET_SAMPLE_RATE), 20_000, 2_000).unwrap().is_empty());
        assert!(split_windows(&samples, 2_000, 2_000).is_err());
    }

    #[test]
    fn test_wav_round_trip_keeps_length() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("window.wav");
        let samples = tone(1.5, TARGET_SAMPLE_RATE);

        write_wav(&path, &samples)?;
        let read = read_window(&path)?;

        assert_eq!(read.len(), samples.len());
        assert!((read[100] - samples[100]).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_load_samples_resamples_stereo_input() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec)?;
        for sample in tone(2.0, 44_100) {
            let value = (sample * i16::MAX as f32) as i16;
            writer.write_sample(value)?;
            writer.write_sample(value)?;
        }
        writer.finalize()?;

        let samples = load_samples(&path, "ffmpeg", false)?;
        let expected = 2 * TARGET_SAMPLE_RATE as usize;
        assert!(samples.len().abs_diff(expected) < RESAMPLE_CHUNK, "got {} samples", samples.len());
        assert!(peak(&samples) <= 1.0 + 1e-3);
        Ok(())
    }

    #[test]
    fn test_noise_reduction_keeps_length_and_peak() {
        let samples = tone(1.0, TARGET_SAMPLE_RATE);
        let denoised = spectral_noise_reduction(&samples, 2048, 0.75, 0.55);
        assert_eq!(denoised.len(), samples.len());
        assert!((peak(&denoised) - peak(&samples)).abs() < 1e-3);

        let short = vec![0.1; 100];
        assert_eq!(spectral_noise_reduction(&short, 2048, 0.75, 0.55), short);
    }
}
