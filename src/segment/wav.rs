/// WAV loading for the CLI (mono downmix, float conversion)
use super::AudioAsset;
use crate::error::{AudioProvError, Result};
use hound::{SampleFormat, WavReader};
use std::path::Path;

/// Decode a WAV file into a mono `f32` waveform in [-1, 1]
pub fn load_wav(path: &Path) -> Result<(AudioAsset, Vec<f32>)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(AudioProvError::InvalidInput(format!(
            "{:?} declares zero channels",
            path
        )));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let channels = spec.channels as usize;
    let mono = downmix(&interleaved, channels);

    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "query".to_string());

    let mut asset = AudioAsset::from_samples(id, &mono, spec.sample_rate);
    asset.channels = spec.channels;

    tracing::debug!(
        path = ?path,
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        duration_secs = asset.duration_secs,
        "Decoded WAV"
    );

    Ok((asset, mono))
}

/// Average interleaved frames down to one channel
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use tempfile::TempDir;

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_load_int_wav() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("clip.wav");

        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..8000 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(i16::MAX / 2).unwrap();
        }
        writer.finalize().unwrap();

        let (asset, samples) = load_wav(&path).unwrap();
        assert_eq!(asset.id, "clip");
        assert_eq!(asset.sample_rate, 8000);
        assert_eq!(asset.channels, 2);
        assert_eq!(samples.len(), 8000);
        assert!((asset.duration_secs - 1.0).abs() < 1e-9);
        assert!((samples[0] - 0.5).abs() < 0.01);
    }
}
