use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::error::{Result, StepError};

/// Resample mono f32 audio from `from_rate` to `to_rate` with a windowed-sinc filter.
///
/// The filter is fixed, so identical input always produces identical output.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0, // max relative ratio
        params,
        samples.len(),
        1, // mono
    )
    .map_err(|e| StepError::Resample(e.to_string()))?;

    let input = vec![samples.to_vec()];
    let mut output = resampler
        .process(&input, None)
        .map_err(|e| StepError::Resample(e.to_string()))?
        .into_iter()
        .next()
        .unwrap_or_default();

    // flush what the filter still holds
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| StepError::Resample(e.to_string()))?;
    if let Some(tail) = tail.into_iter().next() {
        output.extend(tail);
    }
    output.resize(resampled_len(samples.len(), from_rate, to_rate), 0.0);

    log::debug!(
        "Resampled {} samples at {}Hz to {} samples at {}Hz",
        samples.len(),
        from_rate,
        output.len(),
        to_rate
    );

    Ok(output)
}

/// `ceil(len * to_rate / from_rate)`
pub fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    let scaled = len as u64 * to_rate as u64;
    scaled.div_ceil(from_rate as u64) as usize
}
