//! Device Configuration Manager.
//!
//! Turns a `CaptureMode` plus `ParameterOverrides` into an ordered list of parameter writes.
//! Mode defaults go first and overrides last, so an explicit operator choice always wins.
//! Individual writes may fail on a given device or firmware; those failures are logged and
//! recorded in `AppliedParameters::rejected`, and the device keeps its prior value.

use crate::{
    AcquisitionMode, BufferHandling, CameraDevice, CaptureMode, NumericParam, ParameterOverrides,
    Setting,
};

/// Pixel format written when the operator does not choose one.
pub const DEFAULT_PIXEL_FORMAT: &str = "Mono8";

/// A numeric override that had to be pulled into the device bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clamped {
    pub param: NumericParam,
    pub requested: f64,
    pub applied: f64,
}

/// What actually reached the device.
///
/// Fields are `Some` only for writes the device accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedParameters {
    pub exposure: Option<f64>,
    pub gain: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<String>,
    pub clamped: Vec<Clamped>,
    /// Names of the settings the device refused.
    pub rejected: Vec<&'static str>,
    pub streaming: bool,
}

/// `max(min, min(value, max))`; the value passes through when the device reports no bounds.
pub fn clamp(value: f64, range: Option<(f64, f64)>) -> f64 {
    match range {
        Some((min, max)) => min.max(value.min(max)),
        None => value,
    }
}

/// Configure `device` for `mode`, then apply `overrides`.
///
/// Never fails: every write error is swallowed and recorded. Opening the device is the
/// caller's business and is where fatal errors come from.
pub fn configure(
    device: &mut dyn CameraDevice,
    mode: CaptureMode,
    overrides: &ParameterOverrides,
) -> AppliedParameters {
    let mut applied = AppliedParameters::default();

    if let Err(error) = device.stop_stream() {
        log::debug!("camera {}: stop stream before configure: {}", device.id(), error);
    }

    write(device, Setting::ExposureAuto(false), &mut applied);
    write(device, Setting::GainAuto(false), &mut applied);

    match mode {
        CaptureMode::AreaScan => {
            write(device, Setting::TriggerMode(false), &mut applied);
            write(device, Setting::AcquisitionMode(AcquisitionMode::Continuous), &mut applied);
        }
        CaptureMode::ContinuousAreaScan => {
            write(device, Setting::TriggerMode(false), &mut applied);
            write(device, Setting::AcquisitionMode(AcquisitionMode::Continuous), &mut applied);
            write(device, Setting::BufferHandling(BufferHandling::NewestOnly), &mut applied);
        }
        CaptureMode::LineScan => {
            if let Some((_, max)) = device.range(NumericParam::Width) {
                if write(device, Setting::Width(max as u32), &mut applied) {
                    applied.width = Some(max as u32);
                }
            }
            if let Some((_, max)) = device.range(NumericParam::Height) {
                if write(device, Setting::Height(max as u32), &mut applied) {
                    applied.height = Some(max as u32);
                }
            }
            write(device, Setting::BufferHandling(BufferHandling::NewestOnly), &mut applied);
            write(device, Setting::AcquisitionMode(AcquisitionMode::SingleFrame), &mut applied);
        }
    }

    if overrides.pixel_format.is_none()
        && write(device, Setting::PixelFormat(DEFAULT_PIXEL_FORMAT.to_string()), &mut applied)
    {
        applied.pixel_format = Some(DEFAULT_PIXEL_FORMAT.to_string());
    }

    if let Some(width) = overrides.width {
        if write(device, Setting::Width(width), &mut applied) {
            applied.width = Some(width);
        }
    }
    if let Some(height) = overrides.height {
        if write(device, Setting::Height(height), &mut applied) {
            applied.height = Some(height);
        }
    }
    if let Some(format) = &overrides.pixel_format {
        if write(device, Setting::PixelFormat(format.clone()), &mut applied) {
            applied.pixel_format = Some(format.clone());
        }
    }
    apply_exposure_gain(device, overrides, &mut applied);

    if mode.requires_running_stream() {
        match device.start_stream() {
            Ok(()) => applied.streaming = true,
            Err(error) => log::warn!("camera {}: failed to start stream: {}", device.id(), error),
        }
    }

    log::info!(
        "camera {}: configured for {} (exposure {:?}, gain {:?}, {} rejected)",
        device.id(),
        mode,
        applied.exposure,
        applied.gain,
        applied.rejected.len()
    );
    applied
}

/// Apply exposure and gain from `overrides` to a configured, possibly streaming device.
///
/// Used for operator changes during a session. Other fields need a stream restart and are
/// ignored here.
pub fn apply_live(device: &mut dyn CameraDevice, overrides: &ParameterOverrides) -> AppliedParameters {
    let mut applied = AppliedParameters::default();
    apply_exposure_gain(device, overrides, &mut applied);
    applied
}

fn apply_exposure_gain(
    device: &mut dyn CameraDevice,
    overrides: &ParameterOverrides,
    applied: &mut AppliedParameters,
) {
    if let Some(exposure) = overrides.exposure {
        let value = clamp_for(device, NumericParam::ExposureTime, exposure, applied);
        if write(device, Setting::ExposureTime(value), applied) {
            applied.exposure = Some(value);
        }
    }
    if let Some(gain) = overrides.gain {
        let value = clamp_for(device, NumericParam::Gain, gain, applied);
        if write(device, Setting::Gain(value), applied) {
            applied.gain = Some(value);
        }
    }
}

fn clamp_for(
    device: &dyn CameraDevice,
    param: NumericParam,
    requested: f64,
    applied: &mut AppliedParameters,
) -> f64 {
    let value = clamp(requested, device.range(param));
    if value != requested {
        log::warn!(
            "camera {}: {} {} out of range, clamped to {}",
            device.id(),
            param,
            requested,
            value
        );
        applied.clamped.push(Clamped {
            param,
            requested,
            applied: value,
        });
    }
    value
}

// returns whether the device accepted the write
fn write(device: &mut dyn CameraDevice, setting: Setting, applied: &mut AppliedParameters) -> bool {
    match device.write(&setting) {
        Ok(()) => true,
        Err(error) => {
            log::warn!("camera {}: {} rejected: {}", device.id(), setting.name(), error);
            applied.rejected.push(setting.name());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_bounds() {
        let range = Some((100.0, 50000.0));
        assert_eq!(clamp(70000.0, range), 50000.0);
        assert_eq!(clamp(50.0, range), 100.0);
        assert_eq!(clamp(1234.0, range), 1234.0);
    }

    #[test]
    fn test_clamp_without_bounds_passes_through() {
        assert_eq!(clamp(200000.0, None), 200000.0);
    }
}
