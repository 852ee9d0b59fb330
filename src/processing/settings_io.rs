//! Settings persistence as `key = value` text records.
//!
//! The file carries normalization, Lucy–Richardson, per-mask unsharp
//! masking and tone curve parameters. Unknown keys are ignored so files
//! written by newer versions still load.

use std::fs;
use std::path::Path;

use log::warn;

use super::settings::{
    LucyRichardsonSettings, NormalizationSettings, ProcessingSettings, UnsharpMask,
};
use super::tone_curve::ToneCurve;
use crate::error::{Error, Result};

pub fn save_settings(settings: &ProcessingSettings, path: &Path) -> Result<()> {
    let mut out = String::new();

    out.push_str(&format!(
        "NormalizationEnabled = {}\n",
        settings.normalization.enabled as u8
    ));
    out.push_str(&format!("NormalizationMin = {}\n", settings.normalization.min));
    out.push_str(&format!("NormalizationMax = {}\n", settings.normalization.max));

    out.push_str(&format!("LucyRichardsonSigma = {}\n", settings.lucy_richardson.sigma));
    out.push_str(&format!(
        "LucyRichardsonIterations = {}\n",
        settings.lucy_richardson.iterations
    ));
    out.push_str(&format!(
        "LucyRichardsonDeringing = {}\n",
        settings.lucy_richardson.deringing as u8
    ));

    out.push_str(&format!("UnsharpMaskCount = {}\n", settings.unsharp_masks.len()));
    for (i, mask) in settings.unsharp_masks.iter().enumerate() {
        out.push_str(&format!("UnsharpMask{i}Adaptive = {}\n", mask.adaptive as u8));
        out.push_str(&format!("UnsharpMask{i}Sigma = {}\n", mask.sigma));
        out.push_str(&format!("UnsharpMask{i}AmountMin = {}\n", mask.amount_min));
        out.push_str(&format!("UnsharpMask{i}AmountMax = {}\n", mask.amount_max));
        out.push_str(&format!("UnsharpMask{i}Threshold = {}\n", mask.threshold));
        out.push_str(&format!("UnsharpMask{i}Width = {}\n", mask.width));
    }

    let points: Vec<String> = settings
        .tone_curve
        .points()
        .iter()
        .map(|p| format!("{},{}", p.x, p.y))
        .collect();
    out.push_str(&format!("ToneCurvePoints = {}\n", points.join(";")));
    out.push_str(&format!("ToneCurveSmooth = {}\n", settings.tone_curve.is_smooth() as u8));
    out.push_str(&format!(
        "ToneCurveIsGamma = {}\n",
        settings.tone_curve.is_gamma_mode() as u8
    ));
    out.push_str(&format!("ToneCurveGamma = {}\n", settings.tone_curve.gamma()));

    fs::write(path, out).map_err(|e| Error::io(path, e))
}

pub fn load_settings(path: &Path) -> Result<ProcessingSettings> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

    let mut normalization = NormalizationSettings::default();
    let mut lr = LucyRichardsonSettings::default();
    let mut mask_count: Option<usize> = None;
    let mut masks = vec![UnsharpMask::default()];
    let mut curve_points: Option<Vec<(f32, f32)>> = None;
    let mut curve_smooth = true;
    let mut curve_is_gamma = false;
    let mut curve_gamma = 1.0f32;

    let parse_err =
        |key: &str, value: &str| Error::format(format!("invalid value for {key}: '{value}'"));

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("skipping malformed settings line: '{line}'");
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "NormalizationEnabled" => {
                normalization.enabled = value != "0";
            }
            "NormalizationMin" => {
                normalization.min = value.parse().map_err(|_| parse_err(key, value))?;
            }
            "NormalizationMax" => {
                normalization.max = value.parse().map_err(|_| parse_err(key, value))?;
            }
            "LucyRichardsonSigma" => {
                lr.sigma = value.parse().map_err(|_| parse_err(key, value))?;
            }
            "LucyRichardsonIterations" => {
                lr.iterations = value.parse().map_err(|_| parse_err(key, value))?;
            }
            "LucyRichardsonDeringing" => {
                lr.deringing = value != "0";
            }
            "UnsharpMaskCount" => {
                let count: usize = value.parse().map_err(|_| parse_err(key, value))?;
                if count == 0 {
                    return Err(Error::format("settings must define at least one unsharp mask"));
                }
                masks.resize(count, UnsharpMask::default());
                mask_count = Some(count);
            }
            "ToneCurvePoints" => {
                let mut points = Vec::new();
                for pair in value.split(';').filter(|p| !p.is_empty()) {
                    let (x, y) =
                        pair.split_once(',').ok_or_else(|| parse_err(key, value))?;
                    points.push((
                        x.trim().parse().map_err(|_| parse_err(key, value))?,
                        y.trim().parse().map_err(|_| parse_err(key, value))?,
                    ));
                }
                if points.len() < 2 {
                    return Err(Error::format("tone curve needs at least two points"));
                }
                curve_points = Some(points);
            }
            "ToneCurveSmooth" => {
                curve_smooth = value != "0";
            }
            "ToneCurveIsGamma" => {
                curve_is_gamma = value != "0";
            }
            "ToneCurveGamma" => {
                curve_gamma = value.parse().map_err(|_| parse_err(key, value))?;
            }
            _ if key.starts_with("UnsharpMask") => {
                let rest = &key["UnsharpMask".len()..];
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                let field = &rest[digits.len()..];
                let idx: usize = digits.parse().map_err(|_| parse_err(key, value))?;
                if idx >= masks.len() {
                    masks.resize(idx + 1, UnsharpMask::default());
                }
                let mask = &mut masks[idx];
                match field {
                    "Adaptive" => mask.adaptive = value != "0",
                    "Sigma" => mask.sigma = value.parse().map_err(|_| parse_err(key, value))?,
                    "AmountMin" => {
                        mask.amount_min = value.parse().map_err(|_| parse_err(key, value))?
                    }
                    "AmountMax" => {
                        mask.amount_max = value.parse().map_err(|_| parse_err(key, value))?
                    }
                    "Threshold" => {
                        mask.threshold = value.parse().map_err(|_| parse_err(key, value))?
                    }
                    "Width" => mask.width = value.parse().map_err(|_| parse_err(key, value))?,
                    _ => warn!("ignoring unknown settings key: '{key}'"),
                }
            }
            _ => warn!("ignoring unknown settings key: '{key}'"),
        }
    }

    if let Some(count) = mask_count {
        masks.truncate(count.max(1));
    }

    let mut tone_curve = match curve_points {
        Some(points) => ToneCurve::from_points(points),
        None => ToneCurve::identity(),
    };
    tone_curve.set_smooth(curve_smooth);
    tone_curve.set_gamma_mode(curve_is_gamma);
    tone_curve.set_gamma(curve_gamma);

    Ok(ProcessingSettings {
        normalization,
        lucy_richardson: lr,
        unsharp_masks: masks,
        tone_curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn settings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proc.settings");

        let mut settings = ProcessingSettings::new();
        settings.normalization =
            NormalizationSettings { enabled: true, min: 0.05, max: 0.95 };
        settings.lucy_richardson =
            LucyRichardsonSettings { sigma: 1.7, iterations: 42, deringing: true };
        settings.unsharp_masks = vec![
            UnsharpMask { adaptive: false, sigma: 1.1, amount_min: 1.0, amount_max: 1.8, threshold: 0.4, width: 0.2 },
            UnsharpMask { adaptive: true, sigma: 3.0, amount_min: 0.8, amount_max: 2.5, threshold: 0.6, width: 0.1 },
        ];
        settings.tone_curve.add_point(0.3, 0.55);
        settings.tone_curve.set_smooth(false);

        save_settings(&settings, &path).unwrap();
        let loaded = load_settings(&path).unwrap();

        assert_eq!(loaded.normalization, settings.normalization);
        assert_eq!(loaded.lucy_richardson, settings.lucy_richardson);
        assert_eq!(loaded.unsharp_masks, settings.unsharp_masks);
        assert_eq!(loaded.tone_curve.points().len(), 3);
        assert!(!loaded.tone_curve.is_smooth());
        assert!((loaded.tone_curve.points()[1].x - 0.3).abs() < 1e-6);
        assert!((loaded.tone_curve.points()[1].y - 0.55).abs() < 1e-6);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proc.settings");
        std::fs::write(
            &path,
            "LucyRichardsonSigma = 2.5\nSomeFutureKey = whatever\n",
        )
        .unwrap();

        let loaded = load_settings(&path).unwrap();
        assert!((loaded.lucy_richardson.sigma - 2.5).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            load_settings(Path::new("/nonexistent/proc.settings")),
            Err(Error::Io { .. })
        ));
    }
}
