//! Processing primitives and parameters: deconvolution, unsharp masking,
//! tone curves, settings snapshots and the selection histogram.

pub mod deconvolution;
pub mod histogram;
pub mod settings;
pub mod settings_io;
pub mod tone_curve;
pub mod unsharp;

pub use settings::{
    CompletionStatus, LucyRichardsonSettings, NormalizationSettings, ProcessingRequest,
    ProcessingSettings, UnsharpMask,
};
pub use tone_curve::ToneCurve;
