#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Result};

use super::tract::{load_model, run, OnnxPlan};
use crate::detect::backend::{
    ChannelOrder, DetectorBackend, InputSpec, ModelInput, Normalization, TensorLayout,
};
use crate::detect::decode::decode_ssd;
use crate::detect::labels::LabelMap;
use crate::detect::result::Prediction;

/// Quantized SSD-MobileNet style detector.
///
/// Expects four outputs in order: boxes `[1, N, 4]` as `(ymin, xmin, ymax,
/// xmax)`, classes `[1, N]`, scores `[1, N]` and the detection count `[1]`.
pub struct SsdBackend {
    plan: OnnxPlan,
    spec: InputSpec,
    labels: LabelMap,
}

impl SsdBackend {
    /// `quantized` selects raw `u8` input; otherwise `f32` in `[-1, 1]`.
    pub fn new(model_path: &Path, labels: LabelMap, size: u32, quantized: bool) -> Result<Self> {
        let spec = InputSpec {
            width: size,
            height: size,
            channel_order: ChannelOrder::Rgb,
            layout: TensorLayout::Nhwc,
            normalization: if quantized {
                Normalization::Raw
            } else {
                Normalization::Signed
            },
        };
        let plan = load_model(model_path, &spec)?;
        log::info!(
            "SsdBackend: loaded {} ({}x{}, {:?})",
            model_path.display(),
            size,
            size,
            spec.normalization
        );
        Ok(Self { plan, spec, labels })
    }
}

impl DetectorBackend for SsdBackend {
    fn name(&self) -> &'static str {
        "ssd"
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn detect(&mut self, input: &ModelInput) -> Result<Vec<Prediction>> {
        input.ensure_matches(&self.spec)?;
        let outputs = run(&self.plan, input)?;
        let [boxes, classes, scores, count, ..] = outputs.as_slice() else {
            return Err(anyhow!(
                "ssd model produced {} outputs, expected 4",
                outputs.len()
            ));
        };
        let num = count.1.first().copied().unwrap_or(0.0).max(0.0) as usize;
        decode_ssd(&boxes.1, &classes.1, &scores.1, num, &self.labels)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = crate::pipeline::preprocess::blank_input(&self.spec);
        self.detect(&blank).map(|_| ())
    }
}
