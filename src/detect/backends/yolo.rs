#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Result};

use super::tract::{load_model, run, OnnxPlan};
use crate::detect::backend::{
    ChannelOrder, DetectorBackend, InputSpec, ModelInput, Normalization, TensorLayout,
};
use crate::detect::decode::{decode_yolo, non_max_suppression, YoloHead};
use crate::detect::labels::LabelMap;
use crate::detect::result::Prediction;

/// Candidates below this score are dropped before NMS.
const CANDIDATE_SCORE: f32 = 0.25;
const NMS_IOU: f32 = 0.45;

/// YOLOv8-style single-head detector (`[1, 4 + classes, anchors]` output).
pub struct YoloBackend {
    plan: OnnxPlan,
    spec: InputSpec,
    labels: LabelMap,
}

impl YoloBackend {
    pub fn new(model_path: &Path, labels: LabelMap, size: u32) -> Result<Self> {
        let spec = InputSpec {
            width: size,
            height: size,
            channel_order: ChannelOrder::Rgb,
            layout: TensorLayout::Nchw,
            normalization: Normalization::Unit,
        };
        let plan = load_model(model_path, &spec)?;
        log::info!(
            "YoloBackend: loaded {} ({}x{})",
            model_path.display(),
            size,
            size
        );
        Ok(Self { plan, spec, labels })
    }
}

impl DetectorBackend for YoloBackend {
    fn name(&self) -> &'static str {
        "yolo"
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn detect(&mut self, input: &ModelInput) -> Result<Vec<Prediction>> {
        input.ensure_matches(&self.spec)?;
        let outputs = run(&self.plan, input)?;
        let (shape, values) = outputs
            .first()
            .ok_or_else(|| anyhow!("yolo model produced no outputs"))?;
        let head = YoloHead::from_shape(shape)?;

        let mut predictions = decode_yolo(
            values,
            head,
            self.spec.width,
            self.spec.height,
            CANDIDATE_SCORE,
            &self.labels,
        )?;
        non_max_suppression(&mut predictions, NMS_IOU);
        Ok(predictions)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = crate::pipeline::preprocess::blank_input(&self.spec);
        self.detect(&blank).map(|_| ())
    }
}
