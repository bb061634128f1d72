use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{
    ChannelOrder, DetectorBackend, InputSpec, ModelInput, Normalization, TensorData, TensorLayout,
};
use crate::detect::labels::LabelMap;
use crate::detect::result::{NormalizedBox, Prediction};

const STUB_INPUT: InputSpec = InputSpec {
    width: 96,
    height: 96,
    channel_order: ChannelOrder::Rgb,
    layout: TensorLayout::Nhwc,
    normalization: Normalization::Raw,
};

/// Stub backend for tests and dry runs.
///
/// Derives up to three predictions from a SHA-256 of the input tensor, so the
/// same frame always yields the same boxes and different frames usually
/// yield different ones.
pub struct StubBackend {
    labels: LabelMap,
    input: InputSpec,
    fixed: Option<Vec<Prediction>>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            labels: LabelMap::parse("person\nbicycle\ncar\ndog"),
            input: STUB_INPUT,
            fixed: None,
            calls: 0,
        }
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_input_spec(mut self, input: InputSpec) -> Self {
        self.input = input;
        self
    }

    /// Always return `predictions`, ignoring the input.
    pub fn with_fixed_predictions(mut self, predictions: Vec<Prediction>) -> Self {
        self.fixed = Some(predictions);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn hashed_predictions(&self, digest: &[u8; 32]) -> Vec<Prediction> {
        let count = (digest[0] % 4) as usize;
        digest[1..]
            .chunks_exact(6)
            .take(count)
            .map(|b| {
                let class_id = if self.labels.is_empty() {
                    0
                } else {
                    b[0] as u32 % self.labels.len() as u32
                };
                let unit = |v: u8| v as f32 / 255.0;
                let xmin = unit(b[2]) * 0.6;
                let ymin = unit(b[3]) * 0.6;
                Prediction {
                    class_id,
                    label: self.labels.label(class_id).to_string(),
                    score: 0.3 + unit(b[1]) * 0.7,
                    bbox: NormalizedBox::new(
                        xmin,
                        ymin,
                        xmin + 0.1 + unit(b[4]) * 0.3,
                        ymin + 0.1 + unit(b[5]) * 0.3,
                    ),
                }
            })
            .collect()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_spec(&self) -> InputSpec {
        self.input
    }

    fn detect(&mut self, input: &ModelInput) -> Result<Vec<Prediction>> {
        input.ensure_matches(&self.input)?;
        self.calls += 1;

        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        let mut hasher = Sha256::new();
        match &input.data {
            TensorData::U8(values) => hasher.update(values),
            TensorData::F32(values) => {
                for v in values {
                    hasher.update(v.to_le_bytes());
                }
            }
        }
        let digest: [u8; 32] = hasher.finalize().into();
        Ok(self.hashed_predictions(&digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(fill: u8) -> ModelInput {
        ModelInput {
            spec: STUB_INPUT,
            data: TensorData::U8(vec![fill; STUB_INPUT.element_count()]),
        }
    }

    #[test]
    fn stub_backend_is_deterministic() -> Result<()> {
        let mut backend = StubBackend::new();
        let first = backend.detect(&input(7))?;
        let second = backend.detect(&input(7))?;
        assert_eq!(first, second);
        assert_eq!(backend.calls(), 2);
        Ok(())
    }

    #[test]
    fn stub_predictions_stay_in_range() -> Result<()> {
        let mut backend = StubBackend::new();
        for fill in 0..32u8 {
            for p in backend.detect(&input(fill))? {
                assert!(p.score >= 0.3 && p.score <= 1.0);
                assert!(p.bbox.xmin >= 0.0 && p.bbox.xmax <= 1.0);
                assert!(p.bbox.ymin < p.bbox.ymax);
            }
        }
        Ok(())
    }

    #[test]
    fn stub_rejects_mismatched_input() {
        let mut backend = StubBackend::new();
        let bad = ModelInput {
            spec: STUB_INPUT,
            data: TensorData::U8(vec![0; 10]),
        };
        assert!(backend.detect(&bad).is_err());
    }

    #[test]
    fn fixed_predictions_are_returned_verbatim() -> Result<()> {
        let fixed = vec![Prediction {
            class_id: 3,
            label: "dog".to_string(),
            score: 0.75,
            bbox: NormalizedBox::new(0.1, 0.1, 0.2, 0.2),
        }];
        let mut backend = StubBackend::new().with_fixed_predictions(fixed.clone());
        assert_eq!(backend.detect(&input(0))?, fixed);
        Ok(())
    }
}
