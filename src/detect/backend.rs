use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::detect::result::Prediction;

/// Channel order the model expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Tensor memory layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum TensorLayout {
    /// `[1, height, width, 3]`
    #[default]
    Nhwc,
    /// `[1, 3, height, width]`
    Nchw,
}

/// Pixel value normalisation applied during preprocessing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Normalization {
    /// Untouched `u8` values (quantized models).
    #[default]
    Raw,
    /// `f32` in `[0, 1]`.
    Unit,
    /// `f32` in `[-1, 1]`, i.e. `(v - 127.5) / 127.5`.
    Signed,
}

/// Shape and encoding of the tensor a backend consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub channel_order: ChannelOrder,
    pub layout: TensorLayout,
    pub normalization: Normalization,
}

impl InputSpec {
    pub fn element_count(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Tensor shape as the model sees it.
    pub fn shape(&self) -> [usize; 4] {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, 3],
            TensorLayout::Nchw => [1, 3, h, w],
        }
    }
}

/// Preprocessed tensor data.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(values) => values.len(),
            TensorData::F32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Model input produced by the pipeline's preprocessing stage.
#[derive(Clone, Debug)]
pub struct ModelInput {
    pub spec: InputSpec,
    pub data: TensorData,
}

impl ModelInput {
    /// Check that the tensor matches what `expected` describes.
    pub fn ensure_matches(&self, expected: &InputSpec) -> Result<()> {
        if self.spec != *expected {
            return Err(anyhow!(
                "model input {:?} does not match backend spec {:?}",
                self.spec,
                expected
            ));
        }
        if self.data.len() != expected.element_count() {
            return Err(anyhow!(
                "expected {} tensor elements, received {}",
                expected.element_count(),
                self.data.len()
            ));
        }
        Ok(())
    }
}

/// Detector backend trait.
///
/// Backends are selected once, at construction time, and owned by the
/// pipeline thread for the duration of one run. They never see the source
/// frame, only the preprocessed tensor.
pub trait DetectorBackend: Send {
    /// Backend identifier (also the metrics subdirectory name).
    fn name(&self) -> &'static str;

    /// Input tensor the backend expects.
    fn input_spec(&self) -> InputSpec;

    /// Run detection on one preprocessed input.
    ///
    /// Predictions are returned unfiltered; score thresholding happens in the
    /// pipeline. An error here is fatal to the run.
    fn detect(&mut self, input: &ModelInput) -> Result<Vec<Prediction>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl DetectorBackend for Box<dyn DetectorBackend> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn input_spec(&self) -> InputSpec {
        (**self).input_spec()
    }

    fn detect(&mut self, input: &ModelInput) -> Result<Vec<Prediction>> {
        (**self).detect(input)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
