#![cfg(feature = "backend-tract")]

//! Shared ONNX loading for the tract-based backends.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{InputSpec, ModelInput, Normalization, TensorData};

pub(crate) type OnnxPlan = TypedRunnableModel<TypedModel>;

/// Load an ONNX model and pin its first input to `spec`.
pub(crate) fn load_model(model_path: &Path, spec: &InputSpec) -> Result<OnnxPlan> {
    let datum = match spec.normalization {
        Normalization::Raw => u8::datum_type(),
        Normalization::Unit | Normalization::Signed => f32::datum_type(),
    };
    let shape = spec.shape();

    tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(datum, tvec!(shape[0], shape[1], shape[2], shape[3])),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

/// Build the input tensor for one inference call.
pub(crate) fn input_tensor(input: &ModelInput) -> Result<Tensor> {
    let shape = input.spec.shape();
    let tensor = match &input.data {
        TensorData::U8(values) => Tensor::from_shape(&shape, values.as_slice()),
        TensorData::F32(values) => Tensor::from_shape(&shape, values.as_slice()),
    };
    tensor.map_err(|err| anyhow!("failed to build input tensor: {err}"))
}

/// Run the plan and return every output cast to `f32`, with its shape.
pub(crate) fn run(plan: &OnnxPlan, input: &ModelInput) -> Result<Vec<(Vec<usize>, Vec<f32>)>> {
    let tensor = input_tensor(input)?;
    let outputs = plan
        .run(tvec!(tensor.into()))
        .context("ONNX inference failed")?;

    outputs
        .iter()
        .enumerate()
        .map(|(index, output)| {
            let cast = output
                .cast_to::<f32>()
                .map_err(|err| anyhow!("output {index} is not numeric: {err}"))?;
            let values = cast
                .as_slice::<f32>()
                .map_err(|err| anyhow!("output {index} is not contiguous: {err}"))?
                .to_vec();
            Ok((output.shape().to_vec(), values))
        })
        .collect()
}
