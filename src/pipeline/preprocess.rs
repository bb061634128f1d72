//! Frame to model-input conversion.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::detect::{ChannelOrder, InputSpec, ModelInput, Normalization, TensorData, TensorLayout};

/// Resize `image` to the backend input and lay it out as the backend expects.
pub fn preprocess(image: &RgbImage, spec: &InputSpec) -> ModelInput {
    let resized;
    let pixels = if image.dimensions() == (spec.width, spec.height) {
        image
    } else {
        resized = imageops::resize(image, spec.width, spec.height, FilterType::Triangle);
        &resized
    };

    let (w, h) = (spec.width as usize, spec.height as usize);
    let raw = pixels.as_raw();
    let channel = |index: usize, c: usize| -> u8 {
        let c = match spec.channel_order {
            ChannelOrder::Rgb => c,
            ChannelOrder::Bgr => 2 - c,
        };
        raw[index * 3 + c]
    };

    // Element order of the output tensor, as (pixel index, channel) pairs.
    let order: Box<dyn Iterator<Item = (usize, usize)>> = match spec.layout {
        TensorLayout::Nhwc => Box::new((0..w * h).flat_map(|p| (0..3).map(move |c| (p, c)))),
        TensorLayout::Nchw => Box::new((0..3).flat_map(move |c| (0..w * h).map(move |p| (p, c)))),
    };

    let data = match spec.normalization {
        Normalization::Raw => TensorData::U8(order.map(|(p, c)| channel(p, c)).collect()),
        Normalization::Unit => TensorData::F32(
            order
                .map(|(p, c)| channel(p, c) as f32 / 255.0)
                .collect(),
        ),
        Normalization::Signed => TensorData::F32(
            order
                .map(|(p, c)| (channel(p, c) as f32 - 127.5) / 127.5)
                .collect(),
        ),
    };

    ModelInput { spec: *spec, data }
}

/// All-zero input matching `spec`, used for warm-up runs.
pub fn blank_input(spec: &InputSpec) -> ModelInput {
    let len = spec.element_count();
    let data = match spec.normalization {
        Normalization::Raw => TensorData::U8(vec![0; len]),
        Normalization::Unit | Normalization::Signed => TensorData::F32(vec![0.0; len]),
    };
    ModelInput { spec: *spec, data }
}
