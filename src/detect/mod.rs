mod backend;
mod backends;
pub mod decode;
mod labels;
mod registry;
mod result;

pub use backend::{
    ChannelOrder, DetectorBackend, InputSpec, ModelInput, Normalization, TensorData, TensorLayout,
};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{SsdBackend, YoloBackend};
pub use labels::{LabelMap, UNKNOWN_LABEL};
pub use registry::{BackendFactory, BackendRegistry, BackendSettings};
pub use result::{BoundingBox, Detection, NormalizedBox, Prediction};
