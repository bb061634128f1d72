pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod ssd;
#[cfg(feature = "backend-tract")]
mod tract;
#[cfg(feature = "backend-tract")]
pub mod yolo;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use ssd::SsdBackend;
#[cfg(feature = "backend-tract")]
pub use yolo::YoloBackend;
