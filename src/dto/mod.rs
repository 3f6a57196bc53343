pub mod device;
pub mod location_sample;

pub use device::Device;
pub use location_sample::{LocationSample, Metrics, ReturningId};
