pub mod saturation;
pub mod velvia;

pub use saturation::Saturation;
pub use velvia::Velvia;
