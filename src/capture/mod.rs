pub mod driver;
pub mod frame;
pub mod simulator;
pub mod source;

pub use driver::CameraDriver;
pub use frame::{LensImageTask, LensTag, PixelFormat, RawFrame};
pub use simulator::SimulatedCamera;
pub use source::{FrameSource, LensGeometry};
