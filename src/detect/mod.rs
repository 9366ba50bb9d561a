mod backend;
mod contour;
mod locator;
mod result;

pub use backend::LocatorBackend;
pub use locator::ContourLocator;
pub use result::{Detection, NotFoundReason, Position};
