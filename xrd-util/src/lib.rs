pub mod gate;
pub mod logging;
pub mod span;

pub use gate::{Aborted, Gate, Signal};
pub use span::Span;
