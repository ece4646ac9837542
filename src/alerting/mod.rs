//! Change detection and the history/alert writer.

mod detector;
mod queue;
mod writer;

pub use detector::*;
pub use queue::*;
pub use writer::*;
