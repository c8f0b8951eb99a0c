//! Method sequence store: step records, ordered sequences and JSON documents.

pub mod document;
pub mod sequence;
pub mod step;

pub use document::MethodDocument;
pub use sequence::MethodSequence;
pub use step::{Diverter, EndAction, FractionCollect, Gradient, MethodStep, Monitor, PumpMode};
