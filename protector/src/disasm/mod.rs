pub mod decoder;
pub mod engine;

pub use engine::{AddressRange, DisassemblyEngine, DisassemblyVisitor};
