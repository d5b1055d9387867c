//! PE32+ image model: parse, layout queries, serialize.

pub mod checksum;
pub mod parser;
pub mod writer;

#[cfg(test)]
pub(crate) mod fixtures;

pub use parser::{CoffHeader, OptionalHeader, PeError, PeFile, SectionHeader};
pub use writer::{align_up, append_section, set_entry_point, write_pe, AlignError};
