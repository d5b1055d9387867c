//! # sectchain-core
//!
//! Appends a payload PE32+ image to a host PE32+ image as a new executable
//! section and chains entry: the host starts in the payload, and the
//! payload finds the host's original entry RVA in its own
//! `AddressOfEntryPoint` field.
//!
//! ```text
//!   host file                         new section (.bootkit)
//!   +------------------+              +----------------------+
//!   | headers          |  entry ----> | 0x1000 x 0xCC        |
//!   | sections ...     |         |    +----------------------+
//!   | trailing data    |         +--> | payload image        |
//!   +------------------+              |  (entry = host OEP)  |
//!   | appended section |              +----------------------+
//!   +------------------+
//! ```
//!
//! The library never touches the filesystem; see `sectchain-cli` for the
//! command-line front end.

pub mod error;
pub mod inject;
pub mod pe;

pub use error::{Error, ImageRole, Result};
pub use inject::{
    build_section_data, chain_entry_point, inject, inject_bytes, InjectOptions, InjectReport,
    Injected,
};
