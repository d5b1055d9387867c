//! Minimal PE32+ parser.
//!
//! Reads just enough of the DOS header, COFF header, optional header and
//! section table to relocate entry points and append sections. The raw
//! buffer is kept inside [`PeFile`] so the writer can start from the exact
//! original bytes.

use log::debug;
use thiserror::Error;

use super::writer::{align_up, AlignError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or re-serializing a PE file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeError {
    /// The first two bytes are not `MZ` (0x5A4D).
    #[error("invalid DOS signature (expected 0x5A4D)")]
    InvalidDosSignature,
    /// The four bytes at `e_lfanew` are not `PE\0\0` (0x00004550).
    #[error("invalid PE signature (expected 0x00004550)")]
    InvalidPeSignature,
    /// The input buffer is too short to contain a required structure.
    #[error("file is truncated")]
    TruncatedFile,
    /// The `Machine` field in the COFF header is not a supported value.
    #[error("unsupported machine type: 0x{0:04X}")]
    UnsupportedMachine(u16),
    /// Only PE32+ optional headers are handled.
    #[error("unsupported optional header magic: 0x{0:04X} (expected PE32+ 0x020B)")]
    UnsupportedFormat(u16),
    /// The declared section table extends past the end of the buffer.
    #[error("section table ({count} entries at 0x{offset:X}) runs past end of file")]
    SectionTableOutOfBounds { offset: usize, count: usize },
    /// The image declares no sections to append after.
    #[error("image has no sections")]
    NoSections,
    /// The last section table entry is not the highest-addressed one.
    #[error("last section ends below end of image (0x{last_end:X} < 0x{image_end:X})")]
    SectionsOutOfOrder { last_end: u32, image_end: u32 },
    /// The header area cannot hold another section descriptor.
    #[error("no room for another section header (table ends at 0x{table_end:X}, headers end at 0x{limit:X})")]
    NoSectionTableRoom { table_end: usize, limit: usize },
    /// An appended section must start exactly at the current end of file.
    #[error("appended section raw data at 0x{actual:X}, end of file is 0x{expected:X}")]
    RawOffsetNotAtEnd { expected: usize, actual: usize },
    /// `NumberOfSections` is a 16-bit field.
    #[error("section count would exceed {}", u16::MAX)]
    TooManySections,
    /// `NumberOfSections` disagrees with the in-memory section list.
    #[error("section count mismatch: header says {declared}, table holds {actual}")]
    SectionCountMismatch { declared: u16, actual: usize },
    /// A section name does not fit the 8-byte name field.
    #[error("section name '{0}' is longer than 8 bytes")]
    NameTooLong(String),
}

// ---------------------------------------------------------------------------
// Little-endian read helpers
// ---------------------------------------------------------------------------

/// Read a `u16` at `offset` (little-endian).  Returns `TruncatedFile` if out
/// of bounds.
pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16, PeError> {
    let bytes = data
        .get(offset..offset.checked_add(2).ok_or(PeError::TruncatedFile)?)
        .ok_or(PeError::TruncatedFile)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a `u32` at `offset` (little-endian).
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, PeError> {
    let bytes = data
        .get(offset..offset.checked_add(4).ok_or(PeError::TruncatedFile)?)
        .ok_or(PeError::TruncatedFile)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a `u64` at `offset` (little-endian).
pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64, PeError> {
    let bytes = data
        .get(offset..offset.checked_add(8).ok_or(PeError::TruncatedFile)?)
        .ok_or(PeError::TruncatedFile)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

// ---------------------------------------------------------------------------
// Well-known constants
// ---------------------------------------------------------------------------

/// `MZ` -- DOS header magic.
pub const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0` -- PE signature.
pub const PE_SIGNATURE: u32 = 0x0000_4550;

/// Optional-header magic for PE32 (32-bit).  Recognised only to reject it.
pub const PE32_MAGIC: u16 = 0x010B;
/// Optional-header magic for PE32+ (64-bit).
pub const PE32PLUS_MAGIC: u16 = 0x020B;

/// IMAGE_FILE_MACHINE_I386
pub const MACHINE_I386: u16 = 0x014C;
/// IMAGE_FILE_MACHINE_AMD64
pub const MACHINE_AMD64: u16 = 0x8664;
/// IMAGE_FILE_MACHINE_ARM64
pub const MACHINE_ARM64: u16 = 0xAA64;

/// Size of the COFF file header that follows the PE signature.
pub const COFF_HEADER_SIZE: usize = 20;
/// Size of one section table entry.
pub const SECTION_HEADER_SIZE: usize = 40;

// Field offsets inside a PE32+ optional header.
pub(crate) const OPT_ENTRY_POINT: usize = 16;
pub(crate) const OPT_IMAGE_BASE: usize = 24;
pub(crate) const OPT_SECTION_ALIGNMENT: usize = 32;
pub(crate) const OPT_FILE_ALIGNMENT: usize = 36;
pub(crate) const OPT_SIZE_OF_IMAGE: usize = 56;
pub(crate) const OPT_SIZE_OF_HEADERS: usize = 60;
pub(crate) const OPT_CHECKSUM: usize = 64;
pub(crate) const OPT_NUMBER_OF_RVA_AND_SIZES: usize = 108;

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

/// COFF file header (20 bytes in the file, we store the interesting subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// The PE32+ optional header fields that layout changes touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalHeader {
    pub magic: u16,
    pub entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub number_of_rva_and_sizes: u32,
}

/// A single section header (40 bytes in the file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Raw 8-byte name (may or may not be null-terminated).
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Build a zero-initialised header carrying `name`.
    pub fn new(name: &str) -> Result<SectionHeader, PeError> {
        let bytes = name.as_bytes();
        if bytes.len() > 8 {
            return Err(PeError::NameTooLong(name.to_string()));
        }
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(SectionHeader {
            name: raw,
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            characteristics: 0,
        })
    }

    /// Return the section name as a UTF-8 `&str`, trimming any trailing NUL
    /// bytes.  Invalid UTF-8 yields `"<invalid>"`.
    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// End of the file range covered by this section's raw data.
    pub fn raw_end(&self) -> u64 {
        self.pointer_to_raw_data as u64 + self.size_of_raw_data as u64
    }
}

// ---------------------------------------------------------------------------
// PeFile
// ---------------------------------------------------------------------------

/// A parsed PE file held entirely in memory.
#[derive(Debug, Clone)]
pub struct PeFile {
    /// The raw bytes of the entire file.
    pub data: Vec<u8>,
    /// Absolute file offset where the PE signature lives (`e_lfanew`).
    pub pe_offset: usize,
    pub coff_header: CoffHeader,
    pub optional_header: OptionalHeader,
    pub sections: Vec<SectionHeader>,
}

impl PeFile {
    /// Parse a PE32+ file from a raw byte buffer.
    ///
    /// The buffer is consumed and stored inside the returned `PeFile` so that
    /// the writer can reproduce every byte it does not explicitly change.
    pub fn parse(data: Vec<u8>) -> Result<PeFile, PeError> {
        // --- DOS header ----------------------------------------------------
        let e_magic = read_u16(&data, 0)?;
        if e_magic != DOS_MAGIC {
            return Err(PeError::InvalidDosSignature);
        }
        let pe_offset = read_u32(&data, 0x3C)? as usize;

        // --- PE signature --------------------------------------------------
        if read_u32(&data, pe_offset)? != PE_SIGNATURE {
            return Err(PeError::InvalidPeSignature);
        }

        // --- COFF header ---------------------------------------------------
        let coff_offset = pe_offset + 4;
        let machine = read_u16(&data, coff_offset)?;
        match machine {
            MACHINE_I386 | MACHINE_AMD64 | MACHINE_ARM64 => {}
            other => return Err(PeError::UnsupportedMachine(other)),
        }
        let coff_header = CoffHeader {
            machine,
            number_of_sections: read_u16(&data, coff_offset + 2)?,
            size_of_optional_header: read_u16(&data, coff_offset + 16)?,
            characteristics: read_u16(&data, coff_offset + 18)?,
        };

        // --- Optional header -----------------------------------------------
        let opt_offset = coff_offset + COFF_HEADER_SIZE;
        let magic = read_u16(&data, opt_offset)?;
        if magic != PE32PLUS_MAGIC {
            return Err(PeError::UnsupportedFormat(magic));
        }
        let optional_header = OptionalHeader {
            magic,
            entry_point: read_u32(&data, opt_offset + OPT_ENTRY_POINT)?,
            image_base: read_u64(&data, opt_offset + OPT_IMAGE_BASE)?,
            section_alignment: read_u32(&data, opt_offset + OPT_SECTION_ALIGNMENT)?,
            file_alignment: read_u32(&data, opt_offset + OPT_FILE_ALIGNMENT)?,
            size_of_image: read_u32(&data, opt_offset + OPT_SIZE_OF_IMAGE)?,
            size_of_headers: read_u32(&data, opt_offset + OPT_SIZE_OF_HEADERS)?,
            checksum: read_u32(&data, opt_offset + OPT_CHECKSUM)?,
            number_of_rva_and_sizes: read_u32(&data, opt_offset + OPT_NUMBER_OF_RVA_AND_SIZES)?,
        };

        // --- Section headers -----------------------------------------------
        let section_table_offset = opt_offset + coff_header.size_of_optional_header as usize;
        let num_sections = coff_header.number_of_sections as usize;
        let table_end = section_table_offset + num_sections * SECTION_HEADER_SIZE;
        if table_end > data.len() {
            return Err(PeError::SectionTableOutOfBounds {
                offset: section_table_offset,
                count: num_sections,
            });
        }

        let sections = data[section_table_offset..table_end]
            .chunks_exact(SECTION_HEADER_SIZE)
            .map(|entry| {
                let mut name = [0u8; 8];
                name.copy_from_slice(&entry[..8]);
                Ok(SectionHeader {
                    name,
                    virtual_size: read_u32(entry, 8)?,
                    virtual_address: read_u32(entry, 12)?,
                    size_of_raw_data: read_u32(entry, 16)?,
                    pointer_to_raw_data: read_u32(entry, 20)?,
                    characteristics: read_u32(entry, 36)?,
                })
            })
            .collect::<Result<Vec<_>, PeError>>()?;

        debug!(
            "parsed PE32+ image: {} bytes, {} sections, entry=0x{:08X}, size_of_image=0x{:X}",
            data.len(),
            sections.len(),
            optional_header.entry_point,
            optional_header.size_of_image
        );

        Ok(PeFile {
            data,
            pe_offset,
            coff_header,
            optional_header,
            sections,
        })
    }

    // -- layout helpers -----------------------------------------------------

    /// Absolute file offset of the optional header.
    pub fn optional_header_offset(&self) -> usize {
        self.pe_offset + 4 + COFF_HEADER_SIZE
    }

    /// Absolute file offset of the first section table entry.
    pub fn section_table_offset(&self) -> usize {
        self.optional_header_offset() + self.coff_header.size_of_optional_header as usize
    }

    /// Absolute file offset of the optional-header checksum field.
    pub fn checksum_offset(&self) -> usize {
        self.optional_header_offset() + OPT_CHECKSUM
    }

    /// Current end-of-file offset; appended data lands here.
    pub fn end_of_file(&self) -> usize {
        self.data.len()
    }

    /// First RVA past every section once each is rounded up to the section
    /// alignment.
    pub fn end_of_image(&self) -> Result<u32, AlignError> {
        let alignment = self.optional_header.section_alignment;
        self.sections.iter().try_fold(0u32, |end, s| {
            let size = align_up(s.virtual_size, alignment)?;
            let section_end = s
                .virtual_address
                .checked_add(size)
                .ok_or(AlignError::Overflow)?;
            Ok(end.max(section_end))
        })
    }

    /// How many section descriptors the header area can hold.
    ///
    /// The table may grow up to `SizeOfHeaders` and never into the raw data
    /// of a section.
    pub fn section_table_capacity(&self) -> usize {
        let first_raw = self
            .sections
            .iter()
            .filter(|s| s.size_of_raw_data != 0 && s.pointer_to_raw_data != 0)
            .map(|s| s.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(usize::MAX);
        let limit = (self.optional_header.size_of_headers as usize)
            .min(first_raw)
            .min(self.data.len());
        limit.saturating_sub(self.section_table_offset()) / SECTION_HEADER_SIZE
    }

    /// Look up a section by its (ASCII) name, e.g. `".text"`.
    pub fn find_section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name_str() == name)
    }

    /// Return the section's raw bytes, clamped to what the file contains.
    pub fn section_data(&self, section: &SectionHeader) -> &[u8] {
        let start = section.pointer_to_raw_data as usize;
        let end = start.saturating_add(section.size_of_raw_data as usize);
        let clamped_end = end.min(self.data.len());
        let clamped_start = start.min(clamped_end);
        &self.data[clamped_start..clamped_end]
    }

    /// Bytes after the furthest section raw data (certificate tables,
    /// debug blobs, installer overlays).
    pub fn trailing_data_len(&self) -> usize {
        let raw_end = self
            .sections
            .iter()
            .map(|s| s.raw_end())
            .max()
            .unwrap_or(0);
        (self.data.len() as u64).saturating_sub(raw_end) as usize
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
