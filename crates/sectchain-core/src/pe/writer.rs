//! PE writer module.
//!
//! Takes a parsed [`PeFile`] and writes modifications back to bytes.  It
//! supports serialising the headers, appending a section at end-of-file and
//! changing the entry point.

use log::debug;
use thiserror::Error;

use super::parser::{
    PeError, PeFile, SectionHeader, COFF_HEADER_SIZE, OPT_CHECKSUM, OPT_ENTRY_POINT,
    OPT_FILE_ALIGNMENT, OPT_IMAGE_BASE, OPT_NUMBER_OF_RVA_AND_SIZES, OPT_SECTION_ALIGNMENT,
    OPT_SIZE_OF_HEADERS, OPT_SIZE_OF_IMAGE, SECTION_HEADER_SIZE,
};

// ---------------------------------------------------------------------------
// Section characteristic constants
// ---------------------------------------------------------------------------

/// IMAGE_SCN_MEM_READ
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
/// IMAGE_SCN_MEM_WRITE
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
/// IMAGE_SCN_MEM_EXECUTE
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// IMAGE_SCN_CNT_CODE
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;

// ---------------------------------------------------------------------------
// Alignment helpers
// ---------------------------------------------------------------------------

/// Alignment and address-range failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AlignError {
    #[error("alignment 0x{0:X} is not a positive power of two")]
    NotPowerOfTwo(u32),
    #[error("computed offset overflows the 32-bit address range")]
    Overflow,
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// Values that are already multiples come back unchanged.
pub fn align_up(value: u32, alignment: u32) -> Result<u32, AlignError> {
    if !alignment.is_power_of_two() {
        return Err(AlignError::NotPowerOfTwo(alignment));
    }
    let mask = alignment - 1;
    value
        .checked_add(mask)
        .map(|v| v & !mask)
        .ok_or(AlignError::Overflow)
}

// ---------------------------------------------------------------------------
// Little-endian write helpers
// ---------------------------------------------------------------------------

fn put_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<(), PeError> {
    buf.get_mut(offset..offset + 2)
        .ok_or(PeError::TruncatedFile)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), PeError> {
    buf.get_mut(offset..offset + 4)
        .ok_or(PeError::TruncatedFile)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<(), PeError> {
    buf.get_mut(offset..offset + 8)
        .ok_or(PeError::TruncatedFile)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Serialize a [`PeFile`] back to a byte vector.
///
/// Starts from `pe.data` (DOS stub, rich header, section payloads and any
/// overlay are preserved) and rewrites the tracked COFF and optional header
/// fields plus the section table at their original offsets.
pub fn write_pe(pe: &PeFile) -> Result<Vec<u8>, PeError> {
    if pe.coff_header.number_of_sections as usize != pe.sections.len() {
        return Err(PeError::SectionCountMismatch {
            declared: pe.coff_header.number_of_sections,
            actual: pe.sections.len(),
        });
    }

    let mut buf = pe.data.clone();

    // --- COFF header -------------------------------------------------------
    let coff_offset = pe.pe_offset + 4;
    put_u16(&mut buf, coff_offset, pe.coff_header.machine)?;
    put_u16(&mut buf, coff_offset + 2, pe.coff_header.number_of_sections)?;
    put_u16(&mut buf, coff_offset + 16, pe.coff_header.size_of_optional_header)?;
    put_u16(&mut buf, coff_offset + 18, pe.coff_header.characteristics)?;

    // --- Optional header ---------------------------------------------------
    let opt = &pe.optional_header;
    let opt_offset = coff_offset + COFF_HEADER_SIZE;
    put_u16(&mut buf, opt_offset, opt.magic)?;
    put_u32(&mut buf, opt_offset + OPT_ENTRY_POINT, opt.entry_point)?;
    put_u64(&mut buf, opt_offset + OPT_IMAGE_BASE, opt.image_base)?;
    put_u32(&mut buf, opt_offset + OPT_SECTION_ALIGNMENT, opt.section_alignment)?;
    put_u32(&mut buf, opt_offset + OPT_FILE_ALIGNMENT, opt.file_alignment)?;
    put_u32(&mut buf, opt_offset + OPT_SIZE_OF_IMAGE, opt.size_of_image)?;
    put_u32(&mut buf, opt_offset + OPT_SIZE_OF_HEADERS, opt.size_of_headers)?;
    put_u32(&mut buf, opt_offset + OPT_CHECKSUM, opt.checksum)?;
    put_u32(
        &mut buf,
        opt_offset + OPT_NUMBER_OF_RVA_AND_SIZES,
        opt.number_of_rva_and_sizes,
    )?;

    // --- Section headers ---------------------------------------------------
    let section_table_offset = pe.section_table_offset();
    for (i, section) in pe.sections.iter().enumerate() {
        let base = section_table_offset + i * SECTION_HEADER_SIZE;
        buf.get_mut(base..base + 8)
            .ok_or(PeError::TruncatedFile)?
            .copy_from_slice(&section.name);
        put_u32(&mut buf, base + 8, section.virtual_size)?;
        put_u32(&mut buf, base + 12, section.virtual_address)?;
        put_u32(&mut buf, base + 16, section.size_of_raw_data)?;
        put_u32(&mut buf, base + 20, section.pointer_to_raw_data)?;
        // Bytes 24..36 (relocation and line-number pointers/counts) keep
        // whatever the original file had there.
        put_u32(&mut buf, base + 36, section.characteristics)?;
    }

    Ok(buf)
}

/// Append `section` and its raw `data` at the current end of file.
///
/// `section.pointer_to_raw_data` must already equal `pe.end_of_file()`.  The
/// data is zero-padded up to `size_of_raw_data`, so the file grows by the
/// full aligned raw size rather than `data.len()` and ends exactly on the
/// declared raw extent.  The section table slot is zeroed so that fields this
/// model does not track start out clean.
///
/// Nothing is modified when an error is returned.
pub fn append_section(
    pe: &mut PeFile,
    section: SectionHeader,
    data: &[u8],
) -> Result<(), PeError> {
    if pe.sections.len() >= pe.section_table_capacity() {
        let table_end = pe.section_table_offset() + (pe.sections.len() + 1) * SECTION_HEADER_SIZE;
        return Err(PeError::NoSectionTableRoom {
            table_end,
            limit: pe.optional_header.size_of_headers as usize,
        });
    }
    if section.pointer_to_raw_data as usize != pe.end_of_file() {
        return Err(PeError::RawOffsetNotAtEnd {
            expected: pe.end_of_file(),
            actual: section.pointer_to_raw_data as usize,
        });
    }
    let section_count = pe
        .coff_header
        .number_of_sections
        .checked_add(1)
        .ok_or(PeError::TooManySections)?;

    let slot = pe.section_table_offset() + pe.sections.len() * SECTION_HEADER_SIZE;
    pe.data[slot..slot + SECTION_HEADER_SIZE].fill(0);

    pe.data.extend_from_slice(data);
    let raw_end = section.pointer_to_raw_data as usize + section.size_of_raw_data as usize;
    if pe.data.len() < raw_end {
        pe.data.resize(raw_end, 0);
    }

    pe.sections.push(section);
    pe.coff_header.number_of_sections = section_count;

    debug!(
        "appended section {} at raw 0x{:X} (0x{:X} bytes), rva 0x{:08X}",
        section.name_str(),
        section.pointer_to_raw_data,
        section.size_of_raw_data,
        section.virtual_address
    );
    Ok(())
}

/// Change the entry point RVA of the PE.
pub fn set_entry_point(pe: &mut PeFile, rva: u32) {
    pe.optional_header.entry_point = rva;
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
