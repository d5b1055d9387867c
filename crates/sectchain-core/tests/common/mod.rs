//! Hand-assembled PE32+ images for integration tests.

#![allow(dead_code)]

pub const PE_OFFSET: usize = 0x80;
pub const OPT_OFFSET: usize = PE_OFFSET + 24;
pub const TABLE_OFFSET: usize = OPT_OFFSET + 240;

fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn get32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

/// (name, virtual_address, virtual_size, raw_offset, raw_size)
pub type Section = (&'static str, u32, u32, u32, u32);

pub struct Image {
    pub entry: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_headers: u32,
    pub size_of_image: u32,
    pub sections: Vec<Section>,
    /// Total file length; bytes past the last section are filled with 0xEE.
    pub file_len: usize,
}

impl Image {
    /// One `.text` section at RVA 0x1000 with 0x2000 bytes, file alignment
    /// 0x200, total length 0x4000 with an overlay after the section.
    pub fn host() -> Image {
        Image {
            entry: 0x1500,
            image_base: 0x1000_0000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_headers: 0x400,
            size_of_image: 0x3000,
            sections: vec![(".text", 0x1000, 0x2000, 0x400, 0x2000)],
            file_len: 0x4000,
        }
    }

    /// A payload whose serialized size is exactly 0x500 bytes.
    pub fn payload() -> Image {
        Image {
            entry: 0x240,
            image_base: 0x3000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_headers: 0x200,
            size_of_image: 0x2000,
            sections: vec![(".text", 0x1000, 0x2F0, 0x200, 0x300)],
            file_len: 0x500,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.file_len];
        put16(&mut buf, 0, 0x5A4D);
        put32(&mut buf, 0x3C, PE_OFFSET as u32);
        put32(&mut buf, PE_OFFSET, 0x4550);
        put16(&mut buf, PE_OFFSET + 4, 0x8664);
        put16(&mut buf, PE_OFFSET + 6, self.sections.len() as u16);
        put16(&mut buf, PE_OFFSET + 20, 240);
        put16(&mut buf, PE_OFFSET + 22, 0x0022);

        put16(&mut buf, OPT_OFFSET, 0x020B);
        put32(&mut buf, OPT_OFFSET + 16, self.entry);
        buf[OPT_OFFSET + 24..OPT_OFFSET + 32].copy_from_slice(&self.image_base.to_le_bytes());
        put32(&mut buf, OPT_OFFSET + 32, self.section_alignment);
        put32(&mut buf, OPT_OFFSET + 36, self.file_alignment);
        put32(&mut buf, OPT_OFFSET + 56, self.size_of_image);
        put32(&mut buf, OPT_OFFSET + 60, self.size_of_headers);
        put32(&mut buf, OPT_OFFSET + 108, 16);

        let mut raw_end = self.size_of_headers as usize;
        for (i, &(name, va, vsize, raw, rsize)) in self.sections.iter().enumerate() {
            let base = TABLE_OFFSET + i * 40;
            buf[base..base + name.len()].copy_from_slice(name.as_bytes());
            put32(&mut buf, base + 8, vsize);
            put32(&mut buf, base + 12, va);
            put32(&mut buf, base + 16, rsize);
            put32(&mut buf, base + 20, raw);
            put32(&mut buf, base + 36, 0x6000_0020);
            for (j, b) in buf[raw as usize..(raw + rsize) as usize].iter_mut().enumerate() {
                *b = (j % 251) as u8;
            }
            raw_end = raw_end.max((raw + rsize) as usize);
        }
        for b in &mut buf[raw_end..] {
            *b = 0xEE;
        }
        buf
    }
}
