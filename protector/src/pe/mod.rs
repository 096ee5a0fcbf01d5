pub mod section;

use exe::{Buffer, ImageDirectoryEntry, ImageSectionHeader, NTHeaders, PETranslation, VecPE, PE, RVA};

use crate::error::ProtectError;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

pub fn section_name(section: &ImageSectionHeader) -> String {
    let bytes = section.name.iter().map(|c| c.0).collect::<Vec<u8>>();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches('\0')
        .to_string()
}

pub fn section_by_name(pe: &VecPE, name: &str) -> Option<ImageSectionHeader> {
    let sections = pe.get_section_table().ok()?;
    sections.iter().find(|s| section_name(s) == name).copied()
}

pub fn is_rva_within_section(section: &ImageSectionHeader, rva: u64) -> bool {
    let begin = section.virtual_address.0 as u64;
    let size = if section.virtual_size != 0 {
        section.virtual_size
    } else {
        section.size_of_raw_data
    } as u64;
    rva >= begin && rva < begin + size
}

pub fn rva_to_section_offset(section: &ImageSectionHeader, rva: u64) -> u64 {
    rva - section.virtual_address.0 as u64
}

pub fn section_offset_to_rva(section: &ImageSectionHeader, offset: u64) -> u64 {
    section.virtual_address.0 as u64 + offset
}

pub fn section_from_rva<'a>(
    sections: &'a [ImageSectionHeader],
    rva: u64,
) -> Option<&'a ImageSectionHeader> {
    sections.iter().find(|s| is_rva_within_section(s, rva))
}

/// RVA to file offset over copied section headers. Undefined (`None`) for
/// RVAs outside every section's raw data.
pub fn rva_to_file_offset(sections: &[ImageSectionHeader], rva: u64) -> Option<usize> {
    let section = section_from_rva(sections, rva)?;
    let delta = rva - section.virtual_address.0 as u64;
    if delta >= section.size_of_raw_data as u64 {
        return None;
    }
    Some(section.pointer_to_raw_data.0 as usize + delta as usize)
}

pub fn alignments(pe: &VecPE) -> Result<(u32, u32), ProtectError> {
    Ok(match pe.get_valid_nt_headers()? {
        NTHeaders::NTHeaders32(h) => (
            h.optional_header.section_alignment,
            h.optional_header.file_alignment,
        ),
        NTHeaders::NTHeaders64(h) => (
            h.optional_header.section_alignment,
            h.optional_header.file_alignment,
        ),
    })
}

pub struct HeaderLayout {
    pub e_lfanew: usize,
    pub optional_header_size: usize,
    pub number_of_sections: usize,
    pub size_of_headers: usize,
}

impl HeaderLayout {
    pub fn section_table_offset(&self) -> usize {
        // signature + file header
        self.e_lfanew + 4 + 20 + self.optional_header_size
    }
}

pub fn header_layout(pe: &VecPE) -> Result<HeaderLayout, ProtectError> {
    let e_lfanew = pe.e_lfanew()?.0 as usize;
    let (optional_header_size, number_of_sections, size_of_headers) =
        match pe.get_valid_nt_headers()? {
            NTHeaders::NTHeaders32(h) => (
                h.file_header.size_of_optional_header as usize,
                h.file_header.number_of_sections as usize,
                h.optional_header.size_of_headers as usize,
            ),
            NTHeaders::NTHeaders64(h) => (
                h.file_header.size_of_optional_header as usize,
                h.file_header.number_of_sections as usize,
                h.optional_header.size_of_headers as usize,
            ),
        };
    Ok(HeaderLayout {
        e_lfanew,
        optional_header_size,
        number_of_sections,
        size_of_headers,
    })
}

/// File offset of a data directory entry inside the optional header.
pub fn data_directory_offset(pe: &VecPE, entry: ImageDirectoryEntry) -> Result<usize, ProtectError> {
    let optional_offset = pe.e_lfanew()?.0 as usize + 4 + 20;
    let magic = read_u16_at(pe, optional_offset)?;
    // PE32 keeps the directory table 96 bytes into the optional header, PE32+ 112
    let table_offset = optional_offset + if magic == 0x20B { 112 } else { 96 };
    Ok(table_offset + entry as usize * 8)
}

pub fn read_u16_at(pe: &VecPE, offset: usize) -> Result<u16, ProtectError> {
    let bytes = pe.get_slice_ref::<u8>(offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32_at(pe: &VecPE, offset: usize) -> Result<u32, ProtectError> {
    let bytes = pe.get_slice_ref::<u8>(offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_u64_at(pe: &VecPE, offset: usize) -> Result<u64, ProtectError> {
    let bytes = pe.get_slice_ref::<u8>(offset, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

/// Reads a pointer-sized little-endian value.
pub fn read_word_at(pe: &VecPE, offset: usize) -> Result<u64, ProtectError> {
    let bytes = pe.get_slice_ref::<u8>(offset, crate::WORD_SIZE)?;
    let mut buf = [0u8; 8];
    buf[..crate::WORD_SIZE].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

pub fn write_bytes(pe: &mut VecPE, offset: usize, bytes: &[u8]) -> Result<(), ProtectError> {
    pe.get_mut_slice_ref::<u8>(offset, bytes.len())?
        .copy_from_slice(bytes);
    Ok(())
}

#[repr(C, packed)]
struct ImageExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

fn read_cstring_at(pe: &VecPE, offset: usize) -> Result<String, ProtectError> {
    if offset >= pe.len() {
        return Err(ProtectError::InputInvalid(
            "string offset past the end of the image".into(),
        ));
    }
    let bytes = pe.get_slice_ref::<u8>(offset, pe.len() - offset)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).to_string())
}

/// Looks a function up in the export directory and returns its RVA.
pub fn export_rva(pe: &VecPE, function_name: &str) -> Result<u32, ProtectError> {
    let dir = pe.get_data_directory(ImageDirectoryEntry::Export)?;
    let (dir_va, dir_size) = (dir.virtual_address, dir.size);
    if dir_va.0 == 0 || dir_size == 0 {
        return Err(ProtectError::InputInvalid(format!(
            "no export directory while resolving {}",
            function_name
        )));
    }

    let offset = pe.translate(PETranslation::Memory(dir_va))?;
    let exports = &pe.get_slice_ref::<ImageExportDirectory>(offset, 1)?[0];
    let count = exports.number_of_names as usize;
    let names_offset = pe.translate(PETranslation::Memory(RVA(exports.address_of_names)))?;
    let ordinals_offset =
        pe.translate(PETranslation::Memory(RVA(exports.address_of_name_ordinals)))?;
    let functions_offset = pe.translate(PETranslation::Memory(RVA(exports.address_of_functions)))?;

    for index in 0..count {
        let name_rva = read_u32_at(pe, names_offset + index * 4)?;
        let name_offset = pe.translate(PETranslation::Memory(RVA(name_rva)))?;
        if read_cstring_at(pe, name_offset)? == function_name {
            let ordinal = read_u16_at(pe, ordinals_offset + index * 2)? as usize;
            return read_u32_at(pe, functions_offset + ordinal * 4);
        }
    }

    Err(ProtectError::InputInvalid(format!(
        "export {} not found",
        function_name
    )))
}

/// RVA of an export converted to an offset inside its containing section.
pub fn exported_function_section_offset(
    pe: &VecPE,
    function_name: &str,
) -> Result<u32, ProtectError> {
    let rva = export_rva(pe, function_name)?;
    let sections = pe.get_section_table()?;
    let section = section_from_rva(sections, rva as u64).ok_or_else(|| {
        ProtectError::InputInvalid(format!("export {} lies outside every section", function_name))
    })?;
    Ok(rva - section.virtual_address.0)
}
