use exe::{ImageDirectoryEntry, ImageSectionHeader, PETranslation, VecPE, PE, RVA};

use crate::error::ProtectError;
use crate::fixup::{Fixup, FixupOperation, FixupOrigin};
use crate::pe;
use crate::pe::section::Section;

pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

#[cfg(feature = "x86")]
const NEW_RELOC_TYPE: u8 = IMAGE_REL_BASED_HIGHLOW;
#[cfg(not(feature = "x86"))]
const NEW_RELOC_TYPE: u8 = IMAGE_REL_BASED_DIR64;

const PAGE_SIZE: u64 = 0x1000;

/// One base-relocation entry together with the file position of its 16-bit
/// wire record, so it can be rewritten in place.
pub struct RelocationEntry {
    pub rva: u64,
    pub entry_type: u8,
    pub file_offset: usize,
}

/// Walks every relocation block of the image.
pub fn relocation_entries(pe: &VecPE) -> Result<Vec<RelocationEntry>, ProtectError> {
    let Ok(dir) = pe.get_data_directory(ImageDirectoryEntry::BaseReloc) else {
        return Ok(Vec::new());
    };
    let (dir_va, dir_size) = (dir.virtual_address, dir.size);
    if dir_va.0 == 0 || dir_size == 0 {
        return Ok(Vec::new());
    }

    let base = pe.translate(PETranslation::Memory(dir_va))?;
    let end = base + dir_size as usize;
    let mut entries = Vec::new();

    let mut offset = base;
    while offset + 8 <= end {
        let block_va = pe::read_u32_at(pe, offset)? as u64;
        let block_size = pe::read_u32_at(pe, offset + 4)? as usize;
        if block_size < 8 {
            break;
        }
        let count = (block_size - 8) / 2;
        for index in 0..count {
            let entry_offset = offset + 8 + index * 2;
            if entry_offset + 2 > end {
                break;
            }
            let entry = pe::read_u16_at(pe, entry_offset)?;
            entries.push(RelocationEntry {
                rva: block_va + (entry & 0x0FFF) as u64,
                entry_type: (entry >> 12) as u8,
                file_offset: entry_offset,
            });
        }
        offset += block_size;
    }
    Ok(entries)
}

/// All non-padding relocation RVAs, sorted for binary search.
pub fn relocation_rvas(pe: &VecPE) -> Result<Vec<u64>, ProtectError> {
    let mut rvas = relocation_entries(pe)?
        .into_iter()
        .filter(|e| e.entry_type != IMAGE_REL_BASED_ABSOLUTE)
        .map(|e| e.rva)
        .collect::<Vec<u64>>();
    rvas.sort_unstable();
    Ok(rvas)
}

/// Offsets, relative to `section`, of every relocated location inside it.
pub fn section_relocation_offsets(
    pe: &VecPE,
    section: &ImageSectionHeader,
) -> Result<Vec<u64>, ProtectError> {
    Ok(relocation_entries(pe)?
        .into_iter()
        .filter(|e| {
            e.entry_type != IMAGE_REL_BASED_ABSOLUTE && pe::is_rva_within_section(section, e.rva)
        })
        .map(|e| pe::rva_to_section_offset(section, e.rva))
        .collect())
}

/// Rewrites the entries covering `rvas` as padding. The protector handles
/// those locations itself once the instruction is virtualized.
pub fn remove_relocations(pe: &mut VecPE, rvas: &[u64]) -> Result<(), ProtectError> {
    let entries = relocation_entries(pe)?;
    for entry in entries {
        if entry.entry_type != IMAGE_REL_BASED_ABSOLUTE && rvas.contains(&entry.rva) {
            pe::write_bytes(pe, entry.file_offset, &0u16.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Shifts every relocated word in the image by `delta`, the way the OS
/// loader would when rebasing.
pub fn relocate_by_delta(pe: &mut VecPE, delta: i64) -> Result<(), ProtectError> {
    let entries = relocation_entries(pe)?;
    for entry in entries {
        let Ok(offset) = pe.translate(PETranslation::Memory(RVA(entry.rva as u32))) else {
            continue;
        };
        match entry.entry_type {
            IMAGE_REL_BASED_HIGHLOW => {
                let value = pe::read_u32_at(pe, offset)?;
                pe::write_bytes(pe, offset, &value.wrapping_add(delta as u32).to_le_bytes())?;
            }
            IMAGE_REL_BASED_DIR64 => {
                let value = pe::read_u64_at(pe, offset)?;
                pe::write_bytes(pe, offset, &value.wrapping_add(delta as u64).to_le_bytes())?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Appends relocation blocks covering `offsets` (ascending, relative to the
/// section the fixup operation names) to the `.reloc` section. Every flushed
/// block records a fixup that later rebases its header VA onto the target
/// section, and grows the relocation directory size.
#[allow(clippy::too_many_arguments)]
pub fn add_relocations(
    offsets: &[u64],
    operation: FixupOperation,
    width: u8,
    section_alignment: u32,
    file_alignment: u32,
    reloc_section: &mut Section,
    reloc_directory_size: &mut u32,
    fixups: &mut Vec<Fixup>,
) -> Result<(), ProtectError> {
    if offsets.is_empty() {
        return Ok(());
    }
    if reloc_section.name() != ".reloc" {
        return Err(ProtectError::InternalInvariant(
            "relocations must be appended to .reloc".into(),
        ));
    }

    let mut block_va = pe::align_down(offsets[0], PAGE_SIZE);
    let mut pending: Vec<u16> = Vec::new();

    for &offset in offsets {
        if offset - block_va >= PAGE_SIZE {
            flush_block(
                block_va,
                &mut pending,
                operation,
                width,
                section_alignment,
                file_alignment,
                reloc_section,
                reloc_directory_size,
                fixups,
            );
            block_va = pe::align_down(offset, PAGE_SIZE);
        }
        let delta = (offset - block_va) as u16;
        pending.push(((NEW_RELOC_TYPE as u16) << 12) | delta);
    }

    if !pending.is_empty() {
        flush_block(
            block_va,
            &mut pending,
            operation,
            width,
            section_alignment,
            file_alignment,
            reloc_section,
            reloc_directory_size,
            fixups,
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn flush_block(
    block_va: u64,
    pending: &mut Vec<u16>,
    operation: FixupOperation,
    width: u8,
    section_alignment: u32,
    file_alignment: u32,
    reloc_section: &mut Section,
    reloc_directory_size: &mut u32,
    fixups: &mut Vec<Fixup>,
) {
    // the block size must stay 4-byte aligned
    if pending.len() % 2 != 0 {
        pending.push(0);
    }

    let mut bytes = Vec::with_capacity(8 + pending.len() * 2);
    bytes.extend_from_slice(&(block_va as u32).to_le_bytes());
    bytes.extend_from_slice(&((8 + pending.len() * 2) as u32).to_le_bytes());
    for entry in pending.iter() {
        bytes.extend_from_slice(&entry.to_le_bytes());
    }

    let destination = reloc_section.append_code(&bytes, section_alignment, file_alignment);
    *reloc_directory_size += bytes.len() as u32;

    // the header VA is a section offset until the target section is placed
    fixups.push(Fixup {
        offset: destination,
        origin: FixupOrigin::RelocSection,
        operation,
        width,
    });
    pending.clear();
}
