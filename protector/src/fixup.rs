use exe::{ImageSectionHeader, PETranslation, VecPE, PE, RVA};

use crate::error::ProtectError;
use crate::pe;
use crate::{VM_CODE_SECTION_NAME, VM_LOADER_SECTION_NAME};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FixupOperation {
    AddVmLoaderVa,
    AddVirtualizedCodeVa,
    SubtractVmLoaderVa,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FixupOrigin {
    VmLoaderSection,
    TextSection,
    RelocSection,
    VirtualizedCodeSection,
    Beginning,
}

/// A deferred in-place arithmetic patch. The byte window it names is only
/// touched once the final section virtual addresses are known.
#[derive(Copy, Clone, Debug)]
pub struct Fixup {
    pub offset: u64,
    pub origin: FixupOrigin,
    pub operation: FixupOperation,
    pub width: u8,
}

/// Resolves every fixup against the assembled image and applies it. Fixups
/// touch independent byte windows, so application order does not matter.
pub fn apply_fixups(
    pe: &mut VecPE,
    text: &ImageSectionHeader,
    fixups: &[Fixup],
) -> Result<(), ProtectError> {
    let vm_loader = pe::section_by_name(pe, VM_LOADER_SECTION_NAME).ok_or_else(|| {
        ProtectError::InternalInvariant("vm loader section missing from the new image".into())
    })?;
    let vm_code = pe::section_by_name(pe, VM_CODE_SECTION_NAME).ok_or_else(|| {
        ProtectError::InternalInvariant("virtualized code section missing from the new image".into())
    })?;
    let reloc = pe::section_by_name(pe, ".reloc").ok_or_else(|| {
        ProtectError::InternalInvariant(".reloc section missing from the new image".into())
    })?;

    let vm_loader_va = vm_loader.virtual_address.0 as u64;
    let vm_code_va = vm_code.virtual_address.0 as u64;

    for fixup in fixups {
        let file_offset = match fixup.origin {
            FixupOrigin::Beginning => fixup.offset as usize,
            origin => {
                let section = match origin {
                    FixupOrigin::VmLoaderSection => &vm_loader,
                    FixupOrigin::TextSection => text,
                    FixupOrigin::RelocSection => &reloc,
                    FixupOrigin::VirtualizedCodeSection => &vm_code,
                    FixupOrigin::Beginning => unreachable!(),
                };
                let rva = pe::section_offset_to_rva(section, fixup.offset);
                pe.translate(PETranslation::Memory(RVA(rva as u32)))?
            }
        };

        match fixup.width {
            4 => {
                let value = pe::read_u32_at(pe, file_offset)?;
                let patched = match fixup.operation {
                    FixupOperation::AddVmLoaderVa => value.wrapping_add(vm_loader_va as u32),
                    FixupOperation::AddVirtualizedCodeVa => value.wrapping_add(vm_code_va as u32),
                    FixupOperation::SubtractVmLoaderVa => value.wrapping_sub(vm_loader_va as u32),
                };
                pe::write_bytes(pe, file_offset, &patched.to_le_bytes())?;
            }
            8 => {
                let value = pe::read_u64_at(pe, file_offset)?;
                let patched = match fixup.operation {
                    FixupOperation::AddVmLoaderVa => value.wrapping_add(vm_loader_va),
                    FixupOperation::AddVirtualizedCodeVa => value.wrapping_add(vm_code_va),
                    FixupOperation::SubtractVmLoaderVa => value.wrapping_sub(vm_loader_va),
                };
                pe::write_bytes(pe, file_offset, &patched.to_le_bytes())?;
            }
            width => return Err(ProtectError::FixupError(width)),
        }
    }
    Ok(())
}
