use exe::{ImageDirectoryEntry, PETranslation, VecPE, PE, RVA};

use crate::error::ProtectError;
use crate::fixup::{Fixup, FixupOperation, FixupOrigin};
use crate::pe;
use crate::protect::ProtectorContext;
use crate::{DEFAULT_PE_BASE_ADDRESS, TLS_CALLBACK_EXPORT, WORD_SIZE};

const ADDRESS_OF_INDEX_OFFSET: usize = 2 * WORD_SIZE;
const ADDRESS_OF_CALLBACKS_OFFSET: usize = 3 * WORD_SIZE;
const TLS_DIRECTORY_SIZE: usize = 4 * WORD_SIZE + 8;

const IMAGE_SCN_ALIGN_1BYTES: u32 = 0x0010_0000;

/// Makes sure the output boots the interpreter before user code: the
/// interpreter's `TlsCallback` is appended to the image's callback list,
/// creating the TLS directory first when the input has none.
pub fn add_tls_callbacks(
    interpreter_pe: &VecPE,
    pe: &mut VecPE,
    ctx: &mut ProtectorContext,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<(), ProtectError> {
    let callback_offset =
        pe::exported_function_section_offset(interpreter_pe, TLS_CALLBACK_EXPORT)? as u64;

    let dir = pe.get_data_directory(ImageDirectoryEntry::TLS)?;
    let (dir_va, dir_size) = (dir.virtual_address, dir.size);

    if dir_size != 0 {
        extend_existing_directory(
            pe,
            ctx,
            dir_va,
            callback_offset,
            section_alignment,
            file_alignment,
        )
    } else {
        create_directory(pe, ctx, callback_offset, section_alignment, file_alignment)
    }
}

/// The input already carries a TLS directory: append our callback to a
/// relocated copy of its callback list and point the directory at it.
fn extend_existing_directory(
    pe: &mut VecPE,
    ctx: &mut ProtectorContext,
    dir_va: RVA,
    callback_offset: u64,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<(), ProtectError> {
    let image_base = pe.get_image_base()?;
    let tls_offset = pe.translate(PETranslation::Memory(dir_va))?;

    let mut callbacks = Vec::new();
    let callbacks_va = pe::read_word_at(pe, tls_offset + ADDRESS_OF_CALLBACKS_OFFSET)?;
    if callbacks_va != 0 {
        let list_rva = callbacks_va.wrapping_sub(image_base);
        let mut offset = pe.translate(PETranslation::Memory(RVA(list_rva as u32)))?;
        loop {
            let value = pe::read_word_at(pe, offset)?;
            if value == 0 {
                break;
            }
            callbacks.push(value);
            offset += WORD_SIZE;
        }
    }

    let list_offset = append_callback_list(
        ctx,
        callbacks,
        callback_offset,
        section_alignment,
        file_alignment,
    );

    // repoint the existing directory at the new list
    pe::write_bytes(
        pe,
        tls_offset + ADDRESS_OF_CALLBACKS_OFFSET,
        &(DEFAULT_PE_BASE_ADDRESS + list_offset).to_le_bytes()[..WORD_SIZE],
    )?;
    ctx.fixups.push(Fixup {
        offset: (tls_offset + ADDRESS_OF_CALLBACKS_OFFSET) as u64,
        origin: FixupOrigin::Beginning,
        operation: FixupOperation::AddVirtualizedCodeVa,
        width: WORD_SIZE as u8,
    });
    Ok(())
}

/// The input has no TLS directory: build one inside the virtualized-code
/// section, with an index slot, our callback list, and the directory record.
fn create_directory(
    pe: &mut VecPE,
    ctx: &mut ProtectorContext,
    callback_offset: u64,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<(), ProtectError> {
    // zeroed slot the loader writes the TLS index into
    let index_offset = ctx.virtualized_code_section.append_code(
        &vec![0u8; WORD_SIZE],
        section_alignment,
        file_alignment,
    );

    let list_offset = append_callback_list(
        ctx,
        Vec::new(),
        callback_offset,
        section_alignment,
        file_alignment,
    );

    let mut directory = Vec::with_capacity(TLS_DIRECTORY_SIZE);
    directory.extend_from_slice(&0u64.to_le_bytes()[..WORD_SIZE]); // raw data start
    directory.extend_from_slice(&0u64.to_le_bytes()[..WORD_SIZE]); // raw data end
    directory
        .extend_from_slice(&(DEFAULT_PE_BASE_ADDRESS + index_offset).to_le_bytes()[..WORD_SIZE]);
    directory
        .extend_from_slice(&(DEFAULT_PE_BASE_ADDRESS + list_offset).to_le_bytes()[..WORD_SIZE]);
    directory.extend_from_slice(&0u32.to_le_bytes()); // size of zero fill
    directory.extend_from_slice(&IMAGE_SCN_ALIGN_1BYTES.to_le_bytes());

    let directory_offset = ctx.virtualized_code_section.append_code(
        &directory,
        section_alignment,
        file_alignment,
    );

    // both pointer fields get a section-VA fixup and a loader-time relocation
    let index_field = directory_offset + ADDRESS_OF_INDEX_OFFSET as u64;
    ctx.fixups.push(Fixup {
        offset: index_field,
        origin: FixupOrigin::VirtualizedCodeSection,
        operation: FixupOperation::AddVirtualizedCodeVa,
        width: WORD_SIZE as u8,
    });
    ctx.virtualized_code_reloc_offsets.push(index_field);

    let callbacks_field = directory_offset + ADDRESS_OF_CALLBACKS_OFFSET as u64;
    ctx.fixups.push(Fixup {
        offset: callbacks_field,
        origin: FixupOrigin::VirtualizedCodeSection,
        operation: FixupOperation::AddVirtualizedCodeVa,
        width: WORD_SIZE as u8,
    });
    ctx.virtualized_code_reloc_offsets.push(callbacks_field);

    // publish the new directory in the optional header
    let entry_offset = pe::data_directory_offset(pe, ImageDirectoryEntry::TLS)?;
    pe::write_bytes(pe, entry_offset, &(directory_offset as u32).to_le_bytes())?;
    pe::write_bytes(
        pe,
        entry_offset + 4,
        &(TLS_DIRECTORY_SIZE as u32).to_le_bytes(),
    )?;
    ctx.fixups.push(Fixup {
        offset: entry_offset as u64,
        origin: FixupOrigin::Beginning,
        operation: FixupOperation::AddVirtualizedCodeVa,
        width: WORD_SIZE as u8,
    });
    Ok(())
}

/// Appends the callback list (existing callbacks, ours, then five zero
/// slots serving as terminator and spare room) to the virtualized-code
/// section. Every non-zero slot becomes a loader-time relocation; our own
/// slot additionally needs the VM loader section VA once that is known.
fn append_callback_list(
    ctx: &mut ProtectorContext,
    mut callbacks: Vec<u64>,
    callback_offset: u64,
    section_alignment: u32,
    file_alignment: u32,
) -> u64 {
    let own_index = callbacks.len();
    callbacks.push(DEFAULT_PE_BASE_ADDRESS + callback_offset);

    // room for callbacks added later, plus the list terminator
    callbacks.extend_from_slice(&[0; 5]);

    let mut bytes = Vec::with_capacity(callbacks.len() * WORD_SIZE);
    for value in &callbacks {
        bytes.extend_from_slice(&value.to_le_bytes()[..WORD_SIZE]);
    }
    let list_offset =
        ctx.virtualized_code_section
            .append_code(&bytes, section_alignment, file_alignment);

    for (index, value) in callbacks.iter().enumerate() {
        if *value != 0 {
            ctx.virtualized_code_reloc_offsets
                .push(list_offset + (index * WORD_SIZE) as u64);
        }
    }

    ctx.fixups.push(Fixup {
        offset: list_offset + (own_index * WORD_SIZE) as u64,
        origin: FixupOrigin::VirtualizedCodeSection,
        operation: FixupOperation::AddVmLoaderVa,
        width: WORD_SIZE as u8,
    });

    list_offset
}
