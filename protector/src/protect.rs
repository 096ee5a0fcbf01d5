use exe::{
    Arch, Buffer, ImageDirectoryEntry, ImageSectionHeader, Offset, PETranslation,
    SectionCharacteristics, VecPE, PE, RVA,
};
use iced_x86::Instruction;
use logger::{debug, info};
use rand::Rng;

use crate::disasm::{DisassemblyEngine, DisassemblyVisitor};
use crate::error::ProtectError;
use crate::fixup::{apply_fixups, Fixup, FixupOperation, FixupOrigin};
use crate::pe;
use crate::pe::section::Section;
use crate::reloc;
use crate::virt::{ShellcodeVar, Virtualizer};
use crate::{
    BITNESS, VM_CODE_SECTION_NAME, VM_FUNCTIONS_SECTION_NAME, VM_INTERPRETER_EXPORT,
    VM_LOADER_SECTION_NAME, WORD_SIZE,
};

const JMP_INSTRUCTION_SIZE: u64 = 5;
const CALL_INSTRUCTION_SIZE: u64 = 5;

/// Everything the protection run accumulates before the new image can be
/// assembled: the two sections under construction, the patched text, and the
/// deferred fixup and relocation lists.
pub struct ProtectorContext {
    pub(crate) vm_loader_section: Section,
    pub(crate) virtualized_code_section: Section,
    pub(crate) new_text: Vec<u8>,
    pub(crate) fixups: Vec<Fixup>,
    pub(crate) vm_section_reloc_offsets: Vec<u64>,
    pub(crate) virtualized_code_reloc_offsets: Vec<u64>,
    pub(crate) relocation_rvas_to_remove: Vec<u64>,
}

struct ProtectVisitor<'a, V: Virtualizer> {
    virtualizer: &'a V,
    ctx: &'a mut ProtectorContext,
    text: ImageSectionHeader,
    original_text: &'a [u8],
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    interpreter_function_offset: u64,
    relocation_rvas: &'a [u64],
    disassembled: u32,
    virtualized: u32,
    rollbacks: u32,
}

impl<V: Virtualizer> DisassemblyVisitor for ProtectVisitor<'_, V> {
    fn on_instruction(&mut self, instruction: &Instruction) -> Result<(), ProtectError> {
        self.disassembled += 1;

        let Some(opcode) = self.virtualizer.classify(instruction) else {
            return Ok(());
        };
        if !self.virtualizer.is_virtualizable(instruction, opcode) {
            return Ok(());
        }
        if instruction.rflags_modified() != 0 {
            return Err(ProtectError::UnsupportedInstruction {
                rva: instruction.ip(),
            });
        }
        if (instruction.len() as u64) < JMP_INSTRUCTION_SIZE {
            return Ok(());
        }

        let relocations = relocations_within_instruction(
            self.relocation_rvas,
            instruction.ip(),
            instruction.len(),
        );

        let mut rng = rand::thread_rng();
        let encryption_key: u32 = rng.gen_range(1000..=10_000_000);

        let vm_bytes =
            self.virtualizer
                .build_vm_bytes(instruction, opcode, encryption_key, &relocations);
        if vm_bytes.is_empty() {
            return Ok(());
        }

        let vm_code_offset = self.ctx.virtualized_code_section.append_code(
            &vm_bytes,
            self.section_alignment,
            self.file_alignment,
        );

        let mut loader =
            self.virtualizer
                .build_loader_template(instruction, opcode, self.image_base);
        loader.patch32(ShellcodeVar::VmOpcodeEncryptionKey, encryption_key);
        loader.patch_ptr(ShellcodeVar::VmCodeAddr, vm_code_offset);

        let loader_offset = self.ctx.vm_loader_section.current_offset() as u64;

        // call into the interpreter: a same-section displacement, needs no fixup
        let core_offset = loader.offset_of(ShellcodeVar::VmCoreFunction) as u64;
        loader.patch32(
            ShellcodeVar::VmCoreFunction,
            self.interpreter_function_offset
                .wrapping_sub(loader_offset)
                .wrapping_sub(CALL_INSTRUCTION_SIZE)
                .wrapping_sub(core_offset)
                .wrapping_add(1) as u32,
        );

        // jump back behind the replaced instruction; made self-relative once
        // the SubtractVmLoaderVa fixup runs
        let orig_offset = loader.offset_of(ShellcodeVar::OrigAddr) as u64;
        let destination = instruction.ip().wrapping_add(instruction.len() as u64) as u32;
        let origin = (loader_offset + orig_offset) as u32;
        loader.patch32(
            ShellcodeVar::OrigAddr,
            destination
                .wrapping_sub(origin)
                .wrapping_sub(JMP_INSTRUCTION_SIZE as u32)
                .wrapping_add(1),
        );

        let loader_offset = self.ctx.vm_loader_section.append_code(
            loader.bytes(),
            self.section_alignment,
            self.file_alignment,
        );

        self.ctx.fixups.push(Fixup {
            offset: loader_offset + orig_offset,
            origin: FixupOrigin::VmLoaderSection,
            operation: FixupOperation::SubtractVmLoaderVa,
            width: 4,
        });
        self.ctx.fixups.push(Fixup {
            offset: loader_offset + loader.offset_of(ShellcodeVar::VmCodeAddr) as u64,
            origin: FixupOrigin::VmLoaderSection,
            operation: FixupOperation::AddVirtualizedCodeVa,
            width: 4,
        });
        // the image base argument is rebased by the OS loader
        self.ctx
            .vm_section_reloc_offsets
            .push(loader_offset + loader.offset_of(ShellcodeVar::ImageBase) as u64);

        // replace the instruction with junk bytes and a jump into the stub
        let text_offset = pe::rva_to_section_offset(&self.text, instruction.ip()) as usize;
        let window = &mut self.ctx.new_text[text_offset..text_offset + instruction.len()];
        rng.fill(window);
        window[0] = 0xE9;
        let jmp_destination = (loader_offset as u32)
            .wrapping_sub(instruction.ip() as u32)
            .wrapping_sub(JMP_INSTRUCTION_SIZE as u32);
        window[1..5].copy_from_slice(&jmp_destination.to_le_bytes());

        self.ctx.fixups.push(Fixup {
            offset: (text_offset + 1) as u64,
            origin: FixupOrigin::TextSection,
            operation: FixupOperation::AddVmLoaderVa,
            width: 4,
        });

        // the OS loader no longer may rebase bytes we now own
        self.ctx
            .relocation_rvas_to_remove
            .extend_from_slice(&relocations);

        self.virtualized += 1;
        debug!(
            "Virtualized 0x{:08X} ({:?})",
            instruction.ip(),
            instruction.mnemonic()
        );
        Ok(())
    }

    fn on_invalid_instruction(&mut self, rva: u64, size: usize) {
        let offset = pe::rva_to_section_offset(&self.text, rva) as usize;
        if offset + size > self.ctx.new_text.len() {
            return;
        }
        self.ctx.new_text[offset..offset + size]
            .copy_from_slice(&self.original_text[offset..offset + size]);

        // restore the relocations this instruction queued for removal
        for reloc_rva in relocations_within_instruction(self.relocation_rvas, rva, size) {
            if let Some(position) = self
                .ctx
                .relocation_rvas_to_remove
                .iter()
                .position(|&r| r == reloc_rva)
            {
                self.ctx.relocation_rvas_to_remove.remove(position);
            }
        }

        // and drop the pending .text patch over the restored bytes
        let (low, high) = (offset as u64, (offset + size) as u64);
        self.ctx.fixups.retain(|fixup| {
            !(fixup.origin == FixupOrigin::TextSection
                && fixup.offset >= low
                && fixup.offset < high)
        });

        self.rollbacks += 1;
        info!("Resetting invalid instruction at 0x{:08X}", rva);
    }
}

fn relocations_within_instruction(relocation_rvas: &[u64], address: u64, size: usize) -> Vec<u64> {
    let start = relocation_rvas.partition_point(|&rva| rva < address);
    relocation_rvas[start..]
        .iter()
        .take_while(|&&rva| rva < address + size as u64)
        .copied()
        .collect()
}

/// Runs the whole pipeline over an owned input image and returns the
/// protected one. Any error aborts the run; no partial output exists.
pub fn protect<V: Virtualizer>(
    original_pe: VecPE,
    interpreter_pe: VecPE,
    virtualizer: &V,
) -> Result<VecPE, ProtectError> {
    let mut pe = original_pe;
    let mut interpreter = interpreter_pe;

    let arch = pe.get_arch()?;
    if matches!(arch, Arch::X64) != (BITNESS == 64) {
        return Err(ProtectError::InputInvalid(format!(
            "the image is not {}-bit, use the matching protector build",
            BITNESS
        )));
    }
    if matches!(interpreter.get_arch()?, Arch::X64) != matches!(arch, Arch::X64) {
        return Err(ProtectError::InputInvalid(
            "interpreter bitness does not match the target".into(),
        ));
    }

    info!(
        "Loaded {}-bit binary ({:.2} MB)",
        BITNESS,
        pe.len() as f64 / 1_000_000.0
    );

    let image_base = pe.get_image_base()?;
    let (section_alignment, file_alignment) = pe::alignments(&pe)?;

    let interpreter_function_offset =
        pe::exported_function_section_offset(&interpreter, VM_INTERPRETER_EXPORT)? as u64;
    let vm_fun_section = pe::section_by_name(&interpreter, VM_FUNCTIONS_SECTION_NAME)
        .ok_or_else(|| {
            ProtectError::InputInvalid(format!(
                "interpreter has no {} section",
                VM_FUNCTIONS_SECTION_NAME
            ))
        })?;

    // Rebase the interpreter onto the target image and strip the vm section
    // VA; the remaining delta is applied by fixups once sections are placed.
    let delta = image_base as i64
        - interpreter.get_image_base()? as i64
        - vm_fun_section.virtual_address.0 as i64;
    reloc::relocate_by_delta(&mut interpreter, delta)?;

    let mut ctx = ProtectorContext {
        vm_loader_section: Section::new(
            VM_LOADER_SECTION_NAME,
            SectionCharacteristics::MEM_EXECUTE
                | SectionCharacteristics::MEM_READ
                | SectionCharacteristics::MEM_DISCARDABLE,
        ),
        virtualized_code_section: Section::new(
            VM_CODE_SECTION_NAME,
            SectionCharacteristics::MEM_READ
                | SectionCharacteristics::MEM_DISCARDABLE
                | SectionCharacteristics::MEM_EXECUTE
                | SectionCharacteristics::MEM_WRITE,
        ),
        new_text: Vec::new(),
        fixups: Vec::new(),
        vm_section_reloc_offsets: Vec::new(),
        virtualized_code_reloc_offsets: Vec::new(),
        relocation_rvas_to_remove: Vec::new(),
    };

    // seed the loader section with the interpreter's vm function code
    let vm_fun_data = interpreter
        .get_slice_ref::<u8>(
            vm_fun_section.pointer_to_raw_data.0 as usize,
            vm_fun_section.size_of_raw_data as usize,
        )?
        .to_vec();
    ctx.vm_loader_section
        .append_code(&vm_fun_data, section_alignment, file_alignment);

    #[cfg(feature = "tls")]
    crate::tls::add_tls_callbacks(&interpreter, &mut pe, &mut ctx, section_alignment, file_alignment)?;

    let text = pe::section_by_name(&pe, ".text")
        .ok_or_else(|| ProtectError::InputInvalid(".text section not found".into()))?;
    let original_text = pe
        .get_slice_ref::<u8>(
            text.pointer_to_raw_data.0 as usize,
            text.size_of_raw_data as usize,
        )?
        .to_vec();
    ctx.new_text = original_text.clone();

    // every relocated word in the interpreter's vm section needs a fixup and
    // a fresh relocation entry in the output
    for offset in reloc::section_relocation_offsets(&interpreter, &vm_fun_section)? {
        ctx.vm_section_reloc_offsets.push(offset);
        ctx.fixups.push(Fixup {
            offset,
            origin: FixupOrigin::VmLoaderSection,
            operation: FixupOperation::AddVmLoaderVa,
            width: 4,
        });
    }

    let relocation_rvas = reloc::relocation_rvas(&pe)?;

    let mut engine = DisassemblyEngine::new(&pe)?;
    let mut visitor = ProtectVisitor {
        virtualizer,
        ctx: &mut ctx,
        text,
        original_text: &original_text,
        image_base,
        section_alignment,
        file_alignment,
        interpreter_function_offset,
        relocation_rvas: &relocation_rvas,
        disassembled: 0,
        virtualized: 0,
        rollbacks: 0,
    };
    engine.run(&mut visitor)?;

    let (disassembled, virtualized, rollbacks) =
        (visitor.disassembled, visitor.virtualized, visitor.rollbacks);
    info!(
        "Disassembled {} instructions, virtualized {} ({} rolled back)",
        disassembled, virtualized, rollbacks
    );

    // Removal happens before assembly, while entry RVAs still mean what the
    // remove list recorded.
    reloc::remove_relocations(&mut pe, &ctx.relocation_rvas_to_remove)?;

    let mut new_pe = assemble_new_pe(pe, &text, &mut ctx, section_alignment, file_alignment)?;

    apply_fixups(&mut new_pe, &text, &ctx.fixups)?;

    nullify_directory(&mut new_pe, ImageDirectoryEntry::LoadConfig)?;
    nullify_directory(&mut new_pe, ImageDirectoryEntry::Debug)?;

    info!(
        "Rebuilt {}-bit binary ({:.2} MB)",
        BITNESS,
        new_pe.len() as f64 / 1_000_000.0
    );
    Ok(new_pe)
}

/// Clones the original layout, swaps the patched text in, rebuilds `.reloc`
/// and appends the two new sections.
fn assemble_new_pe(
    pe: VecPE,
    text: &ImageSectionHeader,
    ctx: &mut ProtectorContext,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<VecPE, ProtectError> {
    let mut pe = pe;

    // the header must have room for two more section headers
    let layout = pe::header_layout(&pe)?;
    if layout.section_table_offset() + (layout.number_of_sections + 2) * 40 > layout.size_of_headers
    {
        return Err(ProtectError::InputInvalid(
            "headers have no room for two extra sections".into(),
        ));
    }

    // swap the patched text in; the size must not have changed
    if ctx.new_text.len() != text.size_of_raw_data as usize {
        return Err(ProtectError::InternalInvariant(
            ".text size changed during patching".into(),
        ));
    }
    pe::write_bytes(&mut pe, text.pointer_to_raw_data.0 as usize, &ctx.new_text)?;

    // .reloc must be the last section so it can grow
    let sections = pe.get_section_table()?.to_vec();
    let reloc_header = *sections
        .last()
        .ok_or_else(|| ProtectError::InputInvalid("image has no sections".into()))?;
    if pe::section_name(&reloc_header) != ".reloc" {
        return Err(ProtectError::InternalInvariant(
            ".reloc is not the last section".into(),
        ));
    }

    let reloc_dir = pe.get_data_directory(ImageDirectoryEntry::BaseReloc)?;
    let (reloc_dir_va, mut reloc_dir_size) = (reloc_dir.virtual_address.0 as u64, reloc_dir.size);
    if reloc_dir_size == 0 {
        return Err(ProtectError::InputInvalid(
            "input image has no base relocations".into(),
        ));
    }

    // live relocation data without the file-alignment padding
    let keep = (reloc_dir_va - reloc_header.virtual_address.0 as u64) as usize
        + reloc_dir_size as usize;
    let reloc_raw_start = reloc_header.pointer_to_raw_data.0 as usize;
    let reloc_data = pe.get_slice_ref::<u8>(reloc_raw_start, keep)?.to_vec();
    let mut reloc_section = Section::from_header(&reloc_header, reloc_data);

    ctx.vm_section_reloc_offsets.sort_unstable();
    ctx.virtualized_code_reloc_offsets.sort_unstable();

    reloc::add_relocations(
        &ctx.vm_section_reloc_offsets,
        FixupOperation::AddVmLoaderVa,
        4,
        section_alignment,
        file_alignment,
        &mut reloc_section,
        &mut reloc_dir_size,
        &mut ctx.fixups,
    )?;
    reloc::add_relocations(
        &ctx.virtualized_code_reloc_offsets,
        FixupOperation::AddVirtualizedCodeVa,
        WORD_SIZE as u8,
        section_alignment,
        file_alignment,
        &mut reloc_section,
        &mut reloc_dir_size,
        &mut ctx.fixups,
    )?;

    // rebuild the file tail: trimmed reloc data plus the new blocks
    let mut buffer = pe.to_vec();
    buffer.truncate(reloc_raw_start);
    let mut new_pe = VecPE::from_disk_data(&buffer);
    new_pe.append(reloc_section.data());
    new_pe.pad_to_alignment()?;

    let reloc_index = sections.len() - 1;
    {
        let table = new_pe.get_mut_section_table()?;
        table[reloc_index].virtual_size = reloc_section.data().len() as u32;
        table[reloc_index].size_of_raw_data =
            pe::align_up(reloc_section.data().len() as u64, file_alignment as u64) as u32;
    }
    let reloc_entry_offset = pe::data_directory_offset(&new_pe, ImageDirectoryEntry::BaseReloc)?;
    pe::write_bytes(
        &mut new_pe,
        reloc_entry_offset + 4,
        &reloc_dir_size.to_le_bytes(),
    )?;

    let vm_loader_header = append_owned_section(&mut new_pe, &ctx.vm_loader_section)?;
    append_owned_section(&mut new_pe, &ctx.virtualized_code_section)?;

    new_pe.fix_image_size()?;

    // every .text patch must reach the loader with a 32-bit displacement
    let loader_end =
        vm_loader_header.virtual_address.0 as u64 + vm_loader_header.virtual_size as u64;
    if loader_end >= 0x8000_0000 {
        return Err(ProtectError::InputInvalid(
            "vm loader section is beyond 32-bit displacement reach".into(),
        ));
    }

    Ok(new_pe)
}

fn append_owned_section(
    pe: &mut VecPE,
    section: &Section,
) -> Result<ImageSectionHeader, ProtectError> {
    let characteristics = section.header().characteristics;
    let name = section.name();
    let size = section.data().len() as u32;

    let virtual_size = pe.align_to_section(RVA(size))?.0;
    let raw_size = pe.align_to_file(Offset(size))?.0;

    pe.append_section(&ImageSectionHeader::default())?;
    let header = pe
        .get_mut_section_table()?
        .last_mut()
        .ok_or_else(|| ProtectError::InternalInvariant("appended section missing from table".into()))?;
    header.set_name(Some(&name));
    header.virtual_size = virtual_size;
    header.size_of_raw_data = raw_size;
    header.characteristics = characteristics;
    let header = *header;

    pe.append(section.data());
    pe.pad_to_alignment()?;
    pe.fix_image_size()?;

    info!("Appended section '{}' ({} bytes)", name, size);
    Ok(header)
}

/// Wipes a data directory's bytes and clears its entry.
fn nullify_directory(pe: &mut VecPE, entry: ImageDirectoryEntry) -> Result<(), ProtectError> {
    let dir = pe.get_data_directory(entry)?;
    let (dir_va, dir_size) = (dir.virtual_address, dir.size);
    if dir_va.0 != 0 && dir_size != 0 {
        if let Ok(offset) = pe.translate(PETranslation::Memory(dir_va)) {
            if let Ok(bytes) = pe.get_mut_slice_ref::<u8>(offset, dir_size as usize) {
                bytes.fill(0);
            }
        }
    }
    let entry_offset = pe::data_directory_offset(pe, entry)?;
    pe::write_bytes(pe, entry_offset, &[0u8; 8])
}
