#[cfg(test)]
mod pe_builder;

#[cfg(test)]
mod tests {
    use exe::{Buffer, ImageDirectoryEntry, PETranslation, SectionCharacteristics, VecPE, PE, RVA};
    use iced_x86::Instruction;

    use protector::disasm::{AddressRange, DisassemblyEngine, DisassemblyVisitor};
    use protector::fixup::{apply_fixups, Fixup, FixupOperation, FixupOrigin};
    use protector::pe::{self, section::Section};
    use protector::reloc;
    use protector::virt::bytecode::BytecodeVirtualizer;
    use protector::virt::{ShellcodeVar, Virtualizer, VmOpcode};
    use protector::{
        protect, ProtectError, DEFAULT_PE_BASE_ADDRESS, VM_CODE_SECTION_NAME,
        VM_LOADER_SECTION_NAME, WORD_SIZE,
    };

    use crate::pe_builder::{
        self, PeSpec, SectionSpec, DATA_CHARACTERISTICS, DIR_BASERELOC, DIR_EXPORT, DIR_TLS,
        RELOC_CHARACTERISTICS, TEXT_CHARACTERISTICS,
    };

    // fixtures load at the preferred base the protector assumes
    const IMAGE_BASE: u64 = DEFAULT_PE_BASE_ADDRESS;
    const INTERPRETER_BASE: u64 = if cfg!(feature = "x86") {
        0x1000_0000
    } else {
        0x1_8000_0000
    };
    const RELOC_TYPE: u8 = if cfg!(feature = "x86") { 3 } else { 10 };

    #[derive(Default)]
    struct Collector {
        instructions: Vec<u64>,
        invalid: Vec<(u64, usize)>,
    }

    impl DisassemblyVisitor for Collector {
        fn on_instruction(&mut self, instruction: &Instruction) -> Result<(), ProtectError> {
            self.instructions.push(instruction.ip());
            Ok(())
        }

        fn on_invalid_instruction(&mut self, rva: u64, size: usize) {
            self.invalid.push((rva, size));
        }
    }

    fn put_word(data: &mut [u8], offset: usize, value: u64) {
        data[offset..offset + WORD_SIZE].copy_from_slice(&value.to_le_bytes()[..WORD_SIZE]);
    }

    fn read16(data: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    fn read32(data: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    /// Target image: `.text` at 0x1000 (also the entry point), `.rdata` at
    /// 0x2000, `.reloc` last at 0x3000.
    fn build_target(
        text: Vec<u8>,
        rdata: Vec<u8>,
        reloc_blocks: &[(u32, Vec<u16>)],
        extra_directories: Vec<(usize, u32, u32)>,
    ) -> VecPE {
        let reloc_data = pe_builder::reloc_section(reloc_blocks);
        let mut directories = Vec::new();
        if !reloc_data.is_empty() {
            directories.push((DIR_BASERELOC, 0x3000, reloc_data.len() as u32));
        }
        directories.extend(extra_directories);

        let spec = PeSpec {
            image_base: IMAGE_BASE,
            entry_point: 0x1000,
            dll: false,
            sections: vec![
                SectionSpec {
                    name: ".text",
                    virtual_address: 0x1000,
                    virtual_size: 0x1000,
                    data: text,
                    characteristics: TEXT_CHARACTERISTICS,
                },
                SectionSpec {
                    name: ".rdata",
                    virtual_address: 0x2000,
                    virtual_size: 0x1000,
                    data: rdata,
                    characteristics: DATA_CHARACTERISTICS,
                },
                SectionSpec {
                    name: ".reloc",
                    virtual_address: 0x3000,
                    virtual_size: 0x1000,
                    data: reloc_data,
                    characteristics: RELOC_CHARACTERISTICS,
                },
            ],
            directories,
        };
        VecPE::from_disk_data(&pe_builder::build_pe(&spec))
    }

    /// Interpreter DLL: `.vmfun` with a relocated pointer at +0x40,
    /// `VmInterpreter` exported at +0x10 and `TlsCallback` at +0x20.
    fn build_interpreter() -> VecPE {
        let mut vmfun = vec![0u8; 0x200];
        put_word(&mut vmfun, 0x40, INTERPRETER_BASE + 0x1000 + 0x100);

        let edata = pe_builder::export_section(
            0x2000,
            "Interpreter.dll",
            &[("VmInterpreter", 0x1010), ("TlsCallback", 0x1020)],
        );
        let edata_len = edata.len() as u32;
        let reloc =
            pe_builder::reloc_section(&[(0x1000, vec![((RELOC_TYPE as u16) << 12) | 0x40])]);
        let reloc_len = reloc.len() as u32;

        let spec = PeSpec {
            image_base: INTERPRETER_BASE,
            entry_point: 0x1000,
            dll: true,
            sections: vec![
                SectionSpec {
                    name: ".vmfun",
                    virtual_address: 0x1000,
                    virtual_size: 0x1000,
                    data: vmfun,
                    characteristics: TEXT_CHARACTERISTICS,
                },
                SectionSpec {
                    name: ".edata",
                    virtual_address: 0x2000,
                    virtual_size: 0x1000,
                    data: edata,
                    characteristics: DATA_CHARACTERISTICS,
                },
                SectionSpec {
                    name: ".reloc",
                    virtual_address: 0x3000,
                    virtual_size: 0x1000,
                    data: reloc,
                    characteristics: RELOC_CHARACTERISTICS,
                },
            ],
            directories: vec![
                (DIR_EXPORT, 0x2000, edata_len),
                (DIR_BASERELOC, 0x3000, reloc_len),
            ],
        };
        VecPE::from_disk_data(&pe_builder::build_pe(&spec))
    }

    /// mov rax, imm64 (relocated immediate) followed by ret.
    #[cfg(not(feature = "x86"))]
    fn mov_rax_imm_text() -> Vec<u8> {
        let mut text = vec![0u8; 0x200];
        text[0] = 0x48;
        text[1] = 0xB8;
        text[2..10].copy_from_slice(&(IMAGE_BASE + 0x1100).to_le_bytes());
        text[10] = 0xC3;
        text
    }

    fn assert_reloc_invariants(pe: &VecPE) {
        let dir = pe
            .get_data_directory(ImageDirectoryEntry::BaseReloc)
            .unwrap();
        let base = pe
            .translate(PETranslation::Memory(dir.virtual_address))
            .unwrap();
        let end = base + dir.size as usize;

        let mut offset = base;
        let mut previous_va: Option<u32> = None;
        while offset + 8 <= end {
            let va = pe::read_u32_at(pe, offset).unwrap();
            let size = pe::read_u32_at(pe, offset + 4).unwrap() as usize;
            assert!(size >= 8 && size % 4 == 0, "malformed block size {}", size);
            let count = (size - 8) / 2;
            assert_eq!(count % 2, 0, "odd entry count in block at 0x{:X}", va);
            if let Some(previous) = previous_va {
                assert!(va > previous, "blocks not ascending");
            }
            previous_va = Some(va);

            let mut previous_entry = 0u16;
            for index in 0..count {
                let entry = pe::read_u16_at(pe, offset + 8 + index * 2).unwrap();
                if entry >> 12 != 0 {
                    let entry_offset = entry & 0x0FFF;
                    assert!(entry_offset >= previous_entry, "entries not ascending");
                    previous_entry = entry_offset;
                }
            }
            offset += size;
        }
        assert_eq!(offset, end, "directory size does not cover whole blocks");
    }

    #[test]
    fn test_section_builder() {
        let mut section = Section::new(".vmldr", SectionCharacteristics::MEM_READ);
        assert_eq!(section.append_code(&[1, 2, 3], 0x1000, 0x200), 0);
        assert_eq!(section.current_offset(), 3);
        assert_eq!(section.header().virtual_size, 3);
        assert_eq!(section.header().size_of_raw_data, 0x200);

        assert_eq!(section.append_code(&[4, 5], 0x1000, 0x200), 3);
        assert_eq!(section.current_offset(), 5);

        section.overwrite(1, &[9]);
        assert_eq!(section.data()[1], 9);
        assert_eq!(section.name(), ".vmldr");
    }

    #[test]
    #[should_panic]
    fn test_section_overwrite_past_end() {
        let mut section = Section::new(".x", SectionCharacteristics::MEM_READ);
        section.append_code(&[0; 4], 0x1000, 0x200);
        section.overwrite(2, &[0; 4]);
    }

    #[test]
    fn test_relocation_block_layout() {
        let mut section = Section::new(
            ".reloc",
            SectionCharacteristics::MEM_READ | SectionCharacteristics::MEM_DISCARDABLE,
        );
        let mut directory_size = 0u32;
        let mut fixups = Vec::new();

        reloc::add_relocations(
            &[0x100, 0x500, 0x1010],
            FixupOperation::AddVmLoaderVa,
            4,
            0x1000,
            0x200,
            &mut section,
            &mut directory_size,
            &mut fixups,
        )
        .unwrap();

        let data = section.data();
        let entry_type = (RELOC_TYPE as u16) << 12;

        // first block: page 0, two entries, already 4-byte aligned
        assert_eq!(read32(data, 0), 0);
        assert_eq!(read32(data, 4), 12);
        assert_eq!(read16(data, 8), entry_type | 0x100);
        assert_eq!(read16(data, 10), entry_type | 0x500);

        // second block: page 0x1000, one entry plus one type-0 pad
        assert_eq!(read32(data, 12), 0x1000);
        assert_eq!(read32(data, 16), 12);
        assert_eq!(read16(data, 20), entry_type | 0x10);
        assert_eq!(read16(data, 22), 0);

        assert_eq!(directory_size, 24);
        assert_eq!(fixups.len(), 2);
        assert_eq!(fixups[0].offset, 0);
        assert_eq!(fixups[1].offset, 12);
        assert!(fixups.iter().all(|f| f.origin == FixupOrigin::RelocSection
            && f.operation == FixupOperation::AddVmLoaderVa));
    }

    #[test]
    fn test_relocations_to_wrong_section_rejected() {
        let mut section = Section::new(".data", SectionCharacteristics::MEM_READ);
        let mut directory_size = 0u32;
        let mut fixups = Vec::new();
        let result = reloc::add_relocations(
            &[0x100],
            FixupOperation::AddVmLoaderVa,
            4,
            0x1000,
            0x200,
            &mut section,
            &mut directory_size,
            &mut fixups,
        );
        assert!(matches!(result, Err(ProtectError::InternalInvariant(_))));
    }

    fn fixup_fixture() -> VecPE {
        let mut text = vec![0u8; 0x200];
        text[0x10..0x14].copy_from_slice(&0x1234u32.to_le_bytes());
        text[0x20..0x28].copy_from_slice(&0x999u64.to_le_bytes());
        text[0x30..0x38].copy_from_slice(&0x4321u64.to_le_bytes());
        put_word(&mut text, 0x2, IMAGE_BASE + 0x1100);

        let mut vmldr = vec![0u8; 0x200];
        vmldr[..4].copy_from_slice(&0x40u32.to_le_bytes());

        let reloc_data =
            pe_builder::reloc_section(&[(0x1000, vec![((RELOC_TYPE as u16) << 12) | 0x2])]);
        let reloc_len = reloc_data.len() as u32;

        let spec = PeSpec {
            image_base: IMAGE_BASE,
            entry_point: 0x1000,
            dll: false,
            sections: vec![
                SectionSpec {
                    name: ".text",
                    virtual_address: 0x1000,
                    virtual_size: 0x1000,
                    data: text,
                    characteristics: TEXT_CHARACTERISTICS,
                },
                SectionSpec {
                    name: VM_LOADER_SECTION_NAME,
                    virtual_address: 0x2000,
                    virtual_size: 0x1000,
                    data: vmldr,
                    characteristics: TEXT_CHARACTERISTICS,
                },
                SectionSpec {
                    name: VM_CODE_SECTION_NAME,
                    virtual_address: 0x3000,
                    virtual_size: 0x1000,
                    data: vec![0u8; 0x200],
                    characteristics: DATA_CHARACTERISTICS,
                },
                SectionSpec {
                    name: ".reloc",
                    virtual_address: 0x4000,
                    virtual_size: 0x1000,
                    data: reloc_data,
                    characteristics: RELOC_CHARACTERISTICS,
                },
            ],
            directories: vec![(DIR_BASERELOC, 0x4000, reloc_len)],
        };
        VecPE::from_disk_data(&pe_builder::build_pe(&spec))
    }

    #[test]
    fn test_fixup_operations() {
        let mut pe = fixup_fixture();
        let text = pe::section_by_name(&pe, ".text").unwrap();
        let text_offset = pe.translate(PETranslation::Memory(RVA(0x1000))).unwrap();

        apply_fixups(
            &mut pe,
            &text,
            &[
                Fixup {
                    offset: 0x10,
                    origin: FixupOrigin::TextSection,
                    operation: FixupOperation::AddVmLoaderVa,
                    width: 4,
                },
                Fixup {
                    offset: 0x20,
                    origin: FixupOrigin::TextSection,
                    operation: FixupOperation::AddVirtualizedCodeVa,
                    width: 8,
                },
                Fixup {
                    offset: 0x0,
                    origin: FixupOrigin::VmLoaderSection,
                    operation: FixupOperation::SubtractVmLoaderVa,
                    width: 4,
                },
                Fixup {
                    offset: (text_offset + 0x30) as u64,
                    origin: FixupOrigin::Beginning,
                    operation: FixupOperation::AddVmLoaderVa,
                    width: 8,
                },
            ],
        )
        .unwrap();

        assert_eq!(
            pe::read_u32_at(&pe, text_offset + 0x10).unwrap(),
            0x1234 + 0x2000
        );
        assert_eq!(
            pe::read_u64_at(&pe, text_offset + 0x20).unwrap(),
            0x999 + 0x3000
        );
        assert_eq!(
            pe::read_u64_at(&pe, text_offset + 0x30).unwrap(),
            0x4321 + 0x2000
        );

        let vmldr_offset = pe.translate(PETranslation::Memory(RVA(0x2000))).unwrap();
        assert_eq!(
            pe::read_u32_at(&pe, vmldr_offset).unwrap(),
            0x40u32.wrapping_sub(0x2000)
        );
    }

    #[test]
    fn test_fixup_unsupported_width() {
        let mut pe = fixup_fixture();
        let text = pe::section_by_name(&pe, ".text").unwrap();
        let result = apply_fixups(
            &mut pe,
            &text,
            &[Fixup {
                offset: 0x10,
                origin: FixupOrigin::TextSection,
                operation: FixupOperation::AddVmLoaderVa,
                width: 2,
            }],
        );
        assert!(matches!(result, Err(ProtectError::FixupError(2))));
    }

    #[test]
    fn test_fixup_empty_is_identity() {
        let mut pe = fixup_fixture();
        let text = pe::section_by_name(&pe, ".text").unwrap();
        let before = pe.to_vec();
        apply_fixups(&mut pe, &text, &[]).unwrap();
        assert_eq!(before, pe.to_vec());
    }

    #[test]
    fn test_remove_relocations() {
        let mut pe = fixup_fixture();
        assert_eq!(reloc::relocation_rvas(&pe).unwrap(), vec![0x1002]);
        reloc::remove_relocations(&mut pe, &[0x1002]).unwrap();
        assert!(reloc::relocation_rvas(&pe).unwrap().is_empty());
    }

    #[test]
    fn test_relocate_by_delta() {
        let mut pe = fixup_fixture();
        let text_offset = pe.translate(PETranslation::Memory(RVA(0x1000))).unwrap();
        reloc::relocate_by_delta(&mut pe, 0x10000).unwrap();
        assert_eq!(
            pe::read_word_at(&pe, text_offset + 0x2).unwrap(),
            IMAGE_BASE + 0x1100 + 0x10000
        );
    }

    #[test]
    fn test_export_lookup() {
        let interpreter = build_interpreter();
        assert_eq!(
            pe::export_rva(&interpreter, "VmInterpreter").unwrap(),
            0x1010
        );
        assert_eq!(
            pe::exported_function_section_offset(&interpreter, "TlsCallback").unwrap(),
            0x20
        );
        assert!(pe::export_rva(&interpreter, "NotExported").is_err());
    }

    #[test]
    fn test_loader_template_patch_sites() {
        let mut template = BytecodeVirtualizer.build_loader_template(
            &Instruction::default(),
            VmOpcode(0),
            IMAGE_BASE,
        );

        // E8/E9 sit immediately before their displacement fields
        assert_eq!(
            template.bytes()[template.offset_of(ShellcodeVar::VmCoreFunction) - 1],
            0xE8
        );
        assert_eq!(
            template.bytes()[template.offset_of(ShellcodeVar::OrigAddr) - 1],
            0xE9
        );

        // all five sites are distinct
        let mut offsets = vec![
            template.offset_of(ShellcodeVar::VmCodeAddr),
            template.offset_of(ShellcodeVar::OrigAddr),
            template.offset_of(ShellcodeVar::VmCoreFunction),
            template.offset_of(ShellcodeVar::ImageBase),
            template.offset_of(ShellcodeVar::VmOpcodeEncryptionKey),
        ];
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 5);

        // the image base is patched at template build time
        let offset = template.offset_of(ShellcodeVar::ImageBase);
        assert_eq!(
            &template.bytes()[offset..offset + WORD_SIZE],
            &IMAGE_BASE.to_le_bytes()[..WORD_SIZE]
        );

        template.patch32(ShellcodeVar::VmOpcodeEncryptionKey, 0xAABB_CCDD);
        let offset = template.offset_of(ShellcodeVar::VmOpcodeEncryptionKey);
        assert_eq!(
            &template.bytes()[offset..offset + 4],
            &0xAABB_CCDDu32.to_le_bytes()
        );
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_vm_bytes_keyed() {
        use iced_x86::{Code, Register};

        let mut instruction =
            Instruction::with2(Code::Mov_r64_imm64, Register::RAX, 0x1122_3344i64).unwrap();
        instruction.set_len(10);

        let virtualizer = BytecodeVirtualizer;
        let opcode = virtualizer.classify(&instruction).unwrap();
        assert!(virtualizer.is_virtualizable(&instruction, opcode));

        let first = virtualizer.build_vm_bytes(&instruction, opcode, 1000, &[]);
        let second = virtualizer.build_vm_bytes(&instruction, opcode, 2000, &[]);
        assert!(!first.is_empty());
        assert_eq!(first.len(), second.len());
        assert_ne!(first, second);
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_function_prologue_x64() {
        // mov [rsp+8], rcx ; mov [rsp+10h], rdx ; sub rsp, 28h
        let mut text = vec![0u8; 0x200];
        text[..14].copy_from_slice(&[
            0x48, 0x89, 0x4C, 0x24, 0x08, 0x48, 0x89, 0x54, 0x24, 0x10, 0x48, 0x83, 0xEC, 0x28,
        ]);
        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        let engine = DisassemblyEngine::new(&pe).unwrap();
        assert!(engine.is_function(0x1000));

        // no stack frame allocation follows, not a prologue
        let mut text = vec![0u8; 0x200];
        text[..5].copy_from_slice(&[0x48, 0x89, 0x4C, 0x24, 0x08]);
        text[5] = 0xC3;
        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        let engine = DisassemblyEngine::new(&pe).unwrap();
        assert!(!engine.is_function(0x1000));
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_jump_table_x64() {
        // mov eax, [rcx+rax*4+2000h] ; add rax, rcx ; jmp rax
        let mut text = vec![0u8; 0x200];
        text[..12].copy_from_slice(&[
            0x8B, 0x84, 0x81, 0x00, 0x20, 0x00, 0x00, 0x48, 0x01, 0xC8, 0xFF, 0xE0,
        ]);
        text[0x30] = 0xC3;

        // the table lives in .rdata: one entry into .text, then a terminator
        let mut rdata = vec![0u8; 0x200];
        rdata[..4].copy_from_slice(&0x1030u32.to_le_bytes());

        let pe = build_target(text, rdata, &[], vec![]);
        let mut engine = DisassemblyEngine::new(&pe).unwrap();
        let mut collector = Collector::default();
        engine.run(&mut collector).unwrap();

        assert!(collector.instructions.contains(&0x1030));
        assert_eq!(
            engine.data_ranges(),
            &[AddressRange {
                begin: 0x2000,
                end: 0x2008
            }]
        );
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_invalid_instruction_reported() {
        let mut text = mov_rax_imm_text();
        text[10] = 0x06; // invalid encoding in 64-bit mode

        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        let mut engine = DisassemblyEngine::new(&pe).unwrap();
        let mut collector = Collector::default();
        engine.run(&mut collector).unwrap();

        assert_eq!(collector.invalid, vec![(0x1000, 10)]);
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_protect_end_to_end() {
        let reloc_blocks = [(0x1000u32, vec![((RELOC_TYPE as u16) << 12) | 0x2])];
        let target = build_target(mov_rax_imm_text(), vec![0u8; 0x200], &reloc_blocks, vec![]);
        let out = protect(target, build_interpreter(), &BytecodeVirtualizer).unwrap();

        let vmldr = pe::section_by_name(&out, VM_LOADER_SECTION_NAME).unwrap();
        let vmcode = pe::section_by_name(&out, VM_CODE_SECTION_NAME).unwrap();
        let vmldr_va = vmldr.virtual_address.0 as u64;
        let vmcode_va = vmcode.virtual_address.0 as u64;

        // the instruction became a 5-byte relative jump into its loader stub,
        // which sits right behind the 0x200 bytes of interpreter vm code
        let text_offset = out.translate(PETranslation::Memory(RVA(0x1000))).unwrap();
        let text = out.get_slice_ref::<u8>(text_offset, 16).unwrap().to_vec();
        assert_eq!(text[0], 0xE9);
        let displacement = read32(&text, 1);
        assert_eq!(displacement, 0x200 + vmldr_va as u32 - (0x1000 + 5));

        // the relocated interpreter word now holds the preferred VA of
        // .vmfun offset 0x100 inside the loader section
        let vmldr_offset = out
            .translate(PETranslation::Memory(RVA(vmldr_va as u32)))
            .unwrap();
        assert_eq!(
            pe::read_u64_at(&out, vmldr_offset + 0x40).unwrap(),
            IMAGE_BASE + vmldr_va + 0x100
        );

        let entries = reloc::relocation_entries(&out).unwrap();

        // the virtualized instruction's own relocation was removed
        assert!(!entries.iter().any(|e| e.rva == 0x1002 && e.entry_type != 0));

        // the interpreter word and the stub's image base argument are covered
        assert!(entries
            .iter()
            .any(|e| e.rva == vmldr_va + 0x40 && e.entry_type == RELOC_TYPE));
        let template = BytecodeVirtualizer.build_loader_template(
            &Instruction::default(),
            VmOpcode(0),
            IMAGE_BASE,
        );
        let image_base_site = vmldr_va + 0x200 + template.offset_of(ShellcodeVar::ImageBase) as u64;
        assert!(entries
            .iter()
            .any(|e| e.rva == image_base_site && e.entry_type == RELOC_TYPE));

        assert_reloc_invariants(&out);

        // TLS was created from nothing: the index slot (8 bytes) and the
        // six-entry callback list (48 bytes) precede the directory record
        let tls = out.get_data_directory(ImageDirectoryEntry::TLS).unwrap();
        assert_eq!(tls.size as usize, 4 * WORD_SIZE + 8);
        let dir_rva = tls.virtual_address.0 as u64;
        assert_eq!(dir_rva, vmcode_va + 56);

        let dir_offset = out
            .translate(PETranslation::Memory(RVA(dir_rva as u32)))
            .unwrap();
        let callbacks_va = pe::read_word_at(&out, dir_offset + 3 * WORD_SIZE).unwrap();
        assert_eq!(callbacks_va, DEFAULT_PE_BASE_ADDRESS + vmcode_va + 8);

        let list_rva = callbacks_va - DEFAULT_PE_BASE_ADDRESS;
        let list_offset = out
            .translate(PETranslation::Memory(RVA(list_rva as u32)))
            .unwrap();
        assert_eq!(
            pe::read_word_at(&out, list_offset).unwrap(),
            DEFAULT_PE_BASE_ADDRESS + vmldr_va + 0x20
        );
        assert_eq!(pe::read_word_at(&out, list_offset + WORD_SIZE).unwrap(), 0);

        // debug and load-config directories are gone
        let debug = out.get_data_directory(ImageDirectoryEntry::Debug).unwrap();
        assert_eq!((debug.virtual_address.0, debug.size), (0, 0));
        let load_config = out
            .get_data_directory(ImageDirectoryEntry::LoadConfig)
            .unwrap();
        assert_eq!((load_config.virtual_address.0, load_config.size), (0, 0));
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_protect_rollback_restores_instruction() {
        let mut text = mov_rax_imm_text();
        text[10] = 0x06; // the stream dies right after the mov
        let original = text.clone();

        let reloc_blocks = [(0x1000u32, vec![((RELOC_TYPE as u16) << 12) | 0x2])];
        let target = build_target(text, vec![0u8; 0x200], &reloc_blocks, vec![]);
        let out = protect(target, build_interpreter(), &BytecodeVirtualizer).unwrap();

        let text_offset = out.translate(PETranslation::Memory(RVA(0x1000))).unwrap();
        let bytes = out.get_slice_ref::<u8>(text_offset, 16).unwrap();
        assert_eq!(&bytes[..11], &original[..11]);

        // the instruction's relocation survived the rollback
        let entries = reloc::relocation_entries(&out).unwrap();
        assert!(entries
            .iter()
            .any(|e| e.rva == 0x1002 && e.entry_type == RELOC_TYPE));
    }

    #[cfg(not(feature = "x86"))]
    #[test]
    fn test_protect_extends_existing_tls_directory() {
        // a TLS directory at .rdata start, one existing callback at +0x100
        let mut rdata = vec![0u8; 0x200];
        put_word(&mut rdata, 3 * WORD_SIZE, IMAGE_BASE + 0x2100);
        put_word(&mut rdata, 0x100, IMAGE_BASE + 0x1050);

        let reloc_blocks = [(0x1000u32, vec![((RELOC_TYPE as u16) << 12) | 0x2])];
        let target = build_target(
            mov_rax_imm_text(),
            rdata,
            &reloc_blocks,
            vec![(DIR_TLS, 0x2000, (4 * WORD_SIZE + 8) as u32)],
        );
        let out = protect(target, build_interpreter(), &BytecodeVirtualizer).unwrap();

        let vmldr = pe::section_by_name(&out, VM_LOADER_SECTION_NAME).unwrap();
        let vmcode = pe::section_by_name(&out, VM_CODE_SECTION_NAME).unwrap();

        // the directory stayed in place but points at the copied list, which
        // is the first thing inside the virtualized-code section
        let tls_offset = out.translate(PETranslation::Memory(RVA(0x2000))).unwrap();
        let callbacks_va = pe::read_word_at(&out, tls_offset + 3 * WORD_SIZE).unwrap();
        assert_eq!(
            callbacks_va,
            DEFAULT_PE_BASE_ADDRESS + vmcode.virtual_address.0 as u64
        );

        let list_offset = out
            .translate(PETranslation::Memory(vmcode.virtual_address))
            .unwrap();
        assert_eq!(
            pe::read_word_at(&out, list_offset).unwrap(),
            IMAGE_BASE + 0x1050
        );
        assert_eq!(
            pe::read_word_at(&out, list_offset + WORD_SIZE).unwrap(),
            DEFAULT_PE_BASE_ADDRESS + vmldr.virtual_address.0 as u64 + 0x20
        );
        // the trailing slots stay zeroed (terminator plus spare room)
        assert_eq!(
            pe::read_word_at(&out, list_offset + 2 * WORD_SIZE).unwrap(),
            0
        );
        assert_eq!(
            pe::read_word_at(&out, list_offset + 6 * WORD_SIZE).unwrap(),
            0
        );

        assert_reloc_invariants(&out);
    }

    #[cfg(feature = "x86")]
    #[test]
    fn test_jump_table_x86() {
        // jmp [eax*4+401020h] with the table inside .text
        let mut text = vec![0u8; 0x200];
        text[..7].copy_from_slice(&[0xFF, 0x24, 0x85, 0x20, 0x10, 0x40, 0x00]);
        text[0x20..0x24].copy_from_slice(&0x0040_1030u32.to_le_bytes());
        text[0x24..0x28].copy_from_slice(&0x0040_1040u32.to_le_bytes());
        // the zero terminator at 0x28 is part of the fixture
        text[0x30] = 0xC3;
        text[0x40] = 0xC3;

        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        let mut engine = DisassemblyEngine::new(&pe).unwrap();
        let mut collector = Collector::default();
        engine.run(&mut collector).unwrap();

        assert!(collector.instructions.contains(&0x1030));
        assert!(collector.instructions.contains(&0x1040));
        assert_eq!(
            engine.data_ranges(),
            &[AddressRange {
                begin: 0x1020,
                end: 0x102C
            }]
        );
    }

    #[cfg(feature = "x86")]
    #[test]
    fn test_function_prologue_x86() {
        // hotpatch pad, then push ebp ; mov ebp, esp
        let mut text = vec![0u8; 0x200];
        text[..5].copy_from_slice(&[0x8B, 0xFF, 0x55, 0x8B, 0xEC]);
        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        assert!(DisassemblyEngine::new(&pe).unwrap().is_function(0x1000));

        // the bare prologue passes as well
        let mut text = vec![0u8; 0x200];
        text[..3].copy_from_slice(&[0x55, 0x8B, 0xEC]);
        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        assert!(DisassemblyEngine::new(&pe).unwrap().is_function(0x1000));

        // something else does not
        let mut text = vec![0u8; 0x200];
        text[..3].copy_from_slice(&[0x90, 0x90, 0xC3]);
        let pe = build_target(text, vec![0u8; 0x200], &[], vec![]);
        assert!(!DisassemblyEngine::new(&pe).unwrap().is_function(0x1000));
    }
}
