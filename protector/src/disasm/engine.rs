use std::collections::HashSet;

use exe::{Buffer, ImageSectionHeader, VecPE, PE};
use iced_x86::{FlowControl, Instruction, Mnemonic, OpKind, Register};
use logger::debug;

use crate::disasm::decoder;
use crate::error::ProtectError;
use crate::pe;
use crate::WORD_SIZE;

/// `[begin, end)` RVA range inside `.text` that holds data, not code.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AddressRange {
    pub begin: u64,
    pub end: u64,
}

/// An RVA from which linear decoding is known or suspected to begin, paired
/// with its index into the `.text` raw data.
#[derive(Copy, Clone)]
struct DisassemblyPoint {
    rva: u64,
    index: usize,
}

enum DisassemblyAction {
    NextInstruction,
    NextDisassemblyPoint,
}

/// Callbacks driven by the engine while exploring the image.
pub trait DisassemblyVisitor {
    fn on_instruction(&mut self, instruction: &Instruction) -> Result<(), ProtectError>;

    /// A discovered stream ran into undecodable bytes; receives the
    /// previously accepted instruction so its effects can be undone.
    fn on_invalid_instruction(&mut self, rva: u64, size: usize);
}

#[cfg(not(feature = "x86"))]
#[repr(C, packed)]
struct RuntimeFunction {
    begin_address: u32,
    end_address: u32,
    unwind_info_address: u32,
}

/// Function entry points recorded in the exception directory. These are
/// known-good disassembly points the reachability search alone can miss.
#[cfg(not(feature = "x86"))]
fn exception_function_starts(pe: &VecPE) -> Vec<u64> {
    use exe::{ImageDirectoryEntry, PETranslation};

    let mut starts = Vec::new();
    let Ok(exceptions) = pe.get_data_directory(ImageDirectoryEntry::Exception) else {
        return starts;
    };
    let (dir_va, dir_size) = (exceptions.virtual_address, exceptions.size);
    if dir_va.0 == 0 || dir_size == 0 {
        return starts;
    }
    let Ok(offset) = pe.translate(PETranslation::Memory(dir_va)) else {
        return starts;
    };
    let count = dir_size as usize / std::mem::size_of::<RuntimeFunction>();
    let Ok(functions) = pe.get_slice_ref::<RuntimeFunction>(offset, count) else {
        return starts;
    };
    for function in functions {
        starts.push(function.begin_address as u64);
    }
    starts
}

/// Recursive reachability search over `.text`. Works on an owned snapshot of
/// the input image so that later `.text` patching is never observable here.
pub struct DisassemblyEngine {
    image: Vec<u8>,
    sections: Vec<ImageSectionHeader>,
    text: ImageSectionHeader,
    image_base: u64,
    entry_point: u64,
    function_starts: Vec<u64>,
    points: Vec<DisassemblyPoint>,
    seen: HashSet<u64>,
    data_ranges: Vec<AddressRange>,
}

impl DisassemblyEngine {
    pub fn new(pe: &VecPE) -> Result<Self, ProtectError> {
        let sections = pe.get_section_table()?.to_vec();
        let text = sections
            .iter()
            .find(|s| pe::section_name(s) == ".text")
            .copied()
            .ok_or_else(|| ProtectError::InputInvalid(".text section not found".into()))?;

        #[cfg(not(feature = "x86"))]
        let function_starts = exception_function_starts(pe);
        #[cfg(feature = "x86")]
        let function_starts = Vec::new();

        Ok(Self {
            image: pe.to_vec(),
            sections,
            text,
            image_base: pe.get_image_base()?,
            entry_point: pe.get_entrypoint()?.0 as u64,
            function_starts,
            points: Vec::new(),
            seen: HashSet::new(),
            data_ranges: Vec::new(),
        })
    }

    pub fn data_ranges(&self) -> &[AddressRange] {
        &self.data_ranges
    }

    /// Explores everything reachable from the entry point, invoking the
    /// visitor once per decoded instruction. Exploration is LIFO: the entry
    /// point is seeded last and popped first.
    pub fn run<V: DisassemblyVisitor>(&mut self, visitor: &mut V) -> Result<(), ProtectError> {
        let starts = std::mem::take(&mut self.function_starts);
        for rva in starts {
            self.add_point(rva);
        }
        self.parse_rdata_section();

        let entry = self.entry_point;
        if !self.is_within_text(entry) {
            return Err(ProtectError::InputInvalid(
                "entry point lies outside .text".into(),
            ));
        }
        self.add_point(entry);

        debug!("Seeded {} disassembly points", self.points.len());

        while let Some(point) = self.points.pop() {
            self.disassemble_stream(point, visitor)?;
        }
        Ok(())
    }

    fn disassemble_stream<V: DisassemblyVisitor>(
        &mut self,
        point: DisassemblyPoint,
        visitor: &mut V,
    ) -> Result<(), ProtectError> {
        let mut rva = point.rva;
        let mut index = point.index;
        let mut last: Option<(u64, usize)> = None;

        loop {
            if self.is_within_data_range(rva) {
                return Ok(());
            }
            let Some(code) = self.text_tail(rva) else {
                return Ok(());
            };
            let Some(instruction) = decoder::decode_one(code, rva) else {
                // Bad bytes mid-stream mean the previous instruction was
                // most likely a misdecode, let the visitor undo it.
                if let Some((prev_rva, prev_size)) = last {
                    visitor.on_invalid_instruction(prev_rva, prev_size);
                }
                return Ok(());
            };

            visitor.on_instruction(&instruction)?;
            last = Some((rva, instruction.len()));

            match self.parse_instruction(&instruction, index) {
                DisassemblyAction::NextInstruction => {
                    index += instruction.len();
                    rva += instruction.len() as u64;
                }
                DisassemblyAction::NextDisassemblyPoint => return Ok(()),
            }
        }
    }

    fn parse_instruction(&mut self, instruction: &Instruction, index: usize) -> DisassemblyAction {
        use DisassemblyAction::*;

        match instruction.flow_control() {
            FlowControl::Return | FlowControl::Interrupt => return NextDisassemblyPoint,
            FlowControl::Call
            | FlowControl::IndirectCall
            | FlowControl::UnconditionalBranch
            | FlowControl::ConditionalBranch
            | FlowControl::IndirectBranch => return self.parse_branch(instruction, index),
            _ => {}
        }

        match instruction.mnemonic() {
            Mnemonic::Mov if instruction.op_count() == 2 => {
                if self.is_jump_table(instruction, index) {
                    self.parse_jump_table(instruction);
                    return NextDisassemblyPoint;
                }
                self.scan_mov_function_pointer(instruction);
            }
            Mnemonic::Push if instruction.op_count() == 1 => {
                self.scan_push_function_pointer(instruction);
            }
            _ => {}
        }

        NextInstruction
    }

    fn parse_branch(&mut self, instruction: &Instruction, index: usize) -> DisassemblyAction {
        use DisassemblyAction::*;

        if instruction.op_count() == 1 {
            match instruction.op0_kind() {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    self.add_point(instruction.near_branch_target());
                    return if is_guaranteed_jump(instruction) {
                        NextDisassemblyPoint
                    } else {
                        NextInstruction
                    };
                }
                _ => {
                    if self.is_jump_table(instruction, index) {
                        self.parse_jump_table(instruction);
                        return NextDisassemblyPoint;
                    }
                }
            }
        }

        if is_guaranteed_jump(instruction) {
            NextDisassemblyPoint
        } else {
            NextInstruction
        }
    }

    /// jmp dword ptr [reg*4 + table] with the table inside `.text`.
    #[cfg(feature = "x86")]
    fn is_jump_table(&self, instruction: &Instruction, _index: usize) -> bool {
        if instruction.op_count() != 1 {
            return false;
        }
        if !(is_guaranteed_jump(instruction) || instruction.mnemonic() == Mnemonic::Mov) {
            return false;
        }
        if instruction.op0_kind() != OpKind::Memory || instruction.memory_index_scale() != 4 {
            return false;
        }
        self.is_within_text(self.memory_operand_rva(instruction))
    }

    /*
        mov eax, dword ptr [rcx+rax*4+10F2F4]
        add rax, rcx
        jmp rax
    */
    #[cfg(not(feature = "x86"))]
    fn is_jump_table(&self, instruction: &Instruction, index: usize) -> bool {
        if instruction.mnemonic() != Mnemonic::Mov || instruction.op_count() != 2 {
            return false;
        }
        if instruction.op0_kind() != OpKind::Register {
            return false;
        }
        if instruction.op1_kind() != OpKind::Memory || instruction.memory_index_scale() != 4 {
            return false;
        }

        // decode the two following instructions without touching the stream
        let next_index = index + instruction.len();
        let start = self.text.pointer_to_raw_data.0 as usize;
        let len = self.text_raw_len();
        if next_index >= len {
            return false;
        }
        let followers = decoder::decode_n(
            &self.image[start + next_index..start + len],
            instruction.next_ip(),
            2,
        );
        if followers.len() != 2 {
            return false;
        }

        let (add, jmp) = (&followers[0], &followers[1]);
        if add.mnemonic() != Mnemonic::Add || add.op_count() != 2 {
            return false;
        }
        if add.op0_kind() != OpKind::Register || add.op1_kind() != OpKind::Register {
            return false;
        }
        is_guaranteed_jump(jmp)
            && jmp.op0_kind() == OpKind::Register
            && jmp.op0_register() == add.op0_register()
    }

    /// Walks the table entries, enqueueing each target until a terminator,
    /// then records the consumed bytes as a data range.
    fn parse_jump_table(&mut self, instruction: &Instruction) {
        let table_rva = self.memory_operand_rva(instruction);
        let mut consumed = 0u64;

        if let Some(table_offset) = pe::rva_to_file_offset(&self.sections, table_rva) {
            loop {
                let entry_offset = table_offset + consumed as usize;
                if entry_offset + 4 > self.image.len() {
                    break;
                }
                let value = read_u32(&self.image, entry_offset);
                if value == 0 || value == 0xCCCC_CCCC {
                    consumed += 4;
                    break;
                }
                let entry_rva = self.immediate_rva(value as u64);
                if !self.is_within_text(entry_rva) {
                    consumed += 4;
                    break;
                }
                self.add_point(entry_rva);
                consumed += 4;
            }
        }

        debug!(
            "Jump table at 0x{:08X}, {} bytes",
            table_rva, consumed
        );
        self.data_ranges.push(AddressRange {
            begin: table_rva,
            end: table_rva + consumed,
        });
    }

    /// mov reg_or_mem, imm where the immediate points at a function prologue.
    fn scan_mov_function_pointer(&mut self, instruction: &Instruction) {
        if !matches!(instruction.op0_kind(), OpKind::Register | OpKind::Memory) {
            return;
        }
        if !decoder::is_immediate(instruction.op1_kind()) {
            return;
        }
        let rva = self.immediate_rva(instruction.immediate(1));
        if pe::section_from_rva(&self.sections, rva).is_none() {
            return;
        }
        if self.is_within_text(rva) && self.is_function(rva) {
            self.add_point(rva);
        }
    }

    fn scan_push_function_pointer(&mut self, instruction: &Instruction) {
        if !decoder::is_immediate(instruction.op0_kind()) {
            return;
        }
        let rva = self.immediate_rva(instruction.immediate(0));
        if self.is_within_text(rva) && self.is_function(rva) {
            self.add_point(rva);
        }
    }

    /// Scans `.rdata` for word-aligned values that point at function
    /// prologues inside `.text`.
    fn parse_rdata_section(&mut self) {
        let Some(rdata) = self
            .sections
            .iter()
            .find(|s| pe::section_name(s) == ".rdata")
            .copied()
        else {
            return;
        };
        let start = rdata.pointer_to_raw_data.0 as usize;
        let size = (rdata.size_of_raw_data as usize).min(self.image.len().saturating_sub(start));

        let mut offset = 0;
        while offset + WORD_SIZE <= size {
            let value = read_word(&self.image, start + offset);
            if value != 0 {
                let rva = value.wrapping_sub(self.image_base);
                if self.is_within_text(rva) && self.is_function(rva) {
                    self.add_point(rva);
                }
            }
            offset += WORD_SIZE;
        }
    }

    /// Follows direct jump thunks, then requires the classic frame setup,
    /// tolerating a leading `mov edi, edi` hotpatch pad.
    #[cfg(feature = "x86")]
    pub fn is_function(&self, rva: u64) -> bool {
        let mut rva = rva;
        let mut depth = 0;
        loop {
            if depth > 10 {
                return false;
            }
            let Some(code) = self.text_tail(rva) else {
                return false;
            };
            let instructions = decoder::decode_n(code, rva, 3);
            if instructions.len() != 3 {
                return false;
            }

            let first = &instructions[0];
            if is_guaranteed_jump(first) {
                let Some(target) = near_branch_target(first) else {
                    return false;
                };
                if !self.is_within_text(target) {
                    return false;
                }
                rva = target;
                depth += 1;
                continue;
            }

            let (first, second) = if is_mov_reg_reg(first, Register::EDI, Register::EDI) {
                (&instructions[1], &instructions[2])
            } else {
                (&instructions[0], &instructions[1])
            };
            return is_push_reg(first, Register::EBP)
                && is_mov_reg_reg(second, Register::EBP, Register::ESP);
        }
    }

    /// Requires the home-space spill run derived from the first
    /// `mov [rsp+disp], reg`, then a `sub rsp, imm` within ten instructions.
    #[cfg(not(feature = "x86"))]
    pub fn is_function(&self, rva: u64) -> bool {
        let mut rva = rva;
        let mut depth = 0;
        loop {
            if depth > 10 {
                return false;
            }
            let Some(code) = self.text_tail(rva) else {
                return false;
            };
            let Some(first) = decoder::decode_one(code, rva) else {
                return false;
            };

            if is_guaranteed_jump(&first) {
                let Some(target) = near_branch_target(&first) else {
                    return false;
                };
                if !self.is_within_text(target) {
                    return false;
                }
                rva = target;
                depth += 1;
                continue;
            }

            if !is_mov_rsp_disp_reg(&first) {
                return false;
            }
            let disp = first.memory_displacement64();
            if disp == 0 || disp % 8 != 0 {
                return false;
            }
            let expected_movs = disp / 8 - 1;
            if expected_movs > 16 {
                return false;
            }

            let mut cursor = first.next_ip();
            for _ in 0..expected_movs {
                let Some(code) = self.text_tail(cursor) else {
                    return false;
                };
                let Some(instruction) = decoder::decode_one(code, cursor) else {
                    return false;
                };
                if !is_mov_rsp_disp_reg(&instruction) {
                    return false;
                }
                cursor = instruction.next_ip();
            }

            for _ in 0..10 {
                let Some(code) = self.text_tail(cursor) else {
                    return false;
                };
                let Some(instruction) = decoder::decode_one(code, cursor) else {
                    return false;
                };
                if is_sub_rsp_imm(&instruction) {
                    return true;
                }
                cursor = instruction.next_ip();
            }
            return false;
        }
    }

    fn add_point(&mut self, rva: u64) {
        if self.seen.contains(&rva) || !self.is_within_text(rva) {
            return;
        }
        self.points.push(DisassemblyPoint {
            rva,
            index: (rva - self.text.virtual_address.0 as u64) as usize,
        });
        self.seen.insert(rva);
    }

    fn is_within_text(&self, rva: u64) -> bool {
        pe::is_rva_within_section(&self.text, rva)
    }

    fn is_within_data_range(&self, rva: u64) -> bool {
        self.data_ranges
            .iter()
            .any(|range| rva >= range.begin && rva < range.end)
    }

    fn text_raw_len(&self) -> usize {
        let start = self.text.pointer_to_raw_data.0 as usize;
        (self.text.size_of_raw_data as usize).min(self.image.len().saturating_sub(start))
    }

    /// The `.text` bytes from `rva` to the end of the section's raw data.
    fn text_tail(&self, rva: u64) -> Option<&[u8]> {
        if !self.is_within_text(rva) {
            return None;
        }
        let index = (rva - self.text.virtual_address.0 as u64) as usize;
        let len = self.text_raw_len();
        if index >= len {
            return None;
        }
        let start = self.text.pointer_to_raw_data.0 as usize;
        Some(&self.image[start + index..start + len])
    }

    // On x86 displacements and immediates carry the image base, on x64 the
    // decoder already reports RVAs.
    fn memory_operand_rva(&self, instruction: &Instruction) -> u64 {
        if cfg!(feature = "x86") {
            (instruction.memory_displacement32() as u64).wrapping_sub(self.image_base)
        } else {
            instruction.memory_displacement64()
        }
    }

    fn immediate_rva(&self, value: u64) -> u64 {
        if cfg!(feature = "x86") {
            value.wrapping_sub(self.image_base)
        } else {
            value
        }
    }
}

fn is_guaranteed_jump(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Jmp
}

fn near_branch_target(instruction: &Instruction) -> Option<u64> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instruction.near_branch_target())
        }
        _ => None,
    }
}

#[cfg(feature = "x86")]
fn is_push_reg(instruction: &Instruction, register: Register) -> bool {
    instruction.mnemonic() == Mnemonic::Push
        && instruction.op_count() == 1
        && instruction.op0_kind() == OpKind::Register
        && instruction.op0_register() == register
}

#[cfg(feature = "x86")]
fn is_mov_reg_reg(instruction: &Instruction, dst: Register, src: Register) -> bool {
    instruction.mnemonic() == Mnemonic::Mov
        && instruction.op_count() == 2
        && instruction.op0_kind() == OpKind::Register
        && instruction.op1_kind() == OpKind::Register
        && instruction.op0_register() == dst
        && instruction.op1_register() == src
}

#[cfg(not(feature = "x86"))]
fn is_mov_rsp_disp_reg(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Mov
        && instruction.op_count() == 2
        && instruction.op0_kind() == OpKind::Memory
        && instruction.memory_base() == Register::RSP
        && instruction.op1_kind() == OpKind::Register
}

#[cfg(not(feature = "x86"))]
fn is_sub_rsp_imm(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Sub
        && instruction.op_count() == 2
        && instruction.op0_kind() == OpKind::Register
        && instruction.op0_register() == Register::RSP
        && decoder::is_immediate(instruction.op1_kind())
}

fn read_u32(image: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&image[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_word(image: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[..WORD_SIZE].copy_from_slice(&image[offset..offset + WORD_SIZE]);
    u64::from_le_bytes(buf)
}
