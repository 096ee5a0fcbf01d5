use std::collections::HashMap;

use iced_x86::code_asm::*;
use iced_x86::{Instruction, Mnemonic, OpKind};

use crate::disasm::decoder;
use crate::virt::{Shellcode, ShellcodeVar, Virtualizer, VmOpcode};

/// Micro-ops covered by the first-party virtualizer. Only immediate forms
/// with no eflags side effects are compiled.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VmOp {
    SetRegImm = 0,
    SetMemImm = 1,
    PushImm = 2,
}

// key stream constants (PCG multiplier/increment)
const KEY_MUL: u64 = 0x5851_F42D_4C95_7F2D;
const KEY_ADD: u64 = 0x1405_7B7E_F767_814F;

#[cfg(not(feature = "x86"))]
const VM_CODE_ADDR_MAGIC: u64 = 0xA11C_0DE0_5E17_1001;
#[cfg(not(feature = "x86"))]
const IMAGE_BASE_MAGIC: u64 = 0xA11C_0DE0_5E17_1002;
#[cfg(feature = "x86")]
const VM_CODE_ADDR_MAGIC: u32 = 0xA11C_1001;
#[cfg(feature = "x86")]
const IMAGE_BASE_MAGIC: u32 = 0xA11C_1002;

const KEY_MAGIC: u32 = 0xA55A_3C01;
const CORE_MAGIC: u32 = 0xA55A_3C02;
const ORIG_MAGIC: u32 = 0xA55A_3C03;

/// Compiles single instructions into encrypted micro-op records and emits
/// the loader stub that hands them to the interpreter.
#[derive(Default)]
pub struct BytecodeVirtualizer;

impl Virtualizer for BytecodeVirtualizer {
    fn classify(&self, instruction: &Instruction) -> Option<VmOpcode> {
        let op = match instruction.mnemonic() {
            Mnemonic::Mov
                if instruction.op_count() == 2
                    && instruction.op0_kind() == OpKind::Register
                    && decoder::is_immediate(instruction.op1_kind()) =>
            {
                VmOp::SetRegImm
            }
            Mnemonic::Mov
                if instruction.op_count() == 2
                    && instruction.op0_kind() == OpKind::Memory
                    && decoder::is_immediate(instruction.op1_kind()) =>
            {
                VmOp::SetMemImm
            }
            Mnemonic::Push
                if instruction.op_count() == 1
                    && decoder::is_immediate(instruction.op0_kind()) =>
            {
                VmOp::PushImm
            }
            _ => return None,
        };
        Some(VmOpcode(op as u16))
    }

    fn is_virtualizable(&self, instruction: &Instruction, _opcode: VmOpcode) -> bool {
        // the .text patch needs a 5-byte window; flag effects are not modeled
        instruction.len() >= 5 && instruction.rflags_modified() == 0
    }

    fn build_vm_bytes(
        &self,
        instruction: &Instruction,
        opcode: VmOpcode,
        encryption_key: u32,
        relocations: &[u64],
    ) -> Vec<u8> {
        let mut record = Vec::with_capacity(40);
        record.push(opcode.0 as u8);
        record.push(instruction.len() as u8);

        let (register, immediate) = if instruction.op_count() == 1 {
            (0u16, instruction.immediate(0))
        } else {
            let register = if instruction.op0_kind() == OpKind::Register {
                instruction.op0_register() as u16
            } else {
                0
            };
            (register, instruction.immediate(1))
        };
        record.extend_from_slice(&register.to_le_bytes());

        let (base, index, scale, displacement) = if instruction.op0_kind() == OpKind::Memory {
            (
                instruction.memory_base() as u16,
                instruction.memory_index() as u16,
                instruction.memory_index_scale() as u8,
                instruction.memory_displacement64(),
            )
        } else {
            (0, 0, 0, 0)
        };
        record.extend_from_slice(&base.to_le_bytes());
        record.extend_from_slice(&index.to_le_bytes());
        record.push(scale);
        record.push(0);
        record.extend_from_slice(&displacement.to_le_bytes());
        record.extend_from_slice(&immediate.to_le_bytes());

        record.push(relocations.len() as u8);
        for rva in relocations {
            record.push((rva - instruction.ip()) as u8);
        }

        // stream cipher keyed by the per-instruction opcode key
        let mut key = encryption_key as u64;
        for byte in &mut record {
            *byte ^= key as u8;
            key = key.wrapping_mul(KEY_MUL).wrapping_add(KEY_ADD);
        }
        record
    }

    fn build_loader_template(
        &self,
        _instruction: &Instruction,
        _opcode: VmOpcode,
        image_base: u64,
    ) -> Shellcode {
        let (bytes, offsets) = loader_template();
        let mut shellcode = Shellcode::new(bytes, offsets);
        shellcode.patch_ptr(ShellcodeVar::ImageBase, image_base);
        shellcode
    }
}

/// Saves the scratch state, loads the bytecode address, image base and key,
/// calls the interpreter and jumps back behind the replaced instruction.
/// `E8`/`E9` immediately precede their displacement patch sites; the
/// orchestrator's displacement arithmetic depends on that.
#[cfg(not(feature = "x86"))]
fn loader_template() -> (Vec<u8>, HashMap<ShellcodeVar, usize>) {
    let mut asm = CodeAssembler::new(64).unwrap();
    asm.pushfq().unwrap();
    for reg in [rax, rcx, rdx, r8, r9, r10, r11] {
        asm.push(reg).unwrap();
    }
    asm.mov(rcx, VM_CODE_ADDR_MAGIC).unwrap();
    asm.mov(rdx, IMAGE_BASE_MAGIC).unwrap();
    asm.mov(r8d, KEY_MAGIC).unwrap();
    asm.db(&with_opcode(0xE8, CORE_MAGIC)).unwrap();
    for reg in [r11, r10, r9, r8, rdx, rcx, rax] {
        asm.pop(reg).unwrap();
    }
    asm.popfq().unwrap();
    asm.db(&with_opcode(0xE9, ORIG_MAGIC)).unwrap();

    let bytes = asm.assemble(0).unwrap();
    let offsets = named_offsets(&bytes);
    (bytes, offsets)
}

#[cfg(feature = "x86")]
fn loader_template() -> (Vec<u8>, HashMap<ShellcodeVar, usize>) {
    let mut asm = CodeAssembler::new(32).unwrap();
    asm.pushfd().unwrap();
    asm.pushad().unwrap();
    asm.push(KEY_MAGIC as i32).unwrap();
    asm.push(IMAGE_BASE_MAGIC as i32).unwrap();
    asm.push(VM_CODE_ADDR_MAGIC as i32).unwrap();
    asm.db(&with_opcode(0xE8, CORE_MAGIC)).unwrap();
    asm.popad().unwrap();
    asm.popfd().unwrap();
    asm.db(&with_opcode(0xE9, ORIG_MAGIC)).unwrap();

    let bytes = asm.assemble(0).unwrap();
    let offsets = named_offsets(&bytes);
    (bytes, offsets)
}

fn named_offsets(bytes: &[u8]) -> HashMap<ShellcodeVar, usize> {
    HashMap::from([
        (
            ShellcodeVar::VmCodeAddr,
            find_magic(bytes, &VM_CODE_ADDR_MAGIC.to_le_bytes()),
        ),
        (
            ShellcodeVar::ImageBase,
            find_magic(bytes, &IMAGE_BASE_MAGIC.to_le_bytes()),
        ),
        (
            ShellcodeVar::VmOpcodeEncryptionKey,
            find_magic(bytes, &KEY_MAGIC.to_le_bytes()),
        ),
        (
            ShellcodeVar::VmCoreFunction,
            find_magic(bytes, &CORE_MAGIC.to_le_bytes()),
        ),
        (
            ShellcodeVar::OrigAddr,
            find_magic(bytes, &ORIG_MAGIC.to_le_bytes()),
        ),
    ])
}

fn find_magic(bytes: &[u8], magic: &[u8]) -> usize {
    bytes
        .windows(magic.len())
        .position(|window| window == magic)
        .expect("sentinel missing from the loader template")
}

fn with_opcode(opcode: u8, displacement: u32) -> [u8; 5] {
    let bytes = displacement.to_le_bytes();
    [opcode, bytes[0], bytes[1], bytes[2], bytes[3]]
}
