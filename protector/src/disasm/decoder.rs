use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};

use crate::BITNESS;

/// Decodes a single instruction at `rva`, `None` on invalid or exhausted
/// bytes. Every decoded instruction carries full operand and flag detail.
pub fn decode_one(code: &[u8], rva: u64) -> Option<Instruction> {
    let mut decoder = Decoder::with_ip(BITNESS, code, rva, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let mut instruction = Instruction::default();
    decoder.decode_out(&mut instruction);
    if instruction.is_invalid() {
        return None;
    }
    Some(instruction)
}

/// Decodes up to `count` instructions, returning fewer on failure.
pub fn decode_n(code: &[u8], rva: u64, count: usize) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(BITNESS, code, rva, DecoderOptions::NONE);
    let mut instructions = Vec::with_capacity(count);
    let mut instruction = Instruction::default();
    while instructions.len() < count && decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            break;
        }
        instructions.push(instruction);
    }
    instructions
}

pub fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}
