pub mod bytecode;
pub mod shellcode;

use iced_x86::Instruction;

pub use shellcode::{Shellcode, ShellcodeVar};

/// Opaque micro-op identifier handed back to the virtualizer that produced it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VmOpcode(pub u16);

/// The instruction-to-micro-op compiler the protector drives. The core only
/// depends on this interface; [`bytecode::BytecodeVirtualizer`] is the
/// first-party implementation.
pub trait Virtualizer {
    fn classify(&self, instruction: &Instruction) -> Option<VmOpcode>;

    fn is_virtualizable(&self, instruction: &Instruction, opcode: VmOpcode) -> bool;

    /// Encrypted micro-op buffer destined for the virtualized-code section.
    /// An empty buffer skips the instruction.
    fn build_vm_bytes(
        &self,
        instruction: &Instruction,
        opcode: VmOpcode,
        encryption_key: u32,
        relocations: &[u64],
    ) -> Vec<u8>;

    /// Loader stub for one virtualized instruction, with its named variables
    /// still unpatched (except for the image base, known at build time).
    fn build_loader_template(
        &self,
        instruction: &Instruction,
        opcode: VmOpcode,
        image_base: u64,
    ) -> Shellcode;
}
