use std::collections::HashMap;

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::WORD_SIZE;

/// Named patch sites inside a loader stub.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumIter)]
pub enum ShellcodeVar {
    VmCodeAddr,
    OrigAddr,
    VmCoreFunction,
    ImageBase,
    VmOpcodeEncryptionKey,
}

/// A loader stub plus the offsets of its named variables.
pub struct Shellcode {
    bytes: Vec<u8>,
    offsets: HashMap<ShellcodeVar, usize>,
}

impl Shellcode {
    pub fn new(bytes: Vec<u8>, offsets: HashMap<ShellcodeVar, usize>) -> Self {
        for var in ShellcodeVar::iter() {
            let offset = *offsets
                .get(&var)
                .unwrap_or_else(|| panic!("loader template is missing {:?}", var));
            assert!(
                offset + 4 <= bytes.len(),
                "patch site {:?} past the template end",
                var
            );
        }
        Self { bytes, offsets }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn offset_of(&self, var: ShellcodeVar) -> usize {
        self.offsets[&var]
    }

    /// Writes a 4-byte little-endian value at the variable's offset.
    pub fn patch32(&mut self, var: ShellcodeVar, value: u32) {
        let offset = self.offset_of(var);
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a pointer-sized little-endian value at the variable's offset.
    pub fn patch_ptr(&mut self, var: ShellcodeVar, value: u64) {
        let offset = self.offset_of(var);
        self.bytes[offset..offset + WORD_SIZE].copy_from_slice(&value.to_le_bytes()[..WORD_SIZE]);
    }
}
