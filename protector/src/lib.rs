pub mod disasm;
pub mod error;
pub mod fixup;
pub mod pe;
pub mod protect;
pub mod reloc;
#[cfg(feature = "tls")]
pub mod tls;
pub mod virt;

pub use error::ProtectError;
pub use protect::protect;

/// Section of the interpreter DLL holding the VM entry code.
pub const VM_FUNCTIONS_SECTION_NAME: &str = ".vmfun";
/// Appended section carrying the interpreter code and the loader stubs.
pub const VM_LOADER_SECTION_NAME: &str = ".vmldr";
/// Appended section carrying the encrypted bytecode and TLS records.
pub const VM_CODE_SECTION_NAME: &str = ".vmcode";

pub const VM_INTERPRETER_EXPORT: &str = "VmInterpreter";
pub const TLS_CALLBACK_EXPORT: &str = "TlsCallback";

#[cfg(not(feature = "x86"))]
pub const BITNESS: u32 = 64;
#[cfg(feature = "x86")]
pub const BITNESS: u32 = 32;

#[cfg(not(feature = "x86"))]
pub const WORD_SIZE: usize = 8;
#[cfg(feature = "x86")]
pub const WORD_SIZE: usize = 4;

// Preferred base the loader-time relocations are computed against.
#[cfg(not(feature = "x86"))]
pub const DEFAULT_PE_BASE_ADDRESS: u64 = 0x0001_4000_0000;
#[cfg(feature = "x86")]
pub const DEFAULT_PE_BASE_ADDRESS: u64 = 0x0040_0000;
