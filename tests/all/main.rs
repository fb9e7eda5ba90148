mod debug;
mod exceptions;
mod gc;
mod interp;
mod memory;
mod stack_overflow;
mod table;
mod traps;
mod wasi;

use wasmjit::{CodeMemory, VMTrampoline};

/// Machine code for the host, written as raw bytes on x86_64 and as
/// instruction words on aarch64.
#[cfg(target_arch = "aarch64")]
pub(crate) fn insns(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Publishes `code` and views its first byte as an entry trampoline.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) fn trampoline(code: &[u8]) -> anyhow::Result<(CodeMemory, VMTrampoline)> {
    let _ = env_logger::try_init();
    let code = CodeMemory::new(code)?;
    let entry = unsafe { std::mem::transmute::<*const wasmjit::VMFunctionBody, VMTrampoline>(code.as_ptr()) };
    Ok((code, entry))
}

/// A trampoline that stores one byte at the absolute address in `values[0]`.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) fn store_byte() -> anyhow::Result<(CodeMemory, VMTrampoline)> {
    #[cfg(target_arch = "x86_64")]
    let code = vec![
        0x48, 0x8b, 0x06, // mov rax, [rsi]
        0xc6, 0x00, 0x01, // mov byte [rax], 1
        0x31, 0xc0, // xor eax, eax
        0xc3, // ret
    ];
    #[cfg(target_arch = "aarch64")]
    let code = insns(&[
        0xf940_0028, // ldr x8, [x1]
        0x5280_0029, // mov w9, #1
        0x3900_0109, // strb w9, [x8]
        0x5280_0000, // mov w0, #0
        0xd65f_03c0, // ret
    ]);
    trampoline(&code)
}

/// A trampoline that loads one byte from the absolute address in
/// `values[0]`.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) fn load_byte() -> anyhow::Result<(CodeMemory, VMTrampoline)> {
    #[cfg(target_arch = "x86_64")]
    let code = vec![
        0x48, 0x8b, 0x06, // mov rax, [rsi]
        0x8a, 0x00, // mov al, [rax]
        0x31, 0xc0, // xor eax, eax
        0xc3, // ret
    ];
    #[cfg(target_arch = "aarch64")]
    let code = insns(&[
        0xf940_0028, // ldr x8, [x1]
        0x3940_0108, // ldrb w8, [x8]
        0x5280_0000, // mov w0, #0
        0xd65f_03c0, // ret
    ]);
    trampoline(&code)
}

/// A trampoline consisting of a single trap instruction carrying `imm`.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) fn trap_instruction(imm: u8) -> anyhow::Result<(CodeMemory, VMTrampoline)> {
    #[cfg(target_arch = "x86_64")]
    let code = vec![0x0f, 0x0b, imm, 0xc3]; // ud2; .byte imm
    #[cfg(target_arch = "aarch64")]
    let code = insns(&[0xd420_0000 | (u32::from(imm) << 5), 0xd65f_03c0]); // brk #imm
    trampoline(&code)
}
