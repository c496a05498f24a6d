//! Fixed x86-64 code sequences for stubs, targets and callers.
//!
//! The caller layouts below are the single source of truth for where a call
//! site's pointer operand lives. The fault interceptor only ever works with
//! [`CALL_SEQUENCE_LEN`] and [`OPERAND_OFFSET`]; [`verify_layout`] checks at
//! install time that the emitted bytes still agree with them.

use crate::error::{LinkError, Result};

/// Address the stub loads from. Page zero is never mapped.
pub const SENTINEL_ADDRESS: u32 = 9;

/// `movabs rax, imm64` opcode bytes.
const MOVABS_RAX: [u8; 2] = [0x48, 0xB8];
/// `call rax`
const CALL_RAX: [u8; 2] = [0xFF, 0xD0];

/// Offset of the 8-byte pointer operand inside the call sequence.
pub const OPERAND_OFFSET: usize = MOVABS_RAX.len();

/// Length of `movabs rax, imm64; call rax`. A return address minus this
/// value is the start of the call site.
pub const CALL_SEQUENCE_LEN: usize = MOVABS_RAX.len() + 8 + CALL_RAX.len();

/// Value the guarded caller keeps on the stack across the call.
pub const STACK_CANARY: u64 = 0x5AFE_C0DE_CAFE_F00D;

/// Returned by the guarded caller when the canary did not survive the call.
pub const UNBALANCED_STACK: i32 = -1;

/// Emits the placeholder body: `mov r10, qword [SENTINEL_ADDRESS]`.
pub struct StubEmitter;

impl StubEmitter {
    pub const LEN: usize = 8;

    pub fn emit() -> [u8; Self::LEN] {
        let addr = SENTINEL_ADDRESS.to_le_bytes();
        [0x4C, 0x8B, 0x14, 0x25, addr[0], addr[1], addr[2], addr[3]]
    }
}

/// Produces the body installed behind a call site on first use.
pub trait TargetEmitter {
    fn emit(&self) -> Vec<u8>;
}

/// `int f() { return N; }` with a frame-pointer prologue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantTarget(pub i32);

impl TargetEmitter for ConstantTarget {
    fn emit(&self) -> Vec<u8> {
        let mut code = Vec::with_capacity(8);
        code.push(0x55); // push rbp
        code.push(0xB8); // mov eax, imm32
        code.extend_from_slice(&self.0.to_le_bytes());
        code.push(0x5D); // pop rbp
        code.push(0xC3); // ret
        code
    }
}

impl TargetEmitter for Vec<u8> {
    fn emit(&self) -> Vec<u8> {
        self.clone()
    }
}

/// `movabs rax, operand; call rax`
pub fn call_sequence(operand: u64) -> [u8; CALL_SEQUENCE_LEN] {
    let mut seq = [0u8; CALL_SEQUENCE_LEN];
    seq[..OPERAND_OFFSET].copy_from_slice(&MOVABS_RAX);
    seq[OPERAND_OFFSET..OPERAND_OFFSET + 8].copy_from_slice(&operand.to_le_bytes());
    seq[OPERAND_OFFSET + 8..].copy_from_slice(&CALL_RAX);
    seq
}

/// The functions that call through a patchable pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerShape {
    /// `push rbp; <call sequence>; pop rbp; ret`
    Plain,
    /// Keeps [`STACK_CANARY`] on the stack across the call and returns
    /// [`UNBALANCED_STACK`] if it comes back different.
    Guarded,
}

const PLAIN_PROLOGUE: [u8; 1] = [0x55];
const PLAIN_EPILOGUE: [u8; 2] = [0x5D, 0xC3];

// push rbp; mov rbp, rsp; movabs rdx, imm64; push rdx
const GUARDED_PROLOGUE_LEN: usize = 1 + 3 + 10 + 1;

impl CallerShape {
    pub fn name(&self) -> &'static str {
        match self {
            CallerShape::Plain => "plain",
            CallerShape::Guarded => "guarded",
        }
    }

    /// Byte offset of the call sequence within the emitted caller.
    pub fn call_site_offset(&self) -> usize {
        match self {
            CallerShape::Plain => PLAIN_PROLOGUE.len(),
            CallerShape::Guarded => GUARDED_PROLOGUE_LEN,
        }
    }

    /// Offset of the pointer operand within the emitted caller.
    pub fn operand_offset(&self) -> usize {
        self.call_site_offset() + OPERAND_OFFSET
    }

    pub fn emit(&self, operand: u64) -> Vec<u8> {
        match self {
            CallerShape::Plain => {
                let mut code = Vec::with_capacity(16);
                code.extend_from_slice(&PLAIN_PROLOGUE);
                code.extend_from_slice(&call_sequence(operand));
                code.extend_from_slice(&PLAIN_EPILOGUE);
                code
            }
            CallerShape::Guarded => {
                let canary = STACK_CANARY.to_le_bytes();
                let mut code = Vec::with_capacity(64);
                code.push(0x55); // push rbp
                code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
                code.extend_from_slice(&[0x48, 0xBA]); // movabs rdx, canary
                code.extend_from_slice(&canary);
                code.push(0x52); // push rdx
                code.extend_from_slice(&call_sequence(operand));
                code.push(0x5A); // pop rdx
                code.extend_from_slice(&[0x48, 0xB9]); // movabs rcx, canary
                code.extend_from_slice(&canary);
                code.extend_from_slice(&[0x48, 0x39, 0xCA]); // cmp rdx, rcx
                code.extend_from_slice(&[0x74, 0x05]); // je epilogue
                code.push(0xB8); // mov eax, UNBALANCED_STACK
                code.extend_from_slice(&UNBALANCED_STACK.to_le_bytes());
                code.extend_from_slice(&[0x48, 0x89, 0xEC]); // mov rsp, rbp
                code.push(0x5D); // pop rbp
                code.push(0xC3); // ret
                code
            }
        }
    }
}

/// Checks that `code` carries the call sequence at the shape's call site.
pub fn verify_call_site(shape: CallerShape, code: &[u8], operand: u64) -> Result<()> {
    let site = shape.call_site_offset();
    let mismatch = |offset| LinkError::LayoutMismatch {
        shape: shape.name(),
        offset,
    };

    let seq = code.get(site..site + CALL_SEQUENCE_LEN).ok_or(mismatch(site))?;
    if seq[..OPERAND_OFFSET] != MOVABS_RAX {
        return Err(mismatch(site));
    }
    if seq[OPERAND_OFFSET..OPERAND_OFFSET + 8] != operand.to_le_bytes() {
        return Err(mismatch(shape.operand_offset()));
    }
    if seq[OPERAND_OFFSET + 8..] != CALL_RAX {
        return Err(mismatch(site + OPERAND_OFFSET + 8));
    }
    Ok(())
}

/// Emits every caller shape with a sample operand and verifies the layout.
pub fn verify_layout() -> Result<()> {
    const SAMPLE_OPERAND: u64 = 0x1122_3344_5566_7788;

    for shape in [CallerShape::Plain, CallerShape::Guarded] {
        verify_call_site(shape, &shape.emit(SAMPLE_OPERAND), SAMPLE_OPERAND)?;
    }
    Ok(())
}
