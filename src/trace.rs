//! Minimal instruction disassembler for the single-step tracer.
//!
//! None of the example stacks pull in a disassembler crate, so this is
//! a hand-rolled decoder for the handful of opcodes a Linux boot path
//! actually exercises (moves, jumps, calls, the flag/privileged
//! instructions, stack ops). Anything outside that set is printed as a
//! raw byte literal rather than mis-decoded.

/// Decodes one instruction starting at `bytes[0]`, returning a
/// human-readable mnemonic and the instruction's length in bytes.
/// `bytes` must have enough trailing bytes for the longest encoding
/// this function recognizes (5); short reads near the end of a page
/// fall back to the single-byte form.
pub fn disassemble_one(bytes: &[u8]) -> (String, usize) {
    let Some(&opcode) = bytes.first() else {
        return ("(no bytes)".to_string(), 0);
    };

    match opcode {
        0x90 => ("nop".to_string(), 1),
        0xf4 => ("hlt".to_string(), 1),
        0xfa => ("cli".to_string(), 1),
        0xfb => ("sti".to_string(), 1),
        0xc3 => ("ret".to_string(), 1),
        0xcc => ("int3".to_string(), 1),
        0x50..=0x57 => (format!("push r{}", opcode - 0x50), 1),
        0x58..=0x5f => (format!("pop r{}", opcode - 0x58), 1),
        0xcd if bytes.len() >= 2 => (format!("int 0x{:02x}", bytes[1]), 2),
        0xeb if bytes.len() >= 2 => (format!("jmp short {:+}", bytes[1] as i8), 2),
        0x70..=0x7f if bytes.len() >= 2 => {
            (format!("jcc 0x{:x} {:+}", opcode, bytes[1] as i8), 2)
        }
        0xb8..=0xbf if bytes.len() >= 5 => {
            let imm = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
            (format!("mov r{}, 0x{:x}", opcode - 0xb8, imm), 5)
        }
        0xe8 if bytes.len() >= 5 => {
            let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
            (format!("call {:+}", rel), 5)
        }
        0xe9 if bytes.len() >= 5 => {
            let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
            (format!("jmp {:+}", rel), 5)
        }
        _ => (format!("db 0x{:02x}", opcode), 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_nop_and_hlt() {
        assert_eq!(disassemble_one(&[0x90]), ("nop".to_string(), 1));
        assert_eq!(disassemble_one(&[0xf4]), ("hlt".to_string(), 1));
    }

    #[test]
    fn test_decodes_mov_immediate() {
        let (text, len) = disassemble_one(&[0xb8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(text, "mov r0, 0x12345678");
        assert_eq!(len, 5);
    }

    #[test]
    fn test_unknown_opcode_falls_back_to_byte_literal() {
        assert_eq!(disassemble_one(&[0x0f]), ("db 0x0f".to_string(), 1));
    }

    #[test]
    fn test_empty_slice() {
        assert_eq!(disassemble_one(&[]), ("(no bytes)".to_string(), 0));
    }
}
