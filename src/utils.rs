use log::debug;

use crate::arena::CodeBuffer;

/// One-line dump: `name @ 0x... (n bytes) = xx xx ...`
pub fn format_buffer(name: &str, buffer: &CodeBuffer) -> String {
    format_bytes(name, buffer.base(), buffer.bytes())
}

pub fn format_bytes(name: &str, address: usize, content: &[u8]) -> String {
    let line = format!("{} @ 0x{:x} ({} bytes) =", name, address, content.len());
    push_hex(line, content)
}

/// Dump of code that has not been placed in memory yet, so has no address.
pub fn format_unplaced(name: &str, content: &[u8]) -> String {
    let line = format!("{} ({} bytes, not allocated) =", name, content.len());
    push_hex(line, content)
}

fn push_hex(mut line: String, content: &[u8]) -> String {
    for byte in content {
        line.push_str(&format!(" {:02x}", byte));
    }
    line
}

/// Logs `content` at debug level, 16 bytes per row with an ASCII column.
pub fn log_memory_content(content: &[u8], address: usize) {
    for row in hex_rows(content, address) {
        debug!("{}", row);
    }
}

pub fn hex_rows(content: &[u8], address: usize) -> Vec<String> {
    const BYTES_PER_ROW: usize = 16;
    let mut rows = Vec::new();

    for (i, chunk) in content.chunks(BYTES_PER_ROW).enumerate() {
        let mut hex_line = format!("0x{:08x}: ", address + i * BYTES_PER_ROW);

        for (j, byte) in chunk.iter().enumerate() {
            hex_line.push_str(&format!("{:02x} ", byte));
            if j == 7 {
                hex_line.push(' ');
            }
        }

        if chunk.len() < BYTES_PER_ROW {
            let spaces = (BYTES_PER_ROW - chunk.len()) * 3 + if chunk.len() <= 8 { 1 } else { 0 };
            hex_line.push_str(&" ".repeat(spaces));
        }

        hex_line.push_str(" | ");
        for &byte in chunk {
            if (32..=126).contains(&byte) {
                hex_line.push(byte as char);
            } else {
                hex_line.push('.');
            }
        }

        rows.push(hex_line);
    }

    rows
}
