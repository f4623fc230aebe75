//! Miscellaneous utility functions to use across modules

use std::fmt::Write;

/// Format a byte buffer as space separated hex, e.g. `0x01 0xFF 0x00`
pub fn format_buffer(buffer: &[u8]) -> String {
    let mut out = String::with_capacity(buffer.len() * 5);
    for (i, byte) in buffer.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:#04X}", byte);
    }
    out
}

pub fn print_buffer(buffer: &[u8]) {
    println!("{}", format_buffer(buffer));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hex() {
        assert_eq!(format_buffer(&[0x01, 0xFF, 0x00]), "0x01 0xFF 0x00");
        assert_eq!(format_buffer(&[]), "");
    }
}
