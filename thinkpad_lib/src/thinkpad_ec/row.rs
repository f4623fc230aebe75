use core::fmt;

use super::protocol::{DEFAULT_ARG_F, ROW_LEN};

/// Slot 0 (function code) is always part of a request
pub const ROW_MASK_ARG0: u16 = 0x0001;
/// Slot 15 (terminator)
pub const ROW_MASK_ARG_F: u16 = 0x8000;

/// One row of arguments or results exchanged with the EC.
///
/// `val[i]` is meaningful iff bit `i` of `mask` is set. For a request that
/// means the byte is written to the EC, for a response that the caller wants
/// it filled in. Slots 0 and 15 of a response are always read, since reading
/// them is what delimits the transaction for the EC.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EcRow {
    pub mask: u16,
    pub val: [u8; ROW_LEN],
}

impl EcRow {
    pub const fn new(mask: u16, val: [u8; ROW_LEN]) -> Self {
        EcRow { mask, val }
    }

    /// Request consisting of just the function code and terminator
    pub const fn request(arg0: u8, arg_f: u8) -> Self {
        let mut val = [0; ROW_LEN];
        val[0] = arg0;
        val[ROW_LEN - 1] = arg_f;
        EcRow {
            mask: ROW_MASK_ARG0 | ROW_MASK_ARG_F,
            val,
        }
    }

    /// Empty response row that asks for the slots in `mask`
    pub const fn response(mask: u16) -> Self {
        EcRow {
            mask,
            val: [0; ROW_LEN],
        }
    }

    /// Set slot `i` and mark it as used
    pub fn with(mut self, i: usize, value: u8) -> Self {
        self.set(i, value);
        self
    }

    pub fn set(&mut self, i: usize, value: u8) {
        self.val[i] = value;
        self.mask |= 1 << i;
    }

    pub fn is_set(&self, i: usize) -> bool {
        (self.mask >> i) & 1 == 1
    }

    /// Whether this row satisfies the structural requirement of a request
    pub fn is_valid_request(&self) -> bool {
        self.mask & ROW_MASK_ARG0 != 0
    }

    pub fn arg0(&self) -> u8 {
        self.val[0]
    }

    /// Terminator byte as it goes on the wire
    pub fn arg_f(&self) -> u8 {
        if self.is_set(ROW_LEN - 1) {
            self.val[ROW_LEN - 1]
        } else {
            DEFAULT_ARG_F
        }
    }
}

impl fmt::Debug for EcRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcRow {{ mask: {:#06X}, val: [", self.mask)?;
        for (i, byte) in self.val.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if self.is_set(i) {
                write!(f, "{:02X}", byte)?;
            } else {
                write!(f, "--")?;
            }
        }
        write!(f, "] }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_anchors() {
        let row = EcRow::request(0x11, 0x01);
        assert!(row.is_valid_request());
        assert_eq!(row.mask, 0x8001);
        assert_eq!(row.arg0(), 0x11);
        assert_eq!(row.arg_f(), 0x01);
    }

    #[test]
    fn terminator_defaults_when_unset() {
        let row = EcRow::new(ROW_MASK_ARG0, [0x13; ROW_LEN]);
        assert_eq!(row.arg_f(), DEFAULT_ARG_F);
        let row = row.with(15, 0x00);
        assert_eq!(row.arg_f(), 0x00);
    }

    #[test]
    fn with_sets_mask_bits() {
        let row = EcRow::response(0).with(3, 0xAA).with(7, 0xBB);
        assert_eq!(row.mask, (1 << 3) | (1 << 7));
        assert!(!row.is_valid_request());
        assert!(row.is_set(3));
        assert!(!row.is_set(4));
    }

    #[test]
    fn debug_hides_unused_slots() {
        let row = EcRow::request(0x01, 0x00).with(1, 0xFF);
        assert_eq!(
            format!("{:?}", row),
            "EcRow { mask: 0x8003, val: [01 FF -- -- -- -- -- -- -- -- -- -- -- -- -- 00] }"
        );
    }
}
