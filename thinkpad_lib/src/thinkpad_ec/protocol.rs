// ThinkPad EC LPC channel 3, mapped onto the H8S bidirectional data registers.
// See "H8S/2104B Group Hardware Manual" for the STR3/TWR terminology.

/// Default first I/O port of the EC window
pub const TPC_BASE_PORT: u16 = 0x1600;
/// Number of ports in the EC window
pub const TPC_NUM_PORTS: u16 = 0x20;

/// Reads H8S EC register STR3
pub const TPC_STR3_OFFSET: u16 = 0x04;
/// Mapped to H8S EC register TWR0MW/SW
pub const TPC_TWR0_OFFSET: u16 = 0x10;
/// Mapped to H8S EC register TWR15
pub const TPC_TWR15_OFFSET: u16 = 0x1F;
// TWR0_OFFSET + i is mapped to TWRi for 0 < i < 15

/// Number of byte slots in a row
pub const ROW_LEN: usize = 16;

/// Written to TWR15 when the caller did not specify argF
pub const DEFAULT_ARG_F: u8 = 0x01;

// STR3 status flags
/// Bidi. Data Register Input Buffer Full
pub const H8S_STR3_IBF3B: u8 = 0x80;
/// Bidi. Data Register Output Buffer Full
pub const H8S_STR3_OBF3B: u8 = 0x40;
/// Master Write Mode Flag
pub const H8S_STR3_MWMF: u8 = 0x20;
/// Slave Write Mode Flag
pub const H8S_STR3_SWMF: u8 = 0x10;
/// All bits we care about in STR3
pub const H8S_STR3_MASK: u8 = 0xF0;

/// Register offset of row slot `i`
pub const fn twr_offset(i: usize) -> u16 {
    TPC_TWR0_OFFSET + i as u16
}

/// Decoded STR3 status
///
/// Only a handful of the 16 possible bit patterns show up during a healthy
/// transaction. Everything else is kept with its raw value so it can be
/// logged when the state machine rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Str3 {
    /// Nothing pending. Also what the EC shows for a moment right after
    /// accepting a request, so during a read it means "not ready yet".
    Idle,
    /// EC is producing a reply (or still handling a previous request)
    SlaveWrite,
    /// EC accepted arg0 and waits for the rest of the row
    MasterWrite,
    /// EC is consuming the request row
    InputPending,
    /// Reply row is ready to be read
    ReplyReady,
    /// Output buffer full together with some other combination of flags
    OutputPending(u8),
    /// Slave write mode plus other flags, but no output yet
    ReplyStarting(u8),
    /// Pattern with no meaning in this protocol
    Unexpected(u8),
}

impl Str3 {
    /// Classify a raw STR3 read. Bits outside of `H8S_STR3_MASK` are ignored.
    pub fn decode(raw: u8) -> Self {
        let str3 = raw & H8S_STR3_MASK;
        match str3 {
            0x00 => Str3::Idle,
            H8S_STR3_SWMF => Str3::SlaveWrite,
            H8S_STR3_MWMF => Str3::MasterWrite,
            x if x == H8S_STR3_IBF3B | H8S_STR3_MWMF => Str3::InputPending,
            x if x == H8S_STR3_OBF3B | H8S_STR3_SWMF => Str3::ReplyReady,
            x if x & H8S_STR3_OBF3B != 0 => Str3::OutputPending(x),
            x if x & H8S_STR3_SWMF != 0 => Str3::ReplyStarting(x),
            x => Str3::Unexpected(x),
        }
    }

    /// Masked status bits this value was decoded from
    pub fn bits(&self) -> u8 {
        match *self {
            Str3::Idle => 0x00,
            Str3::SlaveWrite => H8S_STR3_SWMF,
            Str3::MasterWrite => H8S_STR3_MWMF,
            Str3::InputPending => H8S_STR3_IBF3B | H8S_STR3_MWMF,
            Str3::ReplyReady => H8S_STR3_OBF3B | H8S_STR3_SWMF,
            Str3::OutputPending(x) | Str3::ReplyStarting(x) | Str3::Unexpected(x) => x,
        }
    }

    pub fn output_full(&self) -> bool {
        self.bits() & H8S_STR3_OBF3B != 0
    }

    /// EC is writing, no matter what else is going on
    pub fn slave_write(&self) -> bool {
        self.bits() & H8S_STR3_SWMF != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_protocol_patterns() {
        assert_eq!(Str3::decode(0x00), Str3::Idle);
        assert_eq!(Str3::decode(0x10), Str3::SlaveWrite);
        assert_eq!(Str3::decode(0x20), Str3::MasterWrite);
        assert_eq!(Str3::decode(0xA0), Str3::InputPending);
        assert_eq!(Str3::decode(0x50), Str3::ReplyReady);
    }

    #[test]
    fn ignores_low_nibble() {
        assert_eq!(Str3::decode(0x0F), Str3::Idle);
        assert_eq!(Str3::decode(0x5A), Str3::ReplyReady);
        assert_eq!(Str3::decode(0x2C), Str3::MasterWrite);
    }

    #[test]
    fn classifies_leftovers() {
        assert_eq!(Str3::decode(0x40), Str3::OutputPending(0x40));
        assert_eq!(Str3::decode(0xD0), Str3::OutputPending(0xD0));
        assert_eq!(Str3::decode(0x30), Str3::ReplyStarting(0x30));
        assert_eq!(Str3::decode(0x90), Str3::ReplyStarting(0x90));
        assert_eq!(Str3::decode(0x80), Str3::Unexpected(0x80));
        assert_eq!(Str3::decode(0xA0 & 0x80), Str3::Unexpected(0x80));
    }

    #[test]
    fn slave_write_flag() {
        for raw in [0x10, 0x30, 0x50, 0x70, 0xD0, 0xF0] {
            assert!(Str3::decode(raw).slave_write());
        }
        for raw in [0x00, 0x20, 0x40, 0xA0] {
            assert!(!Str3::decode(raw).slave_write());
        }
    }

    #[test]
    fn every_pattern_round_trips_its_bits() {
        for high in 0..16u8 {
            let raw = high << 4;
            let status = Str3::decode(raw);
            assert_eq!(status.bits(), raw, "{:?}", status);
            assert_eq!(status.output_full(), raw & H8S_STR3_OBF3B != 0);
        }
    }

    #[test]
    fn slot_offsets() {
        assert_eq!(twr_offset(0), TPC_TWR0_OFFSET);
        assert_eq!(twr_offset(ROW_LEN - 1), TPC_TWR15_OFFSET);
    }
}
