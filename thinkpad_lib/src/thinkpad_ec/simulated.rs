//! In-memory stand-in for the EC register window.
//!
//! Follows the STR3 sequence a real H8S goes through during a row
//! transaction, with adjustable latency, and records every register access
//! so tests can check exactly what the protocol engine did.

use std::collections::VecDeque;
use std::thread::{self, ThreadId};

use super::protocol::*;
use super::RegisterPort;

/// Computes the reply row from the request registers
pub type Responder = Box<dyn FnMut(&[u8; ROW_LEN]) -> [u8; ROW_LEN] + Send>;

/// One register access, in the order it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read {
        offset: u16,
        value: u8,
        thread: ThreadId,
    },
    Write {
        offset: u16,
        value: u8,
        thread: ThreadId,
    },
}

impl Access {
    pub fn offset(&self) -> u16 {
        match *self {
            Access::Read { offset, .. } | Access::Write { offset, .. } => offset,
        }
    }

    pub fn thread(&self) -> ThreadId {
        match *self {
            Access::Read { thread, .. } | Access::Write { thread, .. } => thread,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// arg0 written, collecting the rest of the row
    Receiving,
    /// Row complete, EC still reading it. Counts down polls.
    Processing(u32),
    /// EC writing its reply. Counts down polls.
    Replying(u32),
    /// Output buffer full
    Ready,
    /// Host started reading the reply
    Reading,
    /// Stuck in slave write mode forever
    Stuck,
}

/// Default reply: argF is echoed, the other bytes derive from arg0
pub fn default_responder(request: &[u8; ROW_LEN]) -> [u8; ROW_LEN] {
    let mut reply = [0; ROW_LEN];
    for (i, byte) in reply.iter_mut().enumerate() {
        *byte = request[0].wrapping_add((i as u8).wrapping_mul(0x11));
    }
    reply[ROW_LEN - 1] = request[ROW_LEN - 1];
    reply
}

pub struct SimulatedEc {
    phase: Phase,
    regs: [u8; ROW_LEN],
    last_request: [u8; ROW_LEN],
    last_reply: [u8; ROW_LEN],
    accept_latency: u32,
    reply_latency: u32,
    forced_status: VecDeque<u8>,
    responder: Responder,
    accesses: Vec<Access>,
    hung: bool,
}

impl Default for SimulatedEc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEc {
    /// EC that accepts requests and replies right away
    pub fn new() -> Self {
        SimulatedEc {
            phase: Phase::Idle,
            regs: [0; ROW_LEN],
            last_request: [0; ROW_LEN],
            last_reply: [0; ROW_LEN],
            accept_latency: 0,
            reply_latency: 0,
            forced_status: VecDeque::new(),
            responder: Box::new(default_responder),
            accesses: vec![],
            hung: false,
        }
    }

    pub fn with_responder(responder: Responder) -> Self {
        SimulatedEc {
            responder,
            ..Self::new()
        }
    }

    /// Number of "input pending" polls before the EC starts replying
    pub fn set_accept_latency(&mut self, polls: u32) {
        self.accept_latency = polls;
    }

    /// Number of "slave write" polls before the reply is ready
    pub fn set_reply_latency(&mut self, polls: u32) {
        self.reply_latency = polls;
    }

    /// Pretend to be busy with some earlier request that never finishes
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.phase = if stuck { Phase::Stuck } else { Phase::Idle };
    }

    /// Return `raw` on the next STR3 read instead of the real status
    pub fn push_status(&mut self, raw: u8) {
        self.forced_status.push_back(raw);
    }

    /// Set when a request was written while the firmware was mid-transaction.
    /// The real EC hangs until reboot in that case.
    pub fn is_hung(&self) -> bool {
        self.hung
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn clear_accesses(&mut self) {
        self.accesses.clear();
    }

    pub fn reads_of(&self, offset: u16) -> usize {
        self.accesses
            .iter()
            .filter(|a| matches!(a, Access::Read { offset: o, .. } if *o == offset))
            .count()
    }

    pub fn status_reads(&self) -> usize {
        self.reads_of(TPC_STR3_OFFSET)
    }

    pub fn writes(&self) -> usize {
        self.accesses
            .iter()
            .filter(|a| matches!(a, Access::Write { .. }))
            .count()
    }

    /// Request registers as they were when the last row was submitted
    pub fn last_request(&self) -> [u8; ROW_LEN] {
        self.last_request
    }

    pub fn last_reply(&self) -> [u8; ROW_LEN] {
        self.last_reply
    }

    fn status(&mut self) -> u8 {
        if let Some(raw) = self.forced_status.pop_front() {
            return raw;
        }
        match self.phase {
            Phase::Idle => 0x00,
            Phase::Receiving => H8S_STR3_MWMF,
            Phase::Processing(0) => {
                self.phase = Phase::Replying(self.reply_latency);
                H8S_STR3_SWMF
            }
            Phase::Processing(n) => {
                self.phase = Phase::Processing(n - 1);
                H8S_STR3_IBF3B | H8S_STR3_MWMF
            }
            Phase::Replying(0) => {
                self.phase = Phase::Ready;
                H8S_STR3_OBF3B | H8S_STR3_SWMF
            }
            Phase::Replying(n) => {
                self.phase = Phase::Replying(n - 1);
                H8S_STR3_SWMF
            }
            Phase::Ready | Phase::Reading => H8S_STR3_OBF3B | H8S_STR3_SWMF,
            Phase::Stuck => H8S_STR3_SWMF,
        }
    }

    fn write_slot(&mut self, slot: usize, value: u8) {
        match (slot, self.phase) {
            (0, Phase::Idle) => {
                self.regs = [0; ROW_LEN];
                self.regs[0] = value;
                self.phase = Phase::Receiving;
            }
            (ROW_LEN_LAST, Phase::Receiving) => {
                self.regs[slot] = value;
                self.last_request = self.regs;
                self.last_reply = (self.responder)(&self.regs);
                self.regs = self.last_reply;
                self.phase = Phase::Processing(self.accept_latency);
            }
            (_, Phase::Receiving) => self.regs[slot] = value,
            // Writing into a transaction that isn't ours
            _ => self.hung = true,
        }
    }

    fn read_slot(&mut self, slot: usize) -> u8 {
        let value = self.regs[slot];
        match slot {
            0 => {
                if self.phase == Phase::Ready {
                    self.phase = Phase::Reading;
                }
            }
            ROW_LEN_LAST => {
                if matches!(
                    self.phase,
                    Phase::Ready | Phase::Reading | Phase::Replying(_)
                ) {
                    self.phase = Phase::Idle;
                }
            }
            _ => {}
        }
        value
    }
}

const ROW_LEN_LAST: usize = ROW_LEN - 1;

impl RegisterPort for SimulatedEc {
    fn read_byte(&mut self, offset: u16) -> u8 {
        let value = match offset {
            TPC_STR3_OFFSET => self.status(),
            TPC_TWR0_OFFSET..=TPC_TWR15_OFFSET => {
                self.read_slot(usize::from(offset - TPC_TWR0_OFFSET))
            }
            _ => 0xFF,
        };
        self.accesses.push(Access::Read {
            offset,
            value,
            thread: thread::current().id(),
        });
        value
    }

    fn write_byte(&mut self, offset: u16, value: u8) {
        self.accesses.push(Access::Write {
            offset,
            value,
            thread: thread::current().id(),
        });
        if let TPC_TWR0_OFFSET..=TPC_TWR15_OFFSET = offset {
            self.write_slot(usize::from(offset - TPC_TWR0_OFFSET), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str3(ec: &mut SimulatedEc) -> u8 {
        ec.read_byte(TPC_STR3_OFFSET)
    }

    #[test]
    fn walks_through_transaction() {
        let mut ec = SimulatedEc::new();
        ec.set_accept_latency(1);
        ec.set_reply_latency(1);
        assert_eq!(str3(&mut ec), 0x00);
        ec.write_byte(TPC_TWR0_OFFSET, 0x11);
        assert_eq!(str3(&mut ec), 0x20);
        ec.write_byte(TPC_TWR15_OFFSET, 0x01);
        assert_eq!(str3(&mut ec), 0xA0);
        assert_eq!(str3(&mut ec), 0x10);
        assert_eq!(str3(&mut ec), 0x10);
        assert_eq!(str3(&mut ec), 0x50);
        let first = ec.read_byte(TPC_TWR0_OFFSET);
        assert_eq!(str3(&mut ec), 0x50);
        let last = ec.read_byte(TPC_TWR15_OFFSET);
        assert_eq!(str3(&mut ec), 0x00);
        assert_eq!(first, 0x11);
        assert_eq!(last, 0x01);
        assert!(!ec.is_hung());
    }

    #[test]
    fn write_during_reply_hangs() {
        let mut ec = SimulatedEc::new();
        ec.write_byte(TPC_TWR0_OFFSET, 0x11);
        ec.write_byte(TPC_TWR15_OFFSET, 0x01);
        ec.write_byte(TPC_TWR0_OFFSET, 0x13);
        assert!(ec.is_hung());
    }

    #[test]
    fn custom_responder() {
        let mut ec = SimulatedEc::with_responder(Box::new(|req: &[u8; ROW_LEN]| {
            let mut reply = *req;
            reply[1] = 0x42;
            reply
        }));
        ec.write_byte(TPC_TWR0_OFFSET, 0x13);
        ec.write_byte(TPC_TWR15_OFFSET, 0x01);
        assert_eq!(ec.last_reply()[1], 0x42);
        assert_eq!(ec.last_request()[0], 0x13);
    }

    #[test]
    fn forced_status_wins() {
        let mut ec = SimulatedEc::new();
        ec.push_status(0xF0);
        assert_eq!(str3(&mut ec), 0xF0);
        assert_eq!(str3(&mut ec), 0x00);
        assert_eq!(ec.status_reads(), 2);
    }
}
