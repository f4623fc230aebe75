//! The two halves of a row transaction.
//!
//! A request writes the argument row and waits until the EC starts replying.
//! A read waits until the reply is ready and pulls it out. Each function makes
//! exactly one attempt at its half. Whether and how to retry is decided by the
//! caller, except for the bounded completion poll at the end of a request which
//! must not be abandoned.

use std::time::Duration;

use log::Level;

use super::prefetch::PrefetchCache;
use super::protocol::*;
use super::row::EcRow;
use super::{EcError, EcResult, RegisterPort, Stage};
use crate::os_specific;

/// How often to try something and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }

    /// Wait for the EC to start its reply after a request: ~60ns on average
    pub const REQUEST_POLL: RetryPolicy = RetryPolicy::new(100, Duration::from_nanos(10));
    /// Retry whole request or read attempts that came back busy
    pub const ROW_RETRY: RetryPolicy = RetryPolicy::new(150, Duration::from_nanos(500));

    /// Run `op` until it returns something other than `Busy` or the attempts
    /// are used up. Returns the last result and how many attempts were made.
    pub fn run<T, F>(&self, mut op: F) -> (EcResult<T>, u32)
    where
        F: FnMut() -> EcResult<T>,
    {
        let mut ret = Err(EcError::Busy);
        for attempt in 1..=self.attempts {
            ret = op();
            match ret {
                Err(EcError::Busy) => {}
                _ => return (ret, attempt),
            }
            // No point in waiting after the last attempt
            if attempt < self.attempts {
                os_specific::delay(self.delay);
            }
        }
        (ret, self.attempts)
    }
}

fn read_str3<P: RegisterPort + ?Sized>(port: &mut P) -> Str3 {
    let raw = port.read_byte(TPC_STR3_OFFSET);
    let status = Str3::decode(raw);
    if log_enabled!(Level::Trace) {
        trace!("  STR3: {:#04X} -> {:?}", raw, status);
    }
    status
}

fn violation(stage: Stage, status: Str3) -> EcError {
    EcError::ProtocolViolation {
        stage,
        status: status.bits(),
    }
}

/// Tell the embedded controller to prepare a row.
///
/// On success the EC has started writing its reply and the row is waiting to
/// be read. `cache` is only consulted to decide whether a pending readout is
/// worth a warning.
pub fn request_row<P: RegisterPort + ?Sized>(
    port: &mut P,
    args: &EcRow,
    poll: &RetryPolicy,
    cache: &PrefetchCache,
    debug: bool,
) -> EcResult<()> {
    // EC protocol requires write to TWR0 (function code)
    if !args.is_valid_request() {
        error!("bad args->mask={:#06X}", args.mask);
        return Err(EcError::InvalidArgument { mask: args.mask });
    }
    let (arg0, arg_f) = (args.arg0(), args.arg_f());

    // Check initial status
    match read_str3(port) {
        Str3::Idle => {}
        status @ (Str3::ReplyReady | Str3::OutputPending(_)) => {
            // Marks end of previous transaction
            port.read_byte(TPC_TWR15_OFFSET);
            if debug || cache.is_none() {
                warn!(
                    "readout already pending: ({:#04X}:{:#04X})->{:#04X}",
                    arg0,
                    arg_f,
                    status.bits()
                );
            }
            // EC will be ready in a few usecs
            return Err(EcError::Busy);
        }
        Str3::SlaveWrite => {
            if debug || cache.is_none() {
                warn!(
                    "EC handles previous request: ({:#04X}:{:#04X})->{:#04X}",
                    arg0,
                    arg_f,
                    H8S_STR3_SWMF
                );
            }
            // Data will be pending in a few usecs
            return Err(EcError::Busy);
        }
        status @ (Str3::MasterWrite
        | Str3::InputPending
        | Str3::ReplyStarting(_)
        | Str3::Unexpected(_)) => {
            warn!(
                "bad initial STR3: ({:#04X}:{:#04X})->{:#04X}",
                arg0,
                arg_f,
                status.bits()
            );
            return Err(violation(Stage::RequestStart, status));
        }
    }

    // Send TWR0MW
    port.write_byte(TPC_TWR0_OFFSET, arg0);
    match read_str3(port) {
        Str3::MasterWrite => {}
        status => {
            warn!(
                "arg0 rejected: ({:#04X}:{:#04X})->{:#04X}",
                arg0,
                arg_f,
                status.bits()
            );
            return Err(violation(Stage::Arg0, status));
        }
    }

    // Send TWR1 through TWR14, the EC doesn't need the ones left out
    for i in 1..ROW_LEN - 1 {
        if args.is_set(i) {
            port.write_byte(twr_offset(i), args.val[i]);
        }
    }

    // Send TWR15. This marks end of command.
    port.write_byte(TPC_TWR15_OFFSET, arg_f);

    // Wait until EC starts writing its reply.
    // Releasing the lock before this happens may hang the EC due to a
    // firmware bug, so there's no bailing out early and no skipping the poll.
    let attempts = poll.attempts.max(1);
    let mut last = Str3::Idle;
    for attempt in 0..attempts {
        last = read_str3(port);
        match last {
            // EC started replying
            status if status.slave_write() => return Ok(()),
            // Normal progress, wait it out
            Str3::InputPending | Str3::Idle => {}
            status => {
                warn!(
                    "bad end STR3: ({:#04X}:{:#04X})->{:#04X}",
                    arg0,
                    arg_f,
                    status.bits()
                );
                return Err(violation(Stage::RequestEnd, status));
            }
        }
        if attempt + 1 < attempts {
            os_specific::delay(poll.delay);
        }
    }

    warn!(
        "EC is mysteriously silent: ({:#04X}:{:#04X})->{:#04X}",
        arg0,
        arg_f,
        last.bits()
    );
    Err(EcError::Busy)
}

/// Read current row data from the controller, assuming it's already requested.
///
/// Fills `data.val[i]` for slot 0, slot 15 and the slots selected by
/// `data.mask`. Other slots are left untouched.
pub fn read_data<P: RegisterPort + ?Sized>(port: &mut P, data: &mut EcRow) -> EcResult<()> {
    // Once a request is made, STR3 goes through the following values while
    // the EC reads the request and writes its data. This takes a few dozen
    // nanoseconds in total, with very high variance.
    match read_str3(port) {
        // Idle is indistinguishable from an EC that hasn't started yet.
        // Trust the caller that a request was made.
        Str3::InputPending | Str3::Idle | Str3::SlaveWrite => return Err(EcError::Busy),
        // Finally, the EC signals output buffer full
        Str3::ReplyReady => {}
        status @ (Str3::MasterWrite
        | Str3::OutputPending(_)
        | Str3::ReplyStarting(_)
        | Str3::Unexpected(_)) => {
            warn!("bad initial STR3 ({:#04X})", status.bits());
            return Err(violation(Stage::ReadStart, status));
        }
    }

    // First byte signals start of read transaction
    data.val[0] = port.read_byte(TPC_TWR0_OFFSET);
    for i in 1..ROW_LEN - 1 {
        if data.is_set(i) {
            data.val[i] = port.read_byte(twr_offset(i));
        }
    }
    // Last byte signals end of read transaction, whether the caller wants it or not
    data.val[ROW_LEN - 1] = port.read_byte(TPC_TWR15_OFFSET);

    if log_enabled!(Level::Trace) {
        trace!("  Read row: {:?}", data);
    }

    // Readout still pending?
    let status = read_str3(port);
    if status.output_full() {
        warn!("OBF3B=1 after read ({:#04X})", status.bits());
    }
    Ok(())
}
