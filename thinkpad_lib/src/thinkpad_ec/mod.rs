//! Access to the ThinkPad embedded controller and mutual exclusion for it.
//!
//! The EC offers a non-standard mailbox interface at I/O ports 0x1600-0x161F
//! (LPC channel 3 of the H8S chip). A caller writes a row of 16 argument
//! bytes, the EC computes something (battery status, accelerometer readout,
//! ...) and the caller reads back a row of 16 result bytes. Only one
//! transaction can be in flight, and getting the sequence wrong can hang the
//! EC until reboot.
//!
//! All access goes through [`ThinkpadEc`]. Lock it, use the row operations on
//! the returned [`EcGuard`], drop or [`EcGuard::unlock`] it:
//!
//! ```
//! use thinkpad_lib::thinkpad_ec::{EcOptions, EcRow, ThinkpadEc};
//! use thinkpad_lib::thinkpad_ec::simulated::SimulatedEc;
//!
//! let ec = ThinkpadEc::new(SimulatedEc::new(), EcOptions::default());
//! let mut data = EcRow::response(0xFFFF);
//! let mut guard = ec.lock();
//! guard.read_row(&EcRow::request(0x01, 0x00), &mut data).unwrap();
//! guard.unlock();
//! ```

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::os_specific;

#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    any(feature = "linux_pio", feature = "freebsd_pio")
))]
pub mod portio;
pub mod prefetch;
pub mod protocol;
pub mod row;
pub mod simulated;
pub mod transaction;

use prefetch::{PrefetchCache, DEFAULT_PREFETCH_TTL};
pub use row::EcRow;
pub use transaction::RetryPolicy;

/// How long to wait between attempts of an interruptible lock, in microseconds
const LOCK_POLL_MICROS: u64 = 100;

/// Raw byte access to the EC register window.
///
/// Offsets are relative to the start of the window. Every access may change
/// EC state, so implementations must perform each call exactly once and in
/// order.
pub trait RegisterPort {
    fn read_byte(&mut self, offset: u16) -> u8;
    fn write_byte(&mut self, offset: u16, value: u8);
}

impl<P: RegisterPort + ?Sized> RegisterPort for Box<P> {
    fn read_byte(&mut self, offset: u16) -> u8 {
        (**self).read_byte(offset)
    }
    fn write_byte(&mut self, offset: u16, value: u8) {
        (**self).write_byte(offset, value)
    }
}

/// Point in the protocol where an unexpected status showed up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Status check before writing a request
    RequestStart,
    /// Status check after writing the function code
    Arg0,
    /// Waiting for the EC to start replying
    RequestEnd,
    /// Status check before reading a reply
    ReadStart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::RequestStart => "initial request status",
            Stage::Arg0 => "arg0 acceptance",
            Stage::RequestEnd => "request completion",
            Stage::ReadStart => "initial read status",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcError {
    /// Request row doesn't have arg0 marked as present
    InvalidArgument { mask: u16 },
    /// EC not ready yet. Try again.
    Busy,
    /// EC showed a status that makes no sense at this point
    ProtocolViolation { stage: Stage, status: u8 },
    /// Row wasn't prefetched, or the prefetch went stale
    NoData,
    /// Gave up waiting for the lock
    Interrupted,
    /// Failed to set up access to the EC
    DeviceError(String),
}

impl EcError {
    /// Whether trying again later can help
    pub fn is_transient(&self) -> bool {
        matches!(self, EcError::Busy | EcError::NoData)
    }
}

impl fmt::Display for EcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcError::InvalidArgument { mask } => {
                write!(f, "Invalid request row mask {:#06X}, arg0 is required", mask)
            }
            EcError::Busy => write!(f, "EC is busy"),
            EcError::ProtocolViolation { stage, status } => {
                write!(f, "EC protocol violation at {}: STR3={:#04X}", stage, status)
            }
            EcError::NoData => write!(f, "Row not prefetched"),
            EcError::Interrupted => write!(f, "Interrupted while waiting for the EC lock"),
            EcError::DeviceError(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EcError {}

pub type EcResult<T> = Result<T, EcError>;

/// Protocol timing, see [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcTiming {
    /// Polling for the EC to start replying after a request
    pub request_poll: RetryPolicy,
    /// Retrying request and read attempts in [`EcGuard::read_row`]
    pub row_retry: RetryPolicy,
    /// How long a prefetched row stays valid
    pub prefetch_ttl: Duration,
}

impl Default for EcTiming {
    fn default() -> Self {
        EcTiming {
            request_poll: RetryPolicy::REQUEST_POLL,
            row_retry: RetryPolicy::ROW_RETRY,
            prefetch_ttl: DEFAULT_PREFETCH_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcOptions {
    pub timing: EcTiming,
    /// Log anomalies that are expected under normal operation as well
    pub debug: bool,
}

struct EcState<P> {
    port: P,
    prefetch: PrefetchCache,
}

/// Driver context: the register window, its lock and the prefetch state
pub struct ThinkpadEc<P: RegisterPort> {
    state: Mutex<EcState<P>>,
    options: EcOptions,
}

impl<P: RegisterPort> ThinkpadEc<P> {
    pub fn new(port: P, options: EcOptions) -> Self {
        ThinkpadEc {
            state: Mutex::new(EcState {
                port,
                prefetch: PrefetchCache::new(options.timing.prefetch_ttl),
            }),
            options,
        }
    }

    /// Set up the driver and make sure the EC actually follows the protocol
    pub fn attach(port: P, options: EcOptions) -> EcResult<Self> {
        let ec = Self::new(port, options);
        if let Err(err) = ec.probe() {
            info!("initial ec test failed: {}", err);
            return Err(err);
        }
        info!("thinkpad_ec {} attached", crate::built_info::PKG_VERSION);
        Ok(ec)
    }

    pub fn options(&self) -> &EcOptions {
        &self.options
    }

    /// Make an arbitrary harmless EC request (battery 0 basic status) and
    /// see whether the EC follows protocol.
    pub fn probe(&self) -> EcResult<()> {
        let args = EcRow::request(0x01, 0x00);
        self.locked_read_row(&args, 0x0000).map(|_| ())
    }

    /// Lock, read one row, unlock
    pub fn locked_read_row(&self, args: &EcRow, mask: u16) -> EcResult<EcRow> {
        let mut data = EcRow::response(mask);
        let mut guard = self.lock();
        guard.read_row(args, &mut data)?;
        guard.unlock();
        Ok(data)
    }

    /// Get exclusive access to the controller. May block.
    pub fn lock(&self) -> EcGuard<'_, P> {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => self.recover(poisoned.into_inner()),
        };
        self.guard(state)
    }

    /// Like [`ThinkpadEc::lock`] but gives up once `abort` is raised
    pub fn lock_interruptible(&self, abort: &AtomicBool) -> EcResult<EcGuard<'_, P>> {
        loop {
            if abort.load(Ordering::Acquire) {
                if self.options.debug {
                    debug!("EC lock wait interrupted");
                }
                return Err(EcError::Interrupted);
            }
            match self.try_lock() {
                Err(EcError::Busy) => os_specific::sleep(LOCK_POLL_MICROS),
                ret => return ret,
            }
        }
    }

    /// Get exclusive access to the controller, but only if it's available.
    /// Never blocks.
    pub fn try_lock(&self) -> EcResult<EcGuard<'_, P>> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return Err(EcError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => self.recover(poisoned.into_inner()),
        };
        Ok(self.guard(state))
    }

    fn guard<'a>(&'a self, state: MutexGuard<'a, EcState<P>>) -> EcGuard<'a, P> {
        EcGuard {
            state,
            options: &self.options,
            raw_access: false,
        }
    }

    /// Somebody panicked while holding the lock. Whatever they did to the EC,
    /// the prefetch state can't be trusted anymore.
    fn recover<'a>(
        &'a self,
        mut state: MutexGuard<'a, EcState<P>>,
    ) -> MutexGuard<'a, EcState<P>> {
        warn!("EC lock holder panicked, invalidating prefetch");
        state.prefetch.invalidate();
        self.state.clear_poison();
        state
    }
}

/// Exclusive access to the controller. Released when dropped.
pub struct EcGuard<'a, P: RegisterPort> {
    state: MutexGuard<'a, EcState<P>>,
    options: &'a EcOptions,
    raw_access: bool,
}

impl<'a, P: RegisterPort> EcGuard<'a, P> {
    /// Read a data row from the controller, fetching and retrying if needed.
    ///
    /// `data.val[i]` is only guaranteed to be filled in if bit `i` of
    /// `data.mask` is set, or for slots 0 and 15.
    pub fn read_row(&mut self, args: &EcRow, data: &mut EcRow) -> EcResult<()> {
        let timing = self.options.timing;
        let debug = self.options.debug;
        let EcState { port, prefetch } = &mut *self.state;

        let ret = if !args.is_valid_request() {
            error!("bad args->mask={:#06X}", args.mask);
            Err(EcError::InvalidArgument { mask: args.mask })
        } else if prefetch.is_fetched(args.arg0(), args.arg_f()) {
            // Already requested
            read_with_retries(port, args, data, &timing)
        } else {
            let (ret, attempts) = timing.row_retry.run(|| {
                transaction::request_row(&mut *port, args, &timing.request_poll, prefetch, debug)
            });
            match ret {
                Ok(()) => read_with_retries(port, args, data, &timing),
                Err(err) => {
                    error!(
                        "failed requesting row: ({:#04X}:{:#04X}) after {} attempts: {}",
                        args.arg0(),
                        args.arg_f(),
                        attempts,
                        err
                    );
                    Err(err)
                }
            }
        };

        // Consumed or abandoned, either way nothing valid is left
        prefetch.invalidate();
        ret
    }

    /// Read a prefetched row. Don't fetch, don't retry.
    ///
    /// Returns [`EcError::NoData`] if the row wasn't prefetched and
    /// [`EcError::Busy`] if the data isn't ready yet.
    pub fn try_read_row(&mut self, args: &EcRow, data: &mut EcRow) -> EcResult<()> {
        if !args.is_valid_request() {
            return Err(EcError::InvalidArgument { mask: args.mask });
        }
        let EcState { port, prefetch } = &mut *self.state;
        if !prefetch.is_fetched(args.arg0(), args.arg_f()) {
            return Err(EcError::NoData);
        }
        match transaction::read_data(port, data) {
            Ok(()) => {
                // Eaten up
                prefetch.consume();
                Ok(())
            }
            // Still prefetched, the caller can come back later
            Err(EcError::Busy) => Err(EcError::Busy),
            Err(err) => {
                prefetch.invalidate();
                Err(err)
            }
        }
    }

    /// Prefetch a data row from the controller. One attempt, no retries.
    ///
    /// A subsequent [`EcGuard::read_row`] with the same anchors is faster,
    /// and [`EcGuard::try_read_row`] stands a good chance of succeeding if
    /// done neither too soon nor too late.
    pub fn prefetch_row(&mut self, args: &EcRow) -> EcResult<()> {
        let timing = self.options.timing;
        let debug = self.options.debug;
        let EcState { port, prefetch } = &mut *self.state;
        let ret = transaction::request_row(port, args, &timing.request_poll, prefetch, debug);
        match ret {
            Ok(()) => prefetch.store(args.arg0(), args.arg_f()),
            Err(_) => prefetch.invalidate(),
        }
        ret
    }

    /// Forget about any prefetched row.
    /// Must be called before unlocking by any code that accesses the registers
    /// directly. [`EcGuard::raw`] takes care of that automatically.
    pub fn invalidate(&mut self) {
        self.state.prefetch.invalidate();
    }

    /// Direct register access for sequences the row API doesn't cover.
    /// The prefetch state is invalidated when the guard is released.
    pub fn raw(&mut self) -> &mut P {
        self.raw_access = true;
        &mut self.state.port
    }

    /// Look at the backend without touching the registers
    pub fn port(&self) -> &P {
        &self.state.port
    }

    /// Release the controller lock
    pub fn unlock(self) {
        drop(self)
    }
}

impl<'a, P: RegisterPort> Drop for EcGuard<'a, P> {
    fn drop(&mut self) {
        if self.raw_access {
            self.state.prefetch.invalidate();
        }
    }
}

fn read_with_retries<P: RegisterPort>(
    port: &mut P,
    args: &EcRow,
    data: &mut EcRow,
    timing: &EcTiming,
) -> EcResult<()> {
    let (ret, attempts) = timing
        .row_retry
        .run(|| transaction::read_data(&mut *port, &mut *data));
    if let Err(err) = &ret {
        error!(
            "failed waiting for data: ({:#04X}:{:#04X}) after {} attempts: {}",
            args.arg0(),
            args.arg_f(),
            attempts,
            err
        );
    }
    ret
}
