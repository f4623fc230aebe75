//! Real hardware access through x86 port I/O.
//!
//! Userspace needs permission for the port range before touching it.
//! On Linux that's `ioperm`, which requires root.

use hwio::{Io, Pio};
#[cfg(target_os = "linux")]
use libc::ioperm;
use log::Level;
#[cfg(target_os = "linux")]
use nix::unistd::Uid;
use spin::Mutex;

use super::protocol::TPC_NUM_PORTS;
use super::{EcError, EcResult, RegisterPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Initialized {
    NotYet,
    Succeeded { base: u16 },
    Failed,
}

lazy_static! {
    static ref INITIALIZED: Mutex<Initialized> = Mutex::new(Initialized::NotYet);
}

/// The EC register window at `base..base + TPC_NUM_PORTS`
#[derive(Debug)]
pub struct PortIo {
    base: u16,
}

impl PortIo {
    /// Request access to the register window at `base`.
    /// Only one window can be claimed at a time.
    pub fn claim(base: u16) -> EcResult<Self> {
        let mut init = INITIALIZED.lock();
        match *init {
            Initialized::NotYet => {}
            Initialized::Succeeded { base: claimed } => {
                return Err(EcError::DeviceError(format!(
                    "thinkpad_ec ports {:#06X}-{:#06X} already claimed",
                    claimed,
                    claimed + TPC_NUM_PORTS - 1
                )));
            }
            // Can directly give up, trying again won't help
            Initialized::Failed => {
                return Err(EcError::DeviceError(
                    "Port I/O access was denied before".to_string(),
                ));
            }
        }

        #[cfg(target_os = "linux")]
        {
            if !Uid::effective().is_root() {
                error!("Must be root to use port based I/O for EC communication.");
                *init = Initialized::Failed;
                return Err(EcError::DeviceError(
                    "Must be root to use port based I/O".to_string(),
                ));
            }
            let res = unsafe { ioperm(base.into(), TPC_NUM_PORTS.into(), 1) };
            if res != 0 {
                error!("ioperm failed. portio driver is likely block by Linux kernel lockdown mode");
                *init = Initialized::Failed;
                return Err(EcError::DeviceError(format!(
                    "thinkpad_ec cannot claim ports {:#06X}-{:#06X}",
                    base,
                    base + TPC_NUM_PORTS - 1
                )));
            }
        }

        debug!(
            "Claimed ports {:#06X}-{:#06X}",
            base,
            base + TPC_NUM_PORTS - 1
        );
        *init = Initialized::Succeeded { base };
        Ok(PortIo { base })
    }
}

impl RegisterPort for PortIo {
    fn read_byte(&mut self, offset: u16) -> u8 {
        let value = Pio::<u8>::new(self.base + offset).read();
        if log_enabled!(Level::Trace) {
            trace!("inb({:#06X}) = {:#04X}", self.base + offset, value);
        }
        value
    }

    fn write_byte(&mut self, offset: u16, value: u8) {
        if log_enabled!(Level::Trace) {
            trace!("outb({:#06X}, {:#04X})", self.base + offset, value);
        }
        Pio::<u8>::new(self.base + offset).write(value);
    }
}

impl Drop for PortIo {
    fn drop(&mut self) {
        let mut init = INITIALIZED.lock();
        #[cfg(target_os = "linux")]
        unsafe {
            if ioperm(self.base.into(), TPC_NUM_PORTS.into(), 0) != 0 {
                warn!("Failed to release ports at {:#06X}", self.base);
            }
        }
        *init = Initialized::NotYet;
    }
}
