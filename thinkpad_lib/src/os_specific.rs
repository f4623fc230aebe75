//! Helper functions that need OS/platform specific implementations

use std::time::{Duration, Instant};
use std::{hint, thread};

/// Below this the scheduler can't sleep accurately, so we spin instead
const SPIN_THRESHOLD: Duration = Duration::from_micros(50);

/// Sleep a number of microseconds
pub fn sleep(micros: u64) {
    let duration = Duration::from_micros(micros);
    thread::sleep(duration);
}

/// Wait for `duration`, like the kernel's ndelay/udelay/msleep family.
///
/// Protocol delays are mostly in the nanosecond range where a real sleep
/// would cost a thousand times more than asked for. Those are busy-waited.
pub fn delay(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    if duration < SPIN_THRESHOLD {
        let start = Instant::now();
        while start.elapsed() < duration {
            hint::spin_loop();
        }
    } else {
        thread::sleep(duration);
    }
}
