use crate::hal::platform;

pub fn get_us() -> u64 {
    platform().tick_microseconds()
}

pub fn wait_microseconds(us: u64) {
    platform().sleep_microseconds(us)
}

pub fn wait_milliseconds(ms: u64) {
    wait_microseconds(ms * 1000)
}

/// Wait long enough for `num_clocks` cycles of a `clock_khz` device clock.
pub fn wait_clocks(num_clocks: u32, clock_khz: u32) {
    assert!(clock_khz > 0, "device clock is not running");
    let us = (u64::from(num_clocks) * 1000 + u64::from(clock_khz) - 1) / u64::from(clock_khz);
    wait_microseconds(us);
}

/// Deadline for a polling loop.
///
/// `update` keeps returning true until the deadline has passed; the first
/// check after that returns false, and so does every later one.
pub struct ManualTimer {
    timeout_us: u64,
    deadline: u64,
    is_timed_out: bool,
}

impl ManualTimer {
    pub fn new(timeout_ms: u32) -> Self {
        let timeout_us = u64::from(timeout_ms) * 1000;
        Self {
            timeout_us,
            deadline: get_us() + timeout_us,
            is_timed_out: false,
        }
    }

    pub fn update(&mut self) -> bool {
        if self.is_timed_out {
            return false;
        }
        if get_us() > self.deadline {
            self.is_timed_out = true;
        }
        !self.is_timed_out
    }

    pub fn restart(&mut self) {
        self.deadline = get_us() + self.timeout_us;
        self.is_timed_out = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing;

    #[test]
    fn wait_clocks_rounds_up() {
        testing::install();
        let before = testing::now_us();
        wait_clocks(100, 400);
        assert_eq!(testing::now_us() - before, 250);
        let before = testing::now_us();
        wait_clocks(8, 200000);
        assert_eq!(testing::now_us() - before, 1);
    }

    #[test]
    #[should_panic]
    fn wait_clocks_without_clock_aborts() {
        testing::install();
        wait_clocks(8, 0);
    }

    #[test]
    fn manual_timer_expires_once_and_stays_expired() {
        testing::install();
        let mut timer = ManualTimer::new(1);
        let mut polls = 0;
        while timer.update() {
            polls += 1;
        }
        assert!(polls > 0);
        assert!(!timer.update());
        wait_milliseconds(5);
        assert!(!timer.update());
        timer.restart();
        assert!(timer.update());
    }
}
