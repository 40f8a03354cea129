//! SD card insertion detection on a debounced card-detect pad.
//!
//! The detector loop runs on its own thread (started through
//! [`DetectorConfig::spawn`]) and reports edges of the pad through the
//! registered callbacks. Sleep and wake are a request/acknowledge handshake
//! with that thread.

use crate::hal::{platform, AtomicEvent, CardDetectPad, Event};
use crate::timer::{wait_microseconds, wait_milliseconds};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use embedded_hal::digital::v2::InputPin;
use spin::Mutex;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct CallbackInfo {
    pub inserted: Option<Callback>,
    pub removed: Option<Callback>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DetectorState {
    Finalized,
    Initializing,
    Awake,
    Sleep,
}

pub struct DetectorConfig {
    pub pad: Arc<dyn CardDetectPad>,
    /// Pad level that means a card is present.
    pub inserted_level: bool,
    pub debounce_ms: u32,
    /// Starts a thread that calls [`DeviceDetector::run`].
    pub spawn: fn(Arc<DeviceDetector>),
}

pub struct DeviceDetector {
    config: DetectorConfig,
    state: Mutex<DetectorState>,
    ready: AtomicEvent,
    request_sleep_wake: AtomicEvent,
    acknowledge_sleep_wake: AtomicEvent,
    thread_end: AtomicEvent,
    is_prev_inserted: AtomicBool,
    force_detection: AtomicBool,
    callbacks: Mutex<CallbackInfo>,
    detection_event_callback: Mutex<Option<Callback>>,
}

impl DeviceDetector {
    pub fn new(config: DetectorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(DetectorState::Finalized),
            ready: AtomicEvent::new(),
            request_sleep_wake: AtomicEvent::new(),
            acknowledge_sleep_wake: AtomicEvent::new(),
            thread_end: AtomicEvent::new(),
            is_prev_inserted: AtomicBool::new(false),
            force_detection: AtomicBool::new(false),
            callbacks: Mutex::new(CallbackInfo::default()),
            detection_event_callback: Mutex::new(None),
        })
    }

    pub fn state(&self) -> DetectorState {
        *self.state.lock()
    }

    fn set_state(&self, state: DetectorState) {
        *self.state.lock() = state;
    }

    fn is_current_inserted(&self) -> bool {
        match self.config.pad.is_high() {
            Ok(level) => level == self.config.inserted_level,
            Err(never) => match never {},
        }
    }

    fn handle_device_status(&self, prev_inserted: bool, cur_inserted: bool) {
        let callbacks = self.callbacks.lock().clone();
        let call = |cb: &Option<Callback>| {
            if let Some(cb) = cb {
                cb();
            }
        };
        match (prev_inserted, cur_inserted) {
            (false, false) => {}
            (false, true) => {
                info!("sd card inserted");
                call(&callbacks.inserted);
            }
            (true, false) => {
                info!("sd card removed");
                call(&callbacks.removed);
            }
            (true, true) => {
                info!("sd card replaced");
                call(&callbacks.removed);
                call(&callbacks.inserted);
            }
        }
    }

    pub fn initialize(self: &Arc<Self>, callbacks: CallbackInfo) {
        {
            let mut state = self.state.lock();
            assert_eq!(*state, DetectorState::Finalized, "detector is already running");
            *state = DetectorState::Initializing;
        }
        *self.callbacks.lock() = callbacks;
        for event in [&self.ready, &self.request_sleep_wake, &self.acknowledge_sleep_wake, &self.thread_end].iter() {
            event.clear();
        }
        self.force_detection.store(false, Ordering::Release);
        (self.config.spawn)(self.clone());
    }

    /// Body of the detector thread. Returns once [`finalize`] is called.
    ///
    /// [`finalize`]: DeviceDetector::finalize
    pub fn run(&self) {
        let pad = &self.config.pad;
        wait_milliseconds(u64::from(self.config.debounce_ms));
        self.is_prev_inserted
            .store(self.is_current_inserted(), Ordering::Release);
        self.set_state(DetectorState::Awake);
        self.ready.signal();
        pad.set_interrupt_enable(true);
        debug!("detector: running, inserted {}", self.is_prev_inserted.load(Ordering::Acquire));

        loop {
            let signaled = platform().wait_any(&[&self.thread_end, &self.request_sleep_wake, pad.interrupt_event()]);
            let insert_change = match signaled {
                0 => break,
                1 => {
                    self.request_sleep_wake.clear();
                    self.set_state(DetectorState::Sleep);
                    self.acknowledge_sleep_wake.signal();

                    // The pad interrupt is not a wake source while asleep.
                    let signaled = platform().wait_any(&[&self.thread_end, &self.request_sleep_wake]);
                    self.request_sleep_wake.clear();
                    self.set_state(DetectorState::Awake);
                    self.acknowledge_sleep_wake.signal();
                    if signaled == 0 {
                        break;
                    }
                    self.force_detection.load(Ordering::Acquire)
                        || pad.is_wake_event_active()
                        || pad.interrupt_event().is_signaled()
                        || self.is_prev_inserted.load(Ordering::Acquire) != self.is_current_inserted()
                }
                _ => true,
            };

            if insert_change {
                let callback = self.detection_event_callback.lock().clone();
                if let Some(cb) = callback {
                    cb();
                }
                pad.interrupt_event().clear();
                pad.clear_interrupt_status();
                pad.set_interrupt_enable(true);

                let cur_inserted = self.is_current_inserted();
                let prev_inserted = self.is_prev_inserted.swap(cur_inserted, Ordering::AcqRel);
                self.handle_device_status(prev_inserted, cur_inserted);
            }
        }

        pad.set_interrupt_enable(false);
        self.thread_end.clear();
        self.set_state(DetectorState::Finalized);
        debug!("detector: stopped");
    }

    /// Stop the detector thread and wait until it has left its loop.
    pub fn finalize(&self) {
        assert_ne!(self.state(), DetectorState::Finalized, "detector is not running");
        self.thread_end.signal();
        while self.state() != DetectorState::Finalized {
            wait_microseconds(100);
        }
    }

    fn sleep_wake_handshake(&self) {
        self.request_sleep_wake.signal();
        self.acknowledge_sleep_wake.wait();
        self.acknowledge_sleep_wake.clear();
    }

    pub fn put_to_sleep(&self) {
        if self.state() == DetectorState::Finalized {
            return;
        }
        self.sleep_wake_handshake();
    }

    /// Resume detection. With `force_detection` the callbacks run as if the
    /// pad had changed, so a card swapped during sleep is noticed.
    pub fn awaken(&self, force_detection: bool) {
        if self.state() == DetectorState::Finalized {
            return;
        }
        self.force_detection.store(force_detection, Ordering::Release);
        self.sleep_wake_handshake();
    }

    pub fn is_inserted(&self) -> bool {
        match self.state() {
            DetectorState::Initializing => {
                self.ready.wait();
                self.is_current_inserted()
            }
            DetectorState::Awake => self.is_current_inserted(),
            DetectorState::Sleep | DetectorState::Finalized => self.is_prev_inserted.load(Ordering::Acquire),
        }
    }

    pub fn debounce_milliseconds(&self) -> u32 {
        self.config.debounce_ms
    }

    pub fn register_detection_event_callback(&self, callback: Callback) {
        *self.detection_event_callback.lock() = Some(callback);
    }

    pub fn unregister_detection_event_callback(&self) {
        *self.detection_event_callback.lock() = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hal::testing;
    use core::convert::Infallible;
    use core::sync::atomic::AtomicUsize;
    use embedded_hal::digital::v2::InputPin;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    pub struct FakePad {
        pub level: AtomicBool,
        pub interrupt: AtomicEvent,
        pub interrupt_enabled: AtomicBool,
        pub wake_event: AtomicBool,
        pub status_clears: AtomicUsize,
    }

    impl FakePad {
        /// Change the level and raise the edge interrupt.
        pub fn set_level(&self, level: bool) {
            self.level.store(level, Ordering::Release);
            self.interrupt.signal();
        }
    }

    impl InputPin for FakePad {
        type Error = Infallible;

        fn is_high(&self) -> Result<bool, Infallible> {
            Ok(self.level.load(Ordering::Acquire))
        }

        fn is_low(&self) -> Result<bool, Infallible> {
            Ok(!self.level.load(Ordering::Acquire))
        }
    }

    impl CardDetectPad for FakePad {
        fn set_interrupt_enable(&self, enable: bool) {
            self.interrupt_enabled.store(enable, Ordering::Release);
        }

        fn clear_interrupt_status(&self) {
            self.status_clears.fetch_add(1, Ordering::AcqRel);
        }

        fn is_wake_event_active(&self) -> bool {
            self.wake_event.load(Ordering::Acquire)
        }

        fn interrupt_event(&self) -> &dyn Event {
            &self.interrupt
        }
    }

    pub fn spawn_thread(detector: Arc<DeviceDetector>) {
        std::thread::spawn(move || {
            testing::install();
            detector.run();
        });
    }

    pub fn eventually(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct Harness {
        pad: Arc<FakePad>,
        detector: Arc<DeviceDetector>,
        events: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl Harness {
        fn start(inserted: bool) -> Self {
            testing::install();
            let pad = Arc::new(FakePad::default());
            pad.level.store(inserted, Ordering::Release);
            let detector = DeviceDetector::new(DetectorConfig {
                pad: pad.clone(),
                inserted_level: true,
                debounce_ms: 128,
                spawn: spawn_thread,
            });
            let events = Arc::new(std::sync::Mutex::new(Vec::new()));
            let (on_in, on_out) = (events.clone(), events.clone());
            detector.initialize(CallbackInfo {
                inserted: Some(Arc::new(move || on_in.lock().unwrap().push("inserted"))),
                removed: Some(Arc::new(move || on_out.lock().unwrap().push("removed"))),
            });
            Self { pad, detector, events }
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        fn wait_for_events(&self, n: usize) {
            eventually("callbacks", || self.events.lock().unwrap().len() >= n);
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            if self.detector.state() != DetectorState::Finalized {
                self.detector.finalize();
            }
        }
    }

    #[test]
    fn first_sample_waits_for_debounce() {
        let h = Harness::start(true);
        assert!(h.detector.is_inserted());
        assert_eq!(h.detector.state(), DetectorState::Awake);
        assert!(h.pad.interrupt_enabled.load(Ordering::Acquire));
        assert!(h.events().is_empty());
        assert_eq!(h.detector.debounce_milliseconds(), 128);
    }

    #[test]
    fn edges_report_insertion_and_removal() {
        let h = Harness::start(false);
        assert!(!h.detector.is_inserted());
        h.pad.set_level(true);
        h.wait_for_events(1);
        h.pad.set_level(false);
        h.wait_for_events(2);
        assert_eq!(h.events(), vec!["inserted", "removed"]);
        assert!(h.pad.status_clears.load(Ordering::Acquire) >= 2);
    }

    #[test]
    fn bounce_while_inserted_reports_replacement() {
        let h = Harness::start(true);
        assert!(h.detector.is_inserted());
        h.pad.set_level(true);
        h.wait_for_events(2);
        assert_eq!(h.events(), vec!["removed", "inserted"]);
    }

    #[test]
    fn sleep_freezes_the_reported_level() {
        let h = Harness::start(true);
        assert!(h.detector.is_inserted());
        h.detector.put_to_sleep();
        assert_eq!(h.detector.state(), DetectorState::Sleep);
        h.pad.level.store(false, Ordering::Release);
        assert!(h.detector.is_inserted());
        h.detector.awaken(false);
        assert_eq!(h.detector.state(), DetectorState::Awake);
        h.wait_for_events(1);
        assert_eq!(h.events(), vec!["removed"]);
        assert!(!h.detector.is_inserted());
    }

    #[test]
    fn forced_detection_runs_the_callbacks() {
        let h = Harness::start(true);
        assert!(h.detector.is_inserted());
        let detections = Arc::new(AtomicUsize::new(0));
        let counter = detections.clone();
        h.detector.register_detection_event_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        }));
        h.detector.put_to_sleep();
        h.detector.awaken(false);
        h.detector.put_to_sleep();
        h.detector.awaken(true);
        h.wait_for_events(2);
        assert_eq!(h.events(), vec!["removed", "inserted"]);
        assert_eq!(detections.load(Ordering::Acquire), 1);
        h.detector.unregister_detection_event_callback();
    }

    #[test]
    fn finalize_stops_the_thread() {
        let h = Harness::start(false);
        assert!(!h.detector.is_inserted());
        h.detector.finalize();
        assert_eq!(h.detector.state(), DetectorState::Finalized);
        assert!(!h.pad.interrupt_enabled.load(Ordering::Acquire));
        h.pad.level.store(true, Ordering::Release);
        assert!(!h.detector.is_inserted());
        h.detector.put_to_sleep();
    }
}
