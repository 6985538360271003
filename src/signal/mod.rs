//! Operator signaling: one indicator light, driven by the latest sync
//! event.
//!
//! The orchestrator owns a [`SignalHandle`] and publishes events into a
//! single-slot watch latch; a background task translates the current
//! event into a blink pattern. A newer event replaces the running pattern
//! at the next pattern boundary, except `Error`, which preempts
//! immediately. When every handle is dropped the task finishes the cycle
//! in progress, turns the light off, and restores the backend.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::LedConfig;

/// Sync lifecycle events, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    CopyStart,
    VerifyStart,
    EraseStart,
    Success,
    Empty,
    Error,
}

/// One `(on_ms, off_ms)` pair per blink.
type Step = (u64, u64);

struct Pattern {
    steps: &'static [Step],
    repeat: bool,
}

fn pattern_for(event: SignalEvent) -> Pattern {
    match event {
        SignalEvent::CopyStart => Pattern {
            steps: &[(100, 100)],
            repeat: true,
        },
        SignalEvent::VerifyStart => Pattern {
            steps: &[(250, 250)],
            repeat: true,
        },
        SignalEvent::EraseStart => Pattern {
            steps: &[(800, 200)],
            repeat: true,
        },
        SignalEvent::Success => Pattern {
            steps: &[(80, 80), (80, 80), (80, 80), (2000, 0)],
            repeat: false,
        },
        SignalEvent::Empty => Pattern {
            steps: &[(400, 400), (400, 400)],
            repeat: false,
        },
        // SOS with a long inter-word gap.
        SignalEvent::Error => Pattern {
            steps: &[
                (150, 150),
                (150, 150),
                (150, 150),
                (400, 150),
                (400, 150),
                (400, 150),
                (150, 150),
                (150, 150),
                (150, 1400),
            ],
            repeat: true,
        },
    }
}

/// Publisher side of the signal latch.
#[derive(Clone)]
pub struct SignalHandle {
    tx: watch::Sender<Option<SignalEvent>>,
}

impl SignalHandle {
    pub fn emit(&self, event: SignalEvent) {
        info!("signal: {event:?}");
        // Receiver gone means the driver already shut down; nothing to do.
        let _ = self.tx.send(Some(event));
    }
}

/// Hardware the driver writes through. A singleton per process; only the
/// driver task touches it.
pub trait LightBackend: Send {
    fn init(&mut self);
    fn set(&mut self, on: bool);
    fn close(&mut self);
}

/// Raspberry Pi style LED class device: a `brightness`/`trigger` file
/// pair. The trigger is parked on `none` while we own the LED and
/// restored on shutdown.
pub struct SysfsLed {
    brightness: PathBuf,
    trigger: PathBuf,
    saved_trigger: Option<String>,
}

impl SysfsLed {
    pub fn new(led_dir: &Path) -> Self {
        Self {
            brightness: led_dir.join("brightness"),
            trigger: led_dir.join("trigger"),
            saved_trigger: None,
        }
    }
}

/// sysfs writes fail on non-Pi hosts or without permissions; the sync
/// must not care.
fn write_quietly(path: &Path, value: &str) {
    if let Err(e) = std::fs::write(path, value) {
        debug!("led write {} failed: {e}", path.display());
    }
}

impl LightBackend for SysfsLed {
    fn init(&mut self) {
        // The active entry is bracketed, e.g. "none [mmc0] heartbeat".
        self.saved_trigger = std::fs::read_to_string(&self.trigger)
            .ok()
            .and_then(|text| {
                text.split_whitespace()
                    .find(|w| w.starts_with('['))
                    .map(|w| w.trim_matches(|c| c == '[' || c == ']').to_string())
            });
        write_quietly(&self.trigger, "none");
    }

    fn set(&mut self, on: bool) {
        write_quietly(&self.brightness, if on { "1" } else { "0" });
    }

    fn close(&mut self) {
        write_quietly(&self.brightness, "0");
        if let Some(saved) = self.saved_trigger.take() {
            write_quietly(&self.trigger, &saved);
        }
    }
}

/// External LED on a GPIO line via the sysfs GPIO interface.
pub struct SysfsGpio {
    pin: u32,
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new(pin: u32) -> Self {
        Self {
            pin,
            root: PathBuf::from("/sys/class/gpio"),
        }
    }

    fn value_path(&self) -> PathBuf {
        self.root.join(format!("gpio{}/value", self.pin))
    }
}

impl LightBackend for SysfsGpio {
    fn init(&mut self) {
        let gpio_dir = self.root.join(format!("gpio{}", self.pin));
        if !gpio_dir.exists() {
            if let Ok(mut f) = std::fs::OpenOptions::new()
                .write(true)
                .open(self.root.join("export"))
            {
                let _ = write!(f, "{}", self.pin);
            }
        }
        write_quietly(&gpio_dir.join("direction"), "out");
    }

    fn set(&mut self, on: bool) {
        write_quietly(&self.value_path(), if on { "1" } else { "0" });
    }

    fn close(&mut self) {
        write_quietly(&self.value_path(), "0");
    }
}

/// Pick a backend from configuration.
pub fn backend_from_config(cfg: &LedConfig) -> Box<dyn LightBackend> {
    match cfg.backend.as_str() {
        "gpio" => Box::new(SysfsGpio::new(cfg.gpio_pin)),
        "sysfs" => Box::new(SysfsLed::new(&cfg.sysfs_dir)),
        other => {
            warn!("unknown led backend {other:?}, using sysfs");
            Box::new(SysfsLed::new(&cfg.sysfs_dir))
        }
    }
}

/// A latch pair without a driver task — lets tests observe emissions.
pub fn channel() -> (SignalHandle, watch::Receiver<Option<SignalEvent>>) {
    let (tx, rx) = watch::channel(None);
    (SignalHandle { tx }, rx)
}

/// Start the driver task. The light runs until every [`SignalHandle`]
/// clone is dropped.
pub fn spawn(mut backend: Box<dyn LightBackend>) -> (SignalHandle, JoinHandle<()>) {
    let (handle, mut rx) = channel();
    let task = tokio::spawn(async move {
        backend.init();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                None => {
                    backend.set(false);
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Some(event) => {
                    if !run_pattern(event, backend.as_mut(), &mut rx).await {
                        break;
                    }
                }
            }
        }
        backend.set(false);
        backend.close();
        debug!("signal driver stopped");
    });
    (handle, task)
}

/// Outcome of waiting out one on/off phase.
enum PhaseWait {
    /// Phase ran to completion; true when a non-error event queued up and
    /// should take over at the next pattern boundary.
    Elapsed { pending: bool },
    /// An `Error` event arrived; switch patterns right now.
    Superseded,
    /// Every handle dropped; shut down.
    Closed,
}

/// Play `event`'s pattern until it completes or is superseded.
/// Returns false when the latch closed and the driver should exit.
async fn run_pattern(
    event: SignalEvent,
    backend: &mut dyn LightBackend,
    rx: &mut watch::Receiver<Option<SignalEvent>>,
) -> bool {
    let pattern = pattern_for(event);
    let mut closed = false;
    let mut pending = false;
    'cycles: loop {
        for &(on_ms, off_ms) in pattern.steps {
            backend.set(true);
            if closed {
                // Latch gone: play the rest of the pattern on a plain
                // timer so a Success/Empty blink is not cut short by
                // process shutdown.
                sleep(Duration::from_millis(on_ms)).await;
            } else {
                match wait_phase(event, on_ms, rx).await {
                    PhaseWait::Elapsed { pending: p } => pending |= p,
                    PhaseWait::Superseded => return true,
                    PhaseWait::Closed => closed = true,
                }
            }
            backend.set(false);
            if off_ms > 0 {
                if closed {
                    sleep(Duration::from_millis(off_ms)).await;
                } else {
                    match wait_phase(event, off_ms, rx).await {
                        PhaseWait::Elapsed { pending: p } => pending |= p,
                        PhaseWait::Superseded => return true,
                        PhaseWait::Closed => closed = true,
                    }
                }
            }
            if closed && pattern.repeat {
                return false;
            }
        }
        if !pattern.repeat {
            break 'cycles;
        }
        // Pattern boundary: a queued event takes over here.
        if pending {
            return true;
        }
        if closed {
            return false;
        }
    }
    if closed {
        return false;
    }
    if pending {
        return true;
    }
    // One-shot pattern done; idle dark until the next event.
    backend.set(false);
    rx.changed().await.is_ok()
}

/// Sleep for `ms`, watching the latch. `Error` preempts mid-phase; other
/// events are noted and applied at the pattern boundary.
async fn wait_phase(
    current: SignalEvent,
    ms: u64,
    rx: &mut watch::Receiver<Option<SignalEvent>>,
) -> PhaseWait {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    let mut pending = false;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return PhaseWait::Elapsed { pending };
        }
        tokio::select! {
            _ = sleep(remaining) => return PhaseWait::Elapsed { pending },
            changed = rx.changed() => match changed {
                Err(_) => return PhaseWait::Closed,
                Ok(()) => {
                    let latest = *rx.borrow();
                    if latest == Some(SignalEvent::Error) && current != SignalEvent::Error {
                        return PhaseWait::Superseded;
                    }
                    pending |= latest != Some(current);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        transitions: Arc<Mutex<Vec<bool>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl LightBackend for Recorder {
        fn init(&mut self) {}
        fn set(&mut self, on: bool) {
            let mut t = self.transitions.lock().unwrap();
            if t.last() != Some(&on) {
                t.push(on);
            }
        }
        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_pattern_blinks_then_goes_dark() {
        let recorder = Recorder::default();
        let (handle, task) = spawn(Box::new(recorder.clone()));
        handle.emit(SignalEvent::Success);
        // 3 blinks + 2 s solid ≈ 2.5 s; generous margin under paused time.
        sleep(Duration::from_secs(5)).await;
        drop(handle);
        task.await.unwrap();
        let t = recorder.transitions.lock().unwrap().clone();
        // off, on/off ×3, on (solid), final off
        let ons = t.iter().filter(|&&b| b).count();
        assert_eq!(ons, 4, "transitions: {t:?}");
        assert_eq!(t.last(), Some(&false));
        assert!(*recorder.closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn error_preempts_mid_phase() {
        let recorder = Recorder::default();
        let (handle, task) = spawn(Box::new(recorder.clone()));
        handle.emit(SignalEvent::EraseStart); // 800 ms on phases
        sleep(Duration::from_millis(100)).await;
        handle.emit(SignalEvent::Error);
        sleep(Duration::from_millis(4000)).await;
        drop(handle);
        task.await.unwrap();
        let t = recorder.transitions.lock().unwrap().clone();
        // The SOS pattern produces far more transitions than the single
        // erase blink could have in 4 s if preemption worked.
        assert!(t.len() > 10, "transitions: {t:?}");
    }

    #[test]
    fn patterns_match_event_table() {
        assert!(pattern_for(SignalEvent::CopyStart).repeat);
        assert_eq!(pattern_for(SignalEvent::CopyStart).steps, &[(100, 100)]);
        assert!(!pattern_for(SignalEvent::Success).repeat);
        assert_eq!(pattern_for(SignalEvent::Empty).steps.len(), 2);
        assert_eq!(pattern_for(SignalEvent::Error).steps.len(), 9);
    }
}
