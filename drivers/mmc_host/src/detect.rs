// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Card detection.
//!
//! Each [`DetectMode`] is a strategy that turns raw presence samples into a
//! verdict. [`CardDetector`] owns the debounced flag and reports a
//! [`CardEvent`] only when that flag really changes.

use core::time::Duration;

use enum_dispatch::enum_dispatch;
use heapless::Deque;
use log::{debug, trace};

use crate::{
    config::{DetectConfig, DetectMode, MAX_POLL_SAMPLES},
    error::{HostError, HostResult},
    host::HostContext,
    regs::RegisterBus,
};

/// A change of debounced card presence.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CardEvent {
    Inserted,
    Removed,
}

impl CardEvent {
    fn from_present(present: bool) -> Self {
        if present { Self::Inserted } else { Self::Removed }
    }
}

/// Raw presence inputs sampled by the host for one detector step.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectInput {
    pub now: Duration,
    /// Card-detect GPIO, polarity applied: `true` means a card is seen.
    pub cd_level: Option<bool>,
    /// DAT3 presence bit of the status register.
    pub data3: bool,
    /// No request is outstanding and the data lines are quiet.
    pub bus_idle: bool,
}

/// Presence sampling strategy.
#[enum_dispatch]
pub trait DetectStrategy {
    fn mode(&self) -> DetectMode;

    /// Periodic detect tick. Returns a verdict when one is available.
    fn on_tick(&mut self, input: &DetectInput) -> Option<bool>;

    /// Edge interrupt of the presence source.
    fn on_edge(&mut self, input: &DetectInput) -> Option<bool>;

    /// Explicit verdict from the owner.
    fn on_manual(&mut self, _present: bool) -> HostResult<Option<bool>> {
        Err(HostError::Unsupported)
    }
}

/// Non-removable card.
#[derive(Debug, Default)]
pub struct AlwaysPresent;

impl DetectStrategy for AlwaysPresent {
    fn mode(&self) -> DetectMode {
        DetectMode::AlwaysPresent
    }

    fn on_tick(&mut self, _input: &DetectInput) -> Option<bool> {
        Some(true)
    }

    fn on_edge(&mut self, _input: &DetectInput) -> Option<bool> {
        Some(true)
    }
}

/// Detect GPIO sampled on every tick; the verdict is taken only when the
/// last `samples` reads all agree.
#[derive(Debug)]
pub struct PollGpio {
    window: Deque<bool, MAX_POLL_SAMPLES>,
    samples: usize,
}

impl PollGpio {
    pub fn new(samples: usize) -> Self {
        Self {
            window: Deque::new(),
            samples: samples.clamp(1, MAX_POLL_SAMPLES),
        }
    }
}

impl DetectStrategy for PollGpio {
    fn mode(&self) -> DetectMode {
        DetectMode::PollGpio
    }

    fn on_tick(&mut self, input: &DetectInput) -> Option<bool> {
        let level = input.cd_level?;
        if self.window.len() >= self.samples {
            self.window.pop_front();
        }
        // Capacity is MAX_POLL_SAMPLES and samples never exceeds it.
        let _ = self.window.push_back(level);
        if self.window.len() < self.samples {
            return None;
        }
        self.window.iter().all(|&s| s == level).then_some(level)
    }

    fn on_edge(&mut self, _input: &DetectInput) -> Option<bool> {
        None
    }
}

/// Detect GPIO edge interrupt opening a settling window; the level is read
/// once the window has passed without further edges.
#[derive(Debug)]
pub struct IrqGpio {
    debounce: Duration,
    deadline: Option<Duration>,
}

impl IrqGpio {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadline: None,
        }
    }
}

impl DetectStrategy for IrqGpio {
    fn mode(&self) -> DetectMode {
        DetectMode::IrqGpio
    }

    fn on_tick(&mut self, input: &DetectInput) -> Option<bool> {
        match self.deadline {
            Some(deadline) if input.now >= deadline => {
                self.deadline = None;
                input.cd_level
            }
            _ => None,
        }
    }

    fn on_edge(&mut self, input: &DetectInput) -> Option<bool> {
        // Every edge restarts the window.
        self.deadline = Some(input.now + self.debounce);
        None
    }
}

/// DAT3 used as the presence signal. DAT3 also carries data, so it is only
/// trusted while the bus is idle; edges seen mid-transfer are deferred.
#[derive(Debug, Default)]
pub struct Data3Line {
    deferred: bool,
}

impl DetectStrategy for Data3Line {
    fn mode(&self) -> DetectMode {
        DetectMode::Data3Line
    }

    fn on_tick(&mut self, input: &DetectInput) -> Option<bool> {
        if self.deferred && input.bus_idle {
            self.deferred = false;
            return Some(input.data3);
        }
        None
    }

    fn on_edge(&mut self, input: &DetectInput) -> Option<bool> {
        if input.bus_idle {
            self.deferred = false;
            Some(input.data3)
        } else {
            trace!("DAT3 edge while busy, deferred");
            self.deferred = true;
            None
        }
    }
}

/// Presence set only by the owner.
#[derive(Debug, Default)]
pub struct Manual;

impl DetectStrategy for Manual {
    fn mode(&self) -> DetectMode {
        DetectMode::Manual
    }

    fn on_tick(&mut self, _input: &DetectInput) -> Option<bool> {
        None
    }

    fn on_edge(&mut self, _input: &DetectInput) -> Option<bool> {
        None
    }

    fn on_manual(&mut self, present: bool) -> HostResult<Option<bool>> {
        Ok(Some(present))
    }
}

/// The strategy selected at init.
#[enum_dispatch(DetectStrategy)]
#[derive(Debug)]
pub enum Detector {
    AlwaysPresent,
    PollGpio,
    IrqGpio,
    Data3Line,
    Manual,
}

impl Detector {
    pub fn new(mode: DetectMode, cfg: &DetectConfig) -> Self {
        match mode {
            DetectMode::AlwaysPresent => AlwaysPresent.into(),
            DetectMode::PollGpio => PollGpio::new(cfg.poll_samples).into(),
            DetectMode::IrqGpio => IrqGpio::new(cfg.debounce).into(),
            DetectMode::Data3Line => Data3Line::default().into(),
            DetectMode::Manual => Manual.into(),
        }
    }

    /// Presence assumed right after the strategy is selected.
    pub fn initial(&self, input: &DetectInput) -> bool {
        match self.mode() {
            DetectMode::AlwaysPresent => true,
            DetectMode::PollGpio | DetectMode::IrqGpio => input.cd_level.unwrap_or(false),
            DetectMode::Data3Line => input.data3,
            DetectMode::Manual => false,
        }
    }
}

/// Debounced presence state.
#[derive(Debug)]
pub struct CardDetector {
    strategy: Detector,
    present: bool,
}

impl CardDetector {
    pub fn new(mode: DetectMode, cfg: &DetectConfig, input: &DetectInput) -> Self {
        let strategy = Detector::new(mode, cfg);
        let present = strategy.initial(input);
        Self { strategy, present }
    }

    pub fn mode(&self) -> DetectMode {
        self.strategy.mode()
    }

    pub fn present(&self) -> bool {
        self.present
    }

    pub fn tick(&mut self, input: &DetectInput) -> Option<CardEvent> {
        let verdict = self.strategy.on_tick(input);
        self.settle(verdict)
    }

    pub fn edge(&mut self, input: &DetectInput) -> Option<CardEvent> {
        let verdict = self.strategy.on_edge(input);
        self.settle(verdict)
    }

    /// Applies an explicit verdict; fails outside [`DetectMode::Manual`].
    pub fn manual(&mut self, present: bool) -> HostResult<Option<CardEvent>> {
        let verdict = self.strategy.on_manual(present)?;
        Ok(self.settle(verdict))
    }

    fn settle(&mut self, verdict: Option<bool>) -> Option<CardEvent> {
        let present = verdict?;
        if present == self.present {
            return None;
        }
        self.present = present;
        let event = CardEvent::from_present(present);
        debug!("card detect ({}): {:?}", self.mode(), event);
        Some(event)
    }
}

impl<B: RegisterBus> HostContext<B> {
    /// Periodic detect tick, run by the owner every
    /// [`DetectConfig::poll_interval`].
    pub fn poll_card_detect(&self) -> Option<CardEvent> {
        let mut st = self.state.lock();
        let input = self.detect_input(&st);
        st.detector.tick(&input)
    }

    /// Edge interrupt of the card-detect GPIO.
    pub fn handle_cd_gpio_irq(&self) -> Option<CardEvent> {
        let mut st = self.state.lock();
        if st.detector.mode() != DetectMode::IrqGpio {
            trace!("{}: detect GPIO edge outside irq mode", self.config.name);
            return None;
        }
        let input = self.detect_input(&st);
        st.detector.edge(&input)
    }

    pub fn detect_mode(&self) -> DetectMode {
        self.state.lock().detector.mode()
    }

    /// Switches the detect strategy at runtime.
    ///
    /// Presence is re-sampled from the new source; an event is returned if
    /// that changes it.
    pub fn set_detect_mode(&self, mode: DetectMode) -> HostResult<Option<CardEvent>> {
        let old = self.detect_mode();
        if old == mode {
            return Ok(None);
        }
        if matches!(mode, DetectMode::PollGpio | DetectMode::IrqGpio)
            && self.config.detect.cd_pin.is_none()
        {
            return Err(HostError::Unsupported);
        }
        self.disarm_detect_source(old);
        self.arm_detect_source(mode)?;

        let mut st = self.state.lock();
        let was_present = st.detector.present();
        let input = self.detect_input(&st);
        st.detector = CardDetector::new(mode, &self.config.detect, &input);
        let present = st.detector.present();
        debug!("{}: detect mode {} -> {}", self.config.name, old, mode);
        Ok((present != was_present).then(|| CardEvent::from_present(present)))
    }

    /// Sets presence by hand; only valid in [`DetectMode::Manual`].
    pub fn manual_insert_remove(&self, present: bool) -> HostResult<Option<CardEvent>> {
        self.state.lock().detector.manual(present)
    }
}
