// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Capability providers consumed by the host controller.
//!
//! The controller never parses board configuration itself. Pins, clocks,
//! regulators, GPIOs, the interrupt controller and the time source are
//! handed in by the platform as shared, reference-counted providers.

use alloc::sync::Arc;
use core::time::Duration;

use driver_base::DriverResult;

/// Internal pull resistor setting of a pin.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// Electrical configuration applied to one named signal.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PinConfig {
    /// Function-select value of the pin multiplexer.
    pub function: u8,
    pub pull: Pull,
    /// Drive strength level.
    pub drive: u8,
}

/// Pin-configuration provider.
pub trait PinCtrl: Send + Sync {
    /// Applies `cfg` to the named signal (e.g. `"clk"`, `"cmd"`, `"d0"`).
    fn configure(&self, signal: &str, cfg: PinConfig) -> DriverResult;

    /// Selects a named pin state (e.g. `"default"`, `"sleep"`).
    fn select_state(&self, state: &str) -> DriverResult;
}

/// Clock provider for the controller's module clock.
pub trait ClockProvider: Send + Sync {
    /// Returns the current rate in Hz.
    fn rate(&self) -> u64;

    /// Requests `hz`; the provider rounds to the nearest producible rate.
    fn set_rate(&self, hz: u64) -> DriverResult;

    /// Reparents the module clock onto the named source.
    fn set_parent(&self, source: &str) -> DriverResult;

    fn enable(&self) -> DriverResult;

    fn disable(&self);
}

/// Voltage regulator provider.
pub trait Regulator: Send + Sync {
    /// Returns the current output in microvolts.
    fn voltage_uv(&self) -> u32;

    fn set_voltage_uv(&self, uv: u32) -> DriverResult;

    fn enable(&self) -> DriverResult;

    fn disable(&self) -> DriverResult;
}

/// Edge selection for GPIO interrupts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GpioEdge {
    Rising,
    Falling,
    Both,
}

/// GPIO provider.
pub trait GpioProvider: Send + Sync {
    /// Reads the level of `pin`.
    fn read(&self, pin: u32) -> bool;

    fn write(&self, pin: u32, level: bool);

    /// Routes edge interrupts of `pin` to the owner of this host.
    fn request_irq(&self, pin: u32, edge: GpioEdge) -> DriverResult;

    fn free_irq(&self, pin: u32);

    /// Programs the hardware debounce filter of `pin`.
    fn set_debounce(&self, pin: u32, debounce: Duration) -> DriverResult;
}

/// Interrupt controller provider.
pub trait IrqController: Send + Sync {
    fn request(&self, irq: usize) -> DriverResult;

    fn free(&self, irq: usize);

    fn enable(&self, irq: usize);

    fn disable(&self, irq: usize);
}

/// Monotonic time source and busy-wait delay.
pub trait Timer: Send + Sync {
    /// Returns monotonic time since an arbitrary epoch.
    fn now(&self) -> Duration;

    /// Busy-waits (or sleeps, outside interrupt context) for `d`.
    fn delay(&self, d: Duration);
}

/// Descriptor ring memory reserved by the platform for the IDMA engine.
pub trait DmaMemory: Send + Sync {
    /// Translates a CPU address inside the descriptor ring to a bus address.
    fn virt_to_bus(&self, vaddr: usize) -> u64;
}

/// The set of providers a host is attached with.
///
/// Clock and regulator handles may be shared with other controller
/// instances; they are reference counted and never owned exclusively.
#[derive(Clone)]
pub struct Platform {
    pub pinctrl: Arc<dyn PinCtrl>,
    pub clock: Arc<dyn ClockProvider>,
    /// Card supply (VDD).
    pub vmmc: Option<Arc<dyn Regulator>>,
    /// Signalling supply (VDDIO); required for 1.8V and 1.2V signalling.
    pub vqmmc: Option<Arc<dyn Regulator>>,
    pub gpio: Arc<dyn GpioProvider>,
    pub irq: Arc<dyn IrqController>,
    pub timer: Arc<dyn Timer>,
    pub dma: Arc<dyn DmaMemory>,
}
