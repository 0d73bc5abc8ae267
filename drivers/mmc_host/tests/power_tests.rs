//! Unit tests for attach, bus settings, clocking, voltage switching and suspend

#![cfg(test)]


use std::{
    sync::{Arc, Mutex, atomic::Ordering},
    time::Duration,
};

use mmc_host::{
    BusIos, BusWidth, DetectMode, DeviceKind, DriverOps, EngineState, HostCaps, HostError,
    HostResult, PowerMode, Reg, SignalVoltage, SpeedMode, TimingMode,
    platform::Timer,
    regs::{
        Clkcr, CmdFlags, DelayCtrl, Gctrl, StatusFlags, TMOUT_DEFAULT, WIDTH_1BIT,
        WIDTH_4BIT,
    },
};
use test_helpers::*;

fn ios(clock_hz: u32, bus_width: BusWidth, timing: TimingMode) -> BusIos {
    BusIos {
        clock_hz,
        bus_width,
        timing,
        ddr: false,
        power: PowerMode::On,
    }
}

type Attempt = Arc<Mutex<Option<(EngineState, HostResult)>>>;

/// Submits a read from inside the host's next delay and records the
/// engine state it saw together with the outcome.
fn submit_on_next_delay(fx: &Fixture) -> Attempt {
    let host = Arc::downgrade(&fx.host);
    let seen = Attempt::default();
    let slot = seen.clone();
    fx.timer.on_next_delay(move || {
        if let Some(host) = host.upgrade() {
            *slot.lock().unwrap() = Some((host.engine_state(), host.submit(read_blocks(1))));
        }
    });
    seen
}

fn upclk_writes(bus: &MockBus) -> usize {
    bus.writes_to(Reg::Cmd)
        .iter()
        .filter(|v| *v & CmdFlags::UPCLK_ONLY.bits() != 0)
        .count()
}

// ========== Attach / Detach ==========

#[test]
fn test_attach_brings_controller_up() {
    let fx = FixtureBuilder::new().attach();

    assert!(fx.irq.requested.load(Ordering::SeqCst));
    assert!(fx.irq.enabled.load(Ordering::SeqCst));
    assert_eq!(
        *fx.pinctrl.configured.lock().unwrap(),
        ["clk", "cmd", "d0", "d1", "d2", "d3"]
    );
    assert!(fx.bus.reg(Reg::Gctrl) & Gctrl::INT_ENABLE.bits() != 0);
    assert_eq!(fx.bus.reg(Reg::Tmout), TMOUT_DEFAULT);
    assert_eq!(fx.bus.reg(Reg::Width), WIDTH_1BIT);
    assert_eq!(fx.bus.reg(Reg::Hwrst), 1);

    assert!(!fx.host.is_powered());
    assert_eq!(fx.host.voltage(), SignalVoltage::Off);
    assert_eq!(fx.host.engine_state(), EngineState::Idle);
    assert_eq!(fx.host.name(), "sunxi-mmc");
    assert_eq!(fx.host.device_kind(), DeviceKind::Block);
}

#[test]
fn test_attach_without_signalling_regulator() {
    let fx = FixtureBuilder::new().without_vqmmc().powered();

    let caps = fx.host.caps();
    assert!(!caps.intersects(HostCaps::NEEDS_VQMMC));
    assert!(caps.contains(HostCaps::BUS_4BIT | HostCaps::SD_HS));
    assert_eq!(
        fx.host.switch_voltage(SignalVoltage::V180),
        Err(HostError::Unsupported)
    );
    assert_eq!(
        fx.host.set_bus_ios(ios(200_000_000, BusWidth::Four, TimingMode::UhsSdr104)),
        Err(HostError::Unsupported)
    );
}

#[test]
fn test_attach_rejects_inconsistent_config() {
    let res = FixtureBuilder::new()
        .config(|c| c.detect.mode = DetectMode::PollGpio)
        .try_attach();
    assert!(matches!(res, Err(HostError::Unsupported)));

    let res = FixtureBuilder::new()
        .config(|c| c.max_segment_size = 1000)
        .try_attach();
    assert!(matches!(res, Err(HostError::InvalidBuffer)));

    let res = FixtureBuilder::new()
        .config(|c| c.max_descriptors = usize::MAX)
        .try_attach();
    assert!(matches!(res, Err(HostError::InvalidBuffer)));
}

#[test]
fn test_detach() {
    let fx = FixtureBuilder::new().powered();
    fx.host.submit(read_blocks(1)).unwrap();
    assert_eq!(fx.host.detach(), Err(HostError::Busy));

    fx.host.expire_outstanding();
    fx.host.finalize().unwrap();
    fx.host.detach().unwrap();

    assert!(!fx.irq.requested.load(Ordering::SeqCst));
    assert!(!fx.vmmc.enabled.load(Ordering::SeqCst));
    assert_eq!(fx.bus.reg(Reg::Imask), 0);
    assert_eq!(fx.host.submit(read_blocks(1)), Err(HostError::NoMedium));
    fx.host.detach().unwrap();
}

// ========== Power and Bus Settings ==========

#[test]
fn test_power_up_sequence() {
    let fx = FixtureBuilder::new().powered();

    assert_eq!(fx.vmmc.uv(), 3_300_000);
    assert!(fx.vmmc.enabled.load(Ordering::SeqCst));
    assert_eq!(fx.vqmmc().uv(), 3_300_000);
    assert!(fx.pinctrl.states.lock().unwrap().contains(&"default".into()));
    assert!(fx.clock.enabled.load(Ordering::SeqCst));

    assert!(fx.host.is_powered());
    assert_eq!(fx.host.voltage(), SignalVoltage::V330);
    assert_eq!(fx.bus.reg(Reg::Width), WIDTH_4BIT);
    assert!(fx.bus.reg(Reg::Clkcr) & Clkcr::CARD_CLK_ON.bits() != 0);

    let profile = fx.host.clock_profile();
    assert_eq!(profile.module_hz, 100_000_000);
    assert_eq!(profile.card_hz, 25_000_000);
    assert_eq!(profile.speed, SpeedMode::Hs25M);
    assert_eq!(profile.bus_width, BusWidth::Four);
}

#[test]
fn test_power_up_is_not_ready_for_requests() {
    let fx = FixtureBuilder::new().attach();
    fx.host
        .set_bus_ios(BusIos {
            clock_hz: 400_000,
            power: PowerMode::Up,
            ..BusIos::default()
        })
        .unwrap();
    assert!(!fx.host.is_powered());
    assert_eq!(fx.host.voltage(), SignalVoltage::V330);
    assert_eq!(fx.host.submit(read_blocks(1)), Err(HostError::NoMedium));
}

#[test]
fn test_power_off() {
    let fx = FixtureBuilder::new().powered();
    fx.host
        .set_bus_ios(BusIos {
            power: PowerMode::Off,
            ..BusIos::default()
        })
        .unwrap();

    assert!(!fx.host.is_powered());
    assert_eq!(fx.host.voltage(), SignalVoltage::Off);
    assert!(!fx.vmmc.enabled.load(Ordering::SeqCst));
    assert!(!fx.vqmmc().enabled.load(Ordering::SeqCst));
    assert!(!fx.clock.enabled.load(Ordering::SeqCst));
    assert_eq!(fx.pinctrl.states.lock().unwrap().last().unwrap(), "sleep");
    assert_eq!(fx.host.clock_profile().card_hz, 0);
    assert_eq!(fx.host.submit(read_blocks(1)), Err(HostError::NoMedium));
}

#[test]
fn test_unsupported_bus_settings() {
    let fx = FixtureBuilder::new()
        .config(|c| c.caps.remove(HostCaps::BUS_8BIT))
        .powered();
    assert_eq!(
        fx.host.set_bus_ios(ios(50_000_000, BusWidth::Eight, TimingMode::MmcHs)),
        Err(HostError::Unsupported)
    );
    assert_eq!(
        fx.host.set_bus_ios(ios(52_000_000, BusWidth::Four, TimingMode::MmcDdr52)),
        Err(HostError::Unsupported)
    );
    assert_eq!(fx.host.bus_ios().bus_width, BusWidth::Four);
}

#[test]
fn test_ddr_8bit_requires_capability() {
    let fx = FixtureBuilder::new().powered();
    assert!(!fx.host.caps().contains(HostCaps::DDR_8BIT));
    assert_eq!(
        fx.host.set_bus_ios(ios(50_000_000, BusWidth::Eight, TimingMode::UhsDdr50)),
        Err(HostError::Unsupported)
    );
}

#[test]
fn test_bus_settings_busy_with_outstanding_request() {
    let fx = FixtureBuilder::new().powered();
    fx.host.submit(read_blocks(1)).unwrap();
    assert_eq!(
        fx.host.set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs)),
        Err(HostError::Busy)
    );
}

#[test]
fn test_bus_settings_hold_the_engine() {
    let fx = FixtureBuilder::new()
        .config(|c| c.timings.clk_update_polls = 8)
        .powered();
    fx.bus.set_hold_start(true);
    let seen = submit_on_next_delay(&fx);

    assert_eq!(
        fx.host.set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs)),
        Err(HostError::BusTimeout)
    );
    assert_eq!(
        seen.lock().unwrap().take(),
        Some((EngineState::Reconfiguring, Err(HostError::Busy)))
    );

    // Released on the error path too.
    assert_eq!(fx.host.engine_state(), EngineState::Idle);
    fx.bus.set_hold_start(false);
    fx.host.submit(read_blocks(1)).unwrap();
}

// ========== Clock ==========

#[test]
fn test_clock_parent_follows_target_rate() {
    let fx = FixtureBuilder::new().attach();
    fx.host
        .set_bus_ios(BusIos {
            clock_hz: 400_000,
            power: PowerMode::Up,
            ..BusIos::default()
        })
        .unwrap();
    let log = fx.clock.take_log();
    assert_eq!(
        &log[log.len() - 4..],
        &["disable", "parent osc24m", "rate 1600000", "enable"]
    );
    assert_eq!(fx.host.clock_profile().speed, SpeedMode::Ds400K);

    fx.host
        .set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs))
        .unwrap();
    let log = fx.clock.take_log();
    assert_eq!(
        log,
        ["disable", "parent pll-periph", "rate 200000000", "enable"]
    );
    let profile = fx.host.clock_profile();
    assert_eq!(profile.card_hz, 50_000_000);
    assert_eq!(profile.speed, SpeedMode::Hs50M);
    assert!(!profile.ddr);
}

#[test]
fn test_ddr_clock_doubles_module_rate() {
    let fx = FixtureBuilder::new().powered();
    fx.host
        .set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::UhsDdr50))
        .unwrap();

    assert_eq!(fx.clock.rate.load(Ordering::SeqCst), 400_000_000);
    let profile = fx.host.clock_profile();
    assert_eq!(profile.card_hz, 50_000_000);
    assert!(profile.ddr);
    assert_eq!(profile.speed, SpeedMode::Hs50MDdr);
    assert!(fx.host.bus_ios().ddr);
    assert!(fx.bus.reg(Reg::Gctrl) & Gctrl::DDR_MODE.bits() != 0);

    // Delay pair of the 50M DDR profile.
    assert_eq!(fx.bus.reg(Reg::DrvDl), DelayCtrl::SW_ENABLE.bits() | 2);
    assert_eq!(fx.bus.reg(Reg::SampDl), DelayCtrl::SW_ENABLE.bits() | 4);

    fx.host
        .set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs))
        .unwrap();
    assert!(fx.bus.reg(Reg::Gctrl) & Gctrl::DDR_MODE.bits() == 0);
}

#[test]
fn test_clock_change_keeps_divider_clear_and_masks_dat0() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.set_reg(Reg::Clkcr, fx.bus.reg(Reg::Clkcr) | 0x3);
    fx.bus.clear_writes();

    fx.host
        .set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs))
        .unwrap();
    let clkcr = fx.bus.reg(Reg::Clkcr);
    assert_eq!(clkcr & Clkcr::DIVIDER.bits(), 0);
    assert_eq!(clkcr & Clkcr::MASK_DATA0.bits(), 0);
    assert!(
        fx.bus
            .writes_to(Reg::Clkcr)
            .iter()
            .any(|v| v & Clkcr::MASK_DATA0.bits() != 0)
    );
    assert_eq!(upclk_writes(&fx.bus), 2);
}

#[test]
fn test_clock_update_timeout() {
    let fx = FixtureBuilder::new()
        .config(|c| c.timings.clk_update_polls = 8)
        .powered();
    fx.bus.set_hold_start(true);
    assert_eq!(
        fx.host.set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs)),
        Err(HostError::BusTimeout)
    );
}

// ========== Voltage Switching ==========

const LINES_HIGH: u32 = StatusFlags::DAT_LEVELS.bits();

#[test]
fn test_switch_to_1v8() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.script_status(&[LINES_HIGH, LINES_HIGH]);
    fx.bus.clear_writes();
    let t0 = fx.timer.now();

    fx.host.switch_voltage(SignalVoltage::V180).unwrap();

    assert_eq!(fx.host.voltage(), SignalVoltage::V180);
    assert_eq!(fx.vqmmc().uv(), 1_800_000);
    // Clock gated then restarted around the regulator change.
    assert_eq!(upclk_writes(&fx.bus), 2);
    assert!(fx.timer.now() - t0 >= Duration::from_millis(6));
    assert!(fx.bus.reg(Reg::Clkcr) & Clkcr::CARD_CLK_ON.bits() != 0);
}

#[test]
fn test_switch_deferred_while_lines_held() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.script_status(&[LINES_HIGH | StatusFlags::CARD_DATA_BUSY.bits()]);
    fx.bus.clear_writes();

    assert_eq!(
        fx.host.switch_voltage(SignalVoltage::V180),
        Err(HostError::RetryLater)
    );
    assert_eq!(fx.host.voltage(), SignalVoltage::V330);
    assert!(!fx.vqmmc().history.lock().unwrap().contains(&1_800_000));
    assert!(fx.bus.writes().is_empty());
}

#[test]
fn test_switch_deferred_while_data_lines_low() {
    let fx = FixtureBuilder::new().powered();
    let three_high = StatusFlags::DAT0_LEVEL | StatusFlags::DAT1_LEVEL | StatusFlags::DAT2_LEVEL;
    for status in [0, three_high.bits()] {
        fx.bus.script_status(&[status]);
        fx.bus.clear_writes();

        assert_eq!(
            fx.host.switch_voltage(SignalVoltage::V180),
            Err(HostError::RetryLater)
        );
        assert_eq!(fx.host.voltage(), SignalVoltage::V330);
        assert_eq!(fx.vqmmc().uv(), 3_300_000);
        assert!(!fx.vqmmc().history.lock().unwrap().contains(&1_800_000));
        assert!(fx.bus.writes().is_empty());
    }
}

#[test]
fn test_switch_reverts_when_card_does_not_drive_lines() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.script_status(&[LINES_HIGH, 0]);

    assert_eq!(
        fx.host.switch_voltage(SignalVoltage::V180),
        Err(HostError::RetryLater)
    );
    assert_eq!(fx.host.voltage(), SignalVoltage::V330);
    assert_eq!(fx.vqmmc().uv(), 3_300_000);
    let history = fx.vqmmc().history.lock().unwrap().clone();
    assert_eq!(&history[history.len() - 2..], &[1_800_000, 3_300_000]);

    // A retry with a cooperating card succeeds.
    fx.bus.script_status(&[LINES_HIGH, LINES_HIGH]);
    fx.host.switch_voltage(SignalVoltage::V180).unwrap();
    assert_eq!(fx.host.voltage(), SignalVoltage::V180);
}

#[test]
fn test_switch_voltage_rules() {
    let fx = FixtureBuilder::new().powered();
    fx.host.switch_voltage(SignalVoltage::V330).unwrap();
    assert_eq!(
        fx.host.switch_voltage(SignalVoltage::V120),
        Err(HostError::Unsupported)
    );

    fx.host.submit(read_blocks(1)).unwrap();
    assert_eq!(
        fx.host.switch_voltage(SignalVoltage::V180),
        Err(HostError::Busy)
    );
    fx.host.expire_outstanding();
    fx.host.finalize().unwrap();

    fx.host.switch_voltage(SignalVoltage::Off).unwrap();
    assert_eq!(fx.host.voltage(), SignalVoltage::Off);
    assert!(!fx.vqmmc().enabled.load(Ordering::SeqCst));
}

#[test]
fn test_submit_refused_during_voltage_switch() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.script_status(&[LINES_HIGH, LINES_HIGH]);
    fx.bus.clear_writes();
    let seen = submit_on_next_delay(&fx);

    fx.host.switch_voltage(SignalVoltage::V180).unwrap();

    assert_eq!(
        seen.lock().unwrap().take(),
        Some((EngineState::Reconfiguring, Err(HostError::Busy)))
    );
    // Only update-clock commands reached the controller.
    let cmds = fx.bus.writes_to(Reg::Cmd);
    assert_eq!(cmds.len(), 2);
    assert!(cmds.iter().all(|v| v & CmdFlags::UPCLK_ONLY.bits() != 0));
    assert_eq!(fx.host.wait_mask(), mmc_host::WaitFlags::empty());
    assert_eq!(fx.host.engine_state(), EngineState::Idle);
    fx.host.submit(read_blocks(1)).unwrap();
}

// ========== Suspend / Resume ==========

#[test]
fn test_suspend_resume_restores_registers() {
    let fx = FixtureBuilder::new().powered();
    let before: Vec<u32> = [Reg::Gctrl, Reg::Clkcr, Reg::Tmout, Reg::Width, Reg::SampDl]
        .iter()
        .map(|r| fx.bus.reg(*r))
        .collect();

    fx.host.suspend().unwrap();
    assert!(fx.host.is_suspended());
    assert!(!fx.clock.enabled.load(Ordering::SeqCst));
    assert!(!fx.irq.enabled.load(Ordering::SeqCst));
    assert_eq!(fx.bus.reg(Reg::Imask), 0);
    assert_eq!(fx.host.submit(read_blocks(1)), Err(HostError::NoMedium));
    assert_eq!(
        fx.host.set_bus_ios(ios(50_000_000, BusWidth::Four, TimingMode::SdHs)),
        Err(HostError::NoMedium)
    );

    // Power loss wipes the register file.
    for reg in [Reg::Gctrl, Reg::Clkcr, Reg::Tmout, Reg::Width, Reg::SampDl] {
        fx.bus.set_reg(reg, 0);
    }
    fx.bus.clear_writes();

    fx.host.resume().unwrap();
    assert!(!fx.host.is_suspended());
    let after: Vec<u32> = [Reg::Gctrl, Reg::Clkcr, Reg::Tmout, Reg::Width, Reg::SampDl]
        .iter()
        .map(|r| fx.bus.reg(*r))
        .collect();
    assert_eq!(before, after);
    assert_eq!(upclk_writes(&fx.bus), 1);
    assert!(fx.clock.enabled.load(Ordering::SeqCst));
    assert!(fx.irq.enabled.load(Ordering::SeqCst));

    fx.host.submit(read_blocks(1)).unwrap();
}

#[test]
fn test_suspend_busy_with_outstanding_request() {
    let fx = FixtureBuilder::new().powered();
    fx.host.submit(read_blocks(1)).unwrap();
    assert_eq!(fx.host.suspend(), Err(HostError::Busy));
    assert!(!fx.host.is_suspended());
}

// ========== Hardware Reset ==========

#[test]
fn test_hw_reset_pulses_line() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.clear_writes();
    let t0 = fx.timer.now();

    fx.host.hw_reset().unwrap();
    assert_eq!(fx.bus.writes_to(Reg::Hwrst), [0, 1]);
    assert!(fx.timer.now() - t0 >= Duration::from_micros(310));
}

#[test]
fn test_hw_reset_requires_capability() {
    let fx = FixtureBuilder::new()
        .config(|c| c.caps.remove(HostCaps::HW_RESET))
        .powered();
    fx.bus.clear_writes();
    assert_eq!(fx.host.hw_reset(), Err(HostError::Unsupported));
    assert!(fx.bus.writes().is_empty());

    let fx = FixtureBuilder::new().powered();
    fx.host.submit(read_blocks(1)).unwrap();
    assert_eq!(fx.host.hw_reset(), Err(HostError::Busy));
}

#[test]
fn test_submit_refused_during_hw_reset() {
    let fx = FixtureBuilder::new().powered();
    fx.bus.clear_writes();
    let seen = submit_on_next_delay(&fx);

    fx.host.hw_reset().unwrap();
    assert_eq!(
        seen.lock().unwrap().take(),
        Some((EngineState::Reconfiguring, Err(HostError::Busy)))
    );
    assert!(fx.bus.writes_to(Reg::Cmd).is_empty());
    assert_eq!(fx.host.engine_state(), EngineState::Idle);
}

#[test]
fn test_card_busy_reads_dat0() {
    let fx = FixtureBuilder::new().powered();
    assert!(!fx.host.card_busy());
    fx.bus.set_status(StatusFlags::CARD_DATA_BUSY.bits());
    assert!(fx.host.card_busy());
}
