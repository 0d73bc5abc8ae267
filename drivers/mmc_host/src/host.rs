// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The request engine.
//!
//! A [`HostContext`] accepts one [`Request`] at a time. `submit` programs
//! the controller and issues the command, [`HostContext::handle_irq`]
//! records completion conditions from interrupt context, and
//! [`HostContext::finalize`] hands the request back from the completion
//! context once everything it waits for has arrived.

use core::sync::atomic::AtomicU8;

use driver_base::{DeviceKind, DriverOps};
use log::{debug, info, trace, warn};
use spin::Mutex;
use strum::{Display, IntoStaticStr};

use crate::{
    clock::ClockProfile,
    completion::{CompletionQueue, CompletionToken},
    config::{ClockDelayTable, DetectMode, HostCaps, PlatformConfig},
    detect::{CardDetector, CardEvent, DetectInput},
    error::{ErrorFlags, HostError, HostResult},
    idma::DescriptorRing,
    ios::{BusIos, BusWidth, PowerMode, SignalVoltage},
    platform::{GpioEdge, Platform},
    regs::{
        Clkcr, CmdFlags, Dmac, FTRGL_DEFAULT, Gctrl, IdmaInt, IntFlags, Reg, RegisterBus,
        StatusFlags, TMOUT_DEFAULT, WIDTH_1BIT, WIDTH_4BIT, WIDTH_8BIT,
    },
    request::{
        AutoCommand, CompletedRequest, DataDirection, MMC_STOP_TRANSMISSION, Request, Response,
        ResponseKind, reassemble_long,
    },
};

/// Opcode of GO_IDLE_STATE, preceded by the 74-clock init sequence.
const MMC_GO_IDLE_STATE: u8 = 0;
/// Opcode of SD VOLTAGE_SWITCH.
const SD_SWITCH_VOLTAGE: u8 = 11;

bitflags::bitflags! {
    /// Completion conditions an outstanding request waits for.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct WaitFlags: u8 {
        const CMD_DONE      = 1 << 0;
        const DATA_OVER     = 1 << 1;
        const AUTO_CMD_DONE = 1 << 2;
        const DMA_DONE      = 1 << 3;
    }
}

impl WaitFlags {
    /// Conditions that together mean `req` has completed.
    pub fn for_request(req: &Request) -> Self {
        match (&req.data, req.auto) {
            (None, _) => Self::CMD_DONE,
            (Some(_), Some(AutoCommand::Stop { .. })) => Self::AUTO_CMD_DONE | Self::DMA_DONE,
            (Some(_), _) => Self::DATA_OVER | Self::DMA_DONE,
        }
    }

    /// Conditions signalled by the raw status words.
    pub fn from_raw(int: IntFlags, idma: IdmaInt) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::CMD_DONE, int.contains(IntFlags::COMMAND_DONE));
        flags.set(Self::DATA_OVER, int.contains(IntFlags::DATA_OVER));
        flags.set(Self::AUTO_CMD_DONE, int.contains(IntFlags::AUTO_COMMAND_DONE));
        flags.set(Self::DMA_DONE, idma.intersects(IdmaInt::DONE));
        flags
    }

    /// Controller interrupt sources that must be unmasked to observe `self`.
    pub fn int_sources(self) -> IntFlags {
        let mut int = IntFlags::empty();
        int.set(IntFlags::COMMAND_DONE, self.contains(Self::CMD_DONE));
        int.set(IntFlags::DATA_OVER, self.contains(Self::DATA_OVER));
        int.set(IntFlags::AUTO_COMMAND_DONE, self.contains(Self::AUTO_CMD_DONE));
        int
    }
}

/// Request engine state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, IntoStaticStr)]
pub enum EngineState {
    Idle,
    /// `submit` owns the engine but has not issued the command yet.
    Arming,
    CommandIssued,
    Finalizing,
    /// Clock, voltage, bus or reset registers are being reprogrammed.
    Reconfiguring,
    /// A tuning sweep runs; only tuning block reads are accepted.
    Tuning,
}

pub(crate) struct Outstanding {
    pub(crate) request: Request,
    pub(crate) seq: u64,
    pub(crate) wait: WaitFlags,
    pub(crate) received: WaitFlags,
    pub(crate) errors: ErrorFlags,
    /// State the engine returns to once the request is finalized.
    pub(crate) resume: EngineState,
}

/// What one call to [`HostContext::handle_irq`] observed.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct IrqOutcome {
    /// The controller had a pending status bit.
    pub handled: bool,
    /// A completion was queued; run [`HostContext::finalize`].
    pub completion: bool,
    /// An SDIO card interrupt was latched.
    pub sdio: bool,
    pub card_event: Option<CardEvent>,
}

const SAVED_COUNT: usize = 11;

/// Registers preserved across suspend.
const SAVED_REGS: [Reg; SAVED_COUNT] = [
    Reg::Gctrl,
    Reg::Clkcr,
    Reg::Tmout,
    Reg::Width,
    Reg::Ftrgl,
    Reg::Imask,
    Reg::Funs,
    Reg::Thld,
    Reg::Ntsr,
    Reg::DrvDl,
    Reg::SampDl,
];

pub(crate) struct HostState {
    pub(crate) engine: EngineState,
    pub(crate) outstanding: Option<Outstanding>,
    pub(crate) ring: DescriptorRing,
    pub(crate) next_seq: u64,
    pub(crate) ios: BusIos,
    pub(crate) clock: ClockProfile,
    pub(crate) delays: ClockDelayTable,
    pub(crate) voltage: SignalVoltage,
    pub(crate) powered: bool,
    pub(crate) suspended: bool,
    pub(crate) attached: bool,
    pub(crate) detector: CardDetector,
    pub(crate) sdio_irq_enabled: bool,
    pub(crate) sdio_pending: bool,
    pub(crate) saved: Option<[u32; SAVED_COUNT]>,
}

impl HostState {
    fn is_idle(&self) -> bool {
        self.engine == EngineState::Idle && self.outstanding.is_none()
    }

    fn accepts(&self, req: &Request) -> bool {
        self.outstanding.is_none()
            && match self.engine {
                EngineState::Idle => true,
                EngineState::Tuning => req.is_tuning_read(),
                _ => false,
            }
    }
}

/// Holds the engine in a reserved state until dropped.
///
/// While it lives, `submit` refuses requests (except tuning reads during
/// [`EngineState::Tuning`]) so the register file can be reprogrammed.
pub(crate) struct EngineReservation<'a, B: RegisterBus> {
    host: &'a HostContext<B>,
    state: EngineState,
}

impl<B: RegisterBus> Drop for EngineReservation<'_, B> {
    fn drop(&mut self) {
        let mut st = self.host.state.lock();
        if st.engine == self.state {
            st.engine = EngineState::Idle;
        } else if let Some(o) = st.outstanding.as_mut() {
            if o.resume == self.state {
                o.resume = EngineState::Idle;
            }
        }
    }
}

/// One SD/MMC host controller instance.
pub struct HostContext<B: RegisterBus> {
    pub(crate) bus: B,
    pub(crate) platform: Platform,
    pub(crate) config: PlatformConfig,
    pub(crate) caps: HostCaps,
    pub(crate) state: Mutex<HostState>,
    pub(crate) completions: CompletionQueue,
    pub(crate) debug_level: AtomicU8,
}

impl<B: RegisterBus> HostContext<B> {
    /// Brings up a controller instance.
    ///
    /// The host comes back idle and unpowered; the card protocol layer
    /// powers it through [`HostContext::set_bus_ios`].
    pub fn attach(bus: B, platform: Platform, config: PlatformConfig) -> HostResult<Self> {
        config.validate()?;
        for pin in &config.pins {
            platform.pinctrl.configure(&pin.signal, pin.config)?;
        }
        let caps = config.caps.effective(platform.vqmmc.is_some());
        if caps != config.caps {
            info!(
                "{}: capabilities {:?} unavailable without a signalling regulator",
                config.name,
                config.caps.difference(caps)
            );
        }

        let ring = DescriptorRing::new(config.max_descriptors, config.max_segment_size);
        if platform.dma.virt_to_bus(ring.vaddr()) > u32::MAX as u64 {
            return Err(HostError::InvalidBuffer);
        }
        platform.irq.request(config.irq)?;

        let input = DetectInput {
            now: platform.timer.now(),
            cd_level: config
                .detect
                .cd_pin
                .map(|pin| platform.gpio.read(pin) != config.detect.cd_active_low),
            data3: StatusFlags::from_bits_retain(bus.read(Reg::Status))
                .contains(StatusFlags::CARD_PRESENT),
            bus_idle: true,
        };
        let detector = CardDetector::new(config.detect.mode, &config.detect, &input);
        let state = HostState {
            engine: EngineState::Idle,
            outstanding: None,
            ring,
            next_seq: 0,
            ios: BusIos::default(),
            clock: ClockProfile::default(),
            delays: config.delays,
            voltage: SignalVoltage::Off,
            powered: false,
            suspended: false,
            attached: true,
            detector,
            sdio_irq_enabled: false,
            sdio_pending: false,
            saved: None,
        };
        let host = Self {
            bus,
            platform,
            caps,
            state: Mutex::new(state),
            completions: CompletionQueue::new(),
            debug_level: AtomicU8::new(0),
            config,
        };

        if let Err(err) = host.bring_up() {
            host.platform.irq.free(host.config.irq);
            return Err(err);
        }
        info!(
            "{}: attached at {:#x}, irq {}, detect {}, caps {:?}",
            host.config.name,
            host.bus.base(),
            host.config.irq,
            host.config.detect.mode,
            host.caps
        );
        Ok(host)
    }

    fn bring_up(&self) -> HostResult {
        self.reset_controller()?;
        self.program_defaults();
        self.arm_detect_source(self.config.detect.mode)?;
        self.platform.irq.enable(self.config.irq);
        Ok(())
    }

    /// Quiesces the controller and releases its interrupt line.
    pub fn detach(&self) -> HostResult {
        {
            let mut st = self.state.lock();
            if !st.attached {
                return Ok(());
            }
            if !st.is_idle() {
                return Err(HostError::Busy);
            }
            st.attached = false;
        }
        self.bus.write(Reg::Imask, 0);
        self.bus.write(Reg::Idie, 0);
        self.platform.irq.disable(self.config.irq);
        let mode = self.state.lock().detector.mode();
        self.disarm_detect_source(mode);
        if let Err(err) = self.power_off() {
            warn!("{}: power off on detach: {}", self.config.name, err);
        }
        self.platform.irq.free(self.config.irq);
        info!("{}: detached", self.config.name);
        Ok(())
    }

    /// Effective capabilities.
    pub fn caps(&self) -> HostCaps {
        self.caps
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn engine_state(&self) -> EngineState {
        self.state.lock().engine
    }

    /// Completion conditions still armed; empty when nothing is outstanding.
    pub fn wait_mask(&self) -> WaitFlags {
        let st = self.state.lock();
        st.outstanding.as_ref().map_or(WaitFlags::empty(), |o| o.wait)
    }

    pub fn clock_profile(&self) -> ClockProfile {
        self.state.lock().clock
    }

    pub fn bus_ios(&self) -> BusIos {
        self.state.lock().ios
    }

    pub fn is_powered(&self) -> bool {
        self.state.lock().powered
    }

    /// Takes the idle engine for a reconfiguration.
    pub(crate) fn reserve(&self, state: EngineState) -> HostResult<EngineReservation<'_, B>> {
        let mut st = self.state.lock();
        if !st.is_idle() {
            return Err(HostError::Busy);
        }
        st.engine = state;
        Ok(EngineReservation { host: self, state })
    }

    /// Submits a request.
    ///
    /// Returns once the command has been issued; the request comes back
    /// through [`HostContext::finalize`]. Errors returned here leave the
    /// controller registers untouched.
    pub fn submit(&self, request: Request) -> HostResult {
        let (seq, desc_addr, resume) = {
            let mut st = self.state.lock();
            if !st.accepts(&request) {
                return Err(HostError::Busy);
            }
            if !st.attached || st.suspended || !st.powered || !st.detector.present() {
                return Err(HostError::NoMedium);
            }
            self.check_request(&request)?;
            let desc_addr = match &request.data {
                Some(data) => {
                    let bus_addr = self.platform.dma.virt_to_bus(st.ring.vaddr());
                    let chain = st.ring.build(&data.segments, bus_addr)?;
                    trace!(
                        "{}: {} descriptors, {} bytes",
                        self.config.name,
                        chain.descriptors().len(),
                        chain.total_len()
                    );
                    Some(bus_addr)
                }
                None => None,
            };
            let resume = st.engine;
            st.engine = EngineState::Arming;
            st.next_seq = st.next_seq.wrapping_add(1);
            (st.next_seq, desc_addr, resume)
        };

        if let Err(err) = self.wait_lines_free() {
            let mut st = self.state.lock();
            st.ring.release();
            st.engine = resume;
            return Err(err);
        }

        let wait = WaitFlags::for_request(&request);
        let cmd = command_word(&request);
        self.program_request(&request, desc_addr);

        let mut st = self.state.lock();
        let imask = self.base_imask(&st) | wait.int_sources() | IntFlags::ERRORS;
        self.bus.write(Reg::Imask, imask.bits());
        trace!(
            "{}: #{} CMD{} arg {:#x} cmd {:#010x} wait {:?}",
            self.config.name,
            seq,
            request.cmd.opcode,
            request.cmd.arg,
            cmd.bits(),
            wait
        );
        st.outstanding = Some(Outstanding {
            request,
            seq,
            wait,
            received: WaitFlags::empty(),
            errors: ErrorFlags::empty(),
            resume,
        });
        st.engine = EngineState::CommandIssued;
        self.bus.write(Reg::Cmd, cmd.bits());
        Ok(())
    }

    fn check_request(&self, req: &Request) -> HostResult {
        let Some(data) = &req.data else {
            return match req.auto {
                Some(_) => Err(HostError::Unsupported),
                None => Ok(()),
            };
        };
        if data.block_size == 0 || data.block_count == 0 {
            return Err(HostError::InvalidBuffer);
        }
        if data.block_count > self.config.max_block_count {
            return Err(HostError::InvalidBuffer);
        }
        let max_xfer = self
            .config
            .max_descriptors
            .checked_mul(self.config.max_segment_size)
            .ok_or(HostError::InvalidBuffer)?;
        let total = data.total_bytes();
        if total > max_xfer || total > u32::MAX as usize || data.mapped_bytes() != total {
            return Err(HostError::InvalidBuffer);
        }
        Ok(())
    }

    fn wait_lines_free(&self) -> HostResult {
        let t = &self.config.timings;
        if self.poll(t.line_free_polls, || {
            !self.status().intersects(StatusFlags::LINES_BUSY)
        }) {
            Ok(())
        } else {
            warn!("{}: data lines busy, request refused", self.config.name);
            Err(HostError::BusTimeout)
        }
    }

    fn program_request(&self, req: &Request, desc_addr: Option<u64>) {
        let bus = &self.bus;
        bus.write(Reg::Rintr, u32::MAX);
        bus.write(Reg::Idst, IdmaInt::ALL.bits());

        if let (Some(data), Some(addr)) = (&req.data, desc_addr) {
            bus.write(Reg::Blksz, data.block_size);
            bus.write(Reg::Bytecnt, data.total_bytes() as u32);
            bus.modify(
                Reg::Gctrl,
                Gctrl::ACCESS_BY_AHB.bits(),
                Gctrl::DMA_ENABLE.bits(),
            );
            bus.write(Reg::Dmac, Dmac::SOFT_RESET.bits());
            bus.write(Reg::Dmac, (Dmac::FIX_BURST | Dmac::IDMAC_ENABLE).bits());
            let done = match data.direction {
                DataDirection::Read => IdmaInt::RX_INT,
                DataDirection::Write => IdmaInt::TX_INT,
            };
            bus.write(Reg::Idie, (done | IdmaInt::ERRORS).bits());
            bus.write(Reg::Dlba, addr as u32);
            match req.auto {
                Some(AutoCommand::Stop { arg }) => bus.write(Reg::A12a, arg),
                Some(AutoCommand::SetBlockCount) => bus.write(Reg::A23a, data.block_count),
                None => {}
            }
        }
        bus.write(Reg::Arg, req.cmd.arg);
    }

    /// Interrupt handler.
    ///
    /// Acknowledges the controller, records what happened and queues a
    /// completion when the outstanding request is done or has failed. It
    /// never completes a request itself.
    pub fn handle_irq(&self) -> IrqOutcome {
        let int = IntFlags::from_bits_retain(self.bus.read(Reg::Rintr));
        let idma = IdmaInt::from_bits_retain(self.bus.read(Reg::Idst));
        let mut out = IrqOutcome::default();
        if int.is_empty() && idma.is_empty() {
            trace!("{}: spurious interrupt", self.config.name);
            return out;
        }
        self.bus.write(Reg::Rintr, int.bits());
        self.bus.write(Reg::Idst, idma.bits());
        out.handled = true;

        let mut st = self.state.lock();
        if int.contains(IntFlags::SDIO_INTERRUPT) && st.sdio_irq_enabled {
            st.sdio_pending = true;
            out.sdio = true;
        }
        if int.intersects(IntFlags::CARD_CHANGE) && st.detector.mode() == DetectMode::Data3Line {
            let input = self.detect_input(&st);
            out.card_event = st.detector.edge(&input);
        }

        let engine = st.engine;
        let Some(o) = st.outstanding.as_mut() else {
            if int.intersects(IntFlags::ERRORS | IntFlags::COMMAND_DONE | IntFlags::DATA_OVER) {
                debug!(
                    "{}: late interrupt {:#x}/{:#x} with nothing outstanding",
                    self.config.name,
                    int.bits(),
                    idma.bits()
                );
            }
            return out;
        };
        let errors = ErrorFlags::from_raw(int, idma).for_command(&o.request.cmd);
        o.received |= WaitFlags::from_raw(int, idma);
        o.errors |= errors;
        if engine == EngineState::CommandIssued
            && (!o.errors.is_empty() || o.received.contains(o.wait))
        {
            let seq = o.seq;
            st.engine = EngineState::Finalizing;
            self.completions.push(CompletionToken { seq });
            out.completion = true;
        }
        out
    }

    /// Gives up on the outstanding request.
    ///
    /// The request is queued for completion with
    /// [`ErrorFlags::SOFTWARE_TIMEOUT`]; interrupts it raises afterwards are
    /// ignored. Returns false when no issued command is waiting.
    pub fn expire_outstanding(&self) -> bool {
        let mut st = self.state.lock();
        if st.engine != EngineState::CommandIssued {
            return false;
        }
        let Some(o) = st.outstanding.as_mut() else {
            return false;
        };
        o.errors |= ErrorFlags::SOFTWARE_TIMEOUT;
        let seq = o.seq;
        st.engine = EngineState::Finalizing;
        self.completions.push(CompletionToken { seq });
        warn!("{}: request #{} expired", self.config.name, seq);
        true
    }

    /// Completion context: hands back the finished request, if any.
    ///
    /// Notifications that do not belong to the outstanding request are
    /// discarded.
    pub fn finalize(&self) -> Option<CompletedRequest> {
        let (resp, has_data, early_errors) = loop {
            let token = self.completions.pop()?;
            let st = self.state.lock();
            match &st.outstanding {
                Some(o) if o.seq == token.seq && st.engine == EngineState::Finalizing => {
                    break (o.request.cmd.resp, o.request.data.is_some(), o.errors);
                }
                _ => trace!("{}: stale completion #{}", self.config.name, token.seq),
            }
        };

        let mut extra = ErrorFlags::empty();
        let response = if early_errors.is_empty() {
            self.read_response(resp)
        } else {
            Response::None
        };
        if early_errors.is_empty() && resp == ResponseKind::ShortBusy && !self.wait_card_idle() {
            extra |= ErrorFlags::CARD_BUSY_TIMEOUT;
        }
        if has_data {
            self.unprogram_dma();
        }

        let errors = {
            let st = self.state.lock();
            st.outstanding.as_ref().map_or(extra, |o| o.errors | extra)
        };
        if !errors.is_empty() {
            if let Err(err) = self.reset_transfer() {
                warn!("{}: transfer reset failed: {}", self.config.name, err);
            }
        }

        let out = {
            let mut st = self.state.lock();
            let out = st.outstanding.take()?;
            st.ring.release();
            st.engine = out.resume;
            self.bus.write(Reg::Imask, self.base_imask(&st).bits());
            out
        };

        let request = out.request;
        if errors.is_empty() {
            let bytes = request.data.as_ref().map_or(0, |d| d.total_bytes());
            trace!("{}: #{} done, {} bytes", self.config.name, out.seq, bytes);
            Some(CompletedRequest {
                request,
                result: Ok(response),
                bytes_transferred: bytes,
                error_flags: errors,
            })
        } else {
            self.report_error(&request, errors);
            Some(CompletedRequest {
                request,
                result: Err(HostError::Protocol(errors)),
                bytes_transferred: 0,
                error_flags: errors,
            })
        }
    }

    fn read_response(&self, kind: ResponseKind) -> Response {
        match kind {
            ResponseKind::None => Response::None,
            ResponseKind::Short | ResponseKind::ShortBusy => {
                Response::Short(self.bus.read(Reg::Resp0))
            }
            ResponseKind::Long => Response::Long(reassemble_long([
                self.bus.read(Reg::Resp0),
                self.bus.read(Reg::Resp1),
                self.bus.read(Reg::Resp2),
                self.bus.read(Reg::Resp3),
            ])),
        }
    }

    fn wait_card_idle(&self) -> bool {
        self.poll(self.config.timings.busy_polls, || !self.card_busy())
    }

    fn unprogram_dma(&self) {
        self.bus.write(Reg::Idie, 0);
        self.bus.write(Reg::Dmac, 0);
        self.bus.modify(Reg::Gctrl, Gctrl::DMA_ENABLE.bits(), 0);
    }

    /// Resets the FIFO and DMA engine after a failed transfer.
    fn reset_transfer(&self) -> HostResult {
        self.bus.write(Reg::Dmac, Dmac::SOFT_RESET.bits());
        self.bus.modify(Reg::Gctrl, 0, Gctrl::RESET_XFER.bits());
        self.wait_reset(Gctrl::RESET_XFER)
    }

    /// Full controller reset.
    pub(crate) fn reset_controller(&self) -> HostResult {
        self.bus.write(Reg::Gctrl, Gctrl::RESET_ALL.bits());
        self.wait_reset(Gctrl::RESET_ALL)
    }

    fn wait_reset(&self, bits: Gctrl) -> HostResult {
        if self.poll(self.config.timings.reset_polls, || {
            self.bus.read(Reg::Gctrl) & bits.bits() == 0
        }) {
            Ok(())
        } else {
            warn!("{}: reset {:?} did not complete", self.config.name, bits);
            Err(HostError::BusTimeout)
        }
    }

    /// Programs the registers a freshly reset controller needs.
    pub(crate) fn program_defaults(&self) {
        let bus = &self.bus;
        bus.write(Reg::Tmout, TMOUT_DEFAULT);
        bus.write(Reg::Ftrgl, FTRGL_DEFAULT);
        bus.write(Reg::Width, WIDTH_1BIT);
        bus.write(Reg::Hwrst, 1);
        bus.write(Reg::Rintr, u32::MAX);
        bus.write(Reg::Idst, IdmaInt::ALL.bits());
        let imask = self.base_imask(&self.state.lock());
        bus.write(Reg::Imask, imask.bits());
        bus.modify(Reg::Gctrl, 0, Gctrl::INT_ENABLE.bits());
    }

    /// Sources unmasked regardless of any request.
    fn base_imask(&self, st: &HostState) -> IntFlags {
        let mut imask = IntFlags::empty();
        imask.set(IntFlags::SDIO_INTERRUPT, st.sdio_irq_enabled);
        imask.set(
            IntFlags::CARD_CHANGE,
            st.detector.mode() == DetectMode::Data3Line,
        );
        imask
    }

    /// Polls `done` up to `budget` times, pausing between attempts.
    pub(crate) fn poll(&self, budget: u32, mut done: impl FnMut() -> bool) -> bool {
        for i in 0..budget.max(1) {
            if done() {
                return true;
            }
            if i + 1 < budget {
                self.platform
                    .timer
                    .delay(self.config.timings.line_poll_interval);
            }
        }
        false
    }

    pub(crate) fn status(&self) -> StatusFlags {
        StatusFlags::from_bits_retain(self.bus.read(Reg::Status))
    }

    /// Applies clock, bus width, timing and power settings.
    pub fn set_bus_ios(&self, ios: BusIos) -> HostResult {
        let ddr = ios.ddr || ios.timing.is_ddr();
        if !self.caps.allows_width(ios.bus_width) || !self.caps.allows_timing(ios.timing) {
            return Err(HostError::Unsupported);
        }
        if ddr && ios.bus_width == BusWidth::Eight && !self.caps.contains(HostCaps::DDR_8BIT) {
            return Err(HostError::Unsupported);
        }
        let _reserved = self.reserve(EngineState::Reconfiguring)?;
        if self.state.lock().suspended {
            return Err(HostError::NoMedium);
        }

        match ios.power {
            PowerMode::Off => {
                self.power_off()?;
                self.state.lock().ios = BusIos {
                    clock_hz: 0,
                    ..ios
                };
                return Ok(());
            }
            PowerMode::Up | PowerMode::On => {
                if self.state.lock().voltage == SignalVoltage::Off {
                    self.power_up()?;
                }
            }
        }

        let width = match ios.bus_width {
            BusWidth::One => WIDTH_1BIT,
            BusWidth::Four => WIDTH_4BIT,
            BusWidth::Eight => WIDTH_8BIT,
        };
        self.bus.write(Reg::Width, width);

        let prev = {
            let mut st = self.state.lock();
            let prev = st.ios;
            st.ios = ios;
            st.ios.ddr = ddr;
            prev
        };
        let clock_changed = prev.clock_hz != ios.clock_hz
            || prev.ddr != ddr
            || prev.bus_width != ios.bus_width
            || prev.timing != ios.timing
            || prev.power == PowerMode::Off;
        if clock_changed {
            self.set_clock(ios.clock_hz, ddr)?;
        }

        let mut st = self.state.lock();
        st.powered = ios.power == PowerMode::On;
        debug!(
            "{}: ios {} Hz, {}-bit, {}, ddr {}, power {:?}",
            self.config.name,
            ios.clock_hz,
            ios.bus_width.lines(),
            ios.timing,
            ddr,
            ios.power
        );
        Ok(())
    }

    /// Debounced card presence.
    pub fn get_card_present(&self) -> bool {
        self.state.lock().detector.present()
    }

    /// Write-protect state; hosts without a WP pin report writable.
    pub fn get_read_only(&self) -> bool {
        let det = &self.config.detect;
        det.wp_pin
            .is_some_and(|pin| self.platform.gpio.read(pin) == det.wp_active_high)
    }

    /// Returns true while the card holds DAT0 low.
    pub fn card_busy(&self) -> bool {
        self.status().contains(StatusFlags::CARD_DATA_BUSY)
    }

    /// Pulses the eMMC hardware reset line.
    pub fn hw_reset(&self) -> HostResult {
        if !self.caps.contains(HostCaps::HW_RESET) {
            return Err(HostError::Unsupported);
        }
        let _reserved = self.reserve(EngineState::Reconfiguring)?;
        let t = &self.config.timings;
        self.bus.write(Reg::Hwrst, 0);
        self.platform.timer.delay(t.hw_reset_pulse);
        self.bus.write(Reg::Hwrst, 1);
        self.platform.timer.delay(t.hw_reset_recovery);
        debug!("{}: hardware reset", self.config.name);
        Ok(())
    }

    /// Arms or disarms the SDIO card interrupt.
    pub fn enable_sdio_irq(&self, enable: bool) -> HostResult {
        if !self.caps.contains(HostCaps::SDIO_IRQ) {
            return Err(HostError::Unsupported);
        }
        let mut st = self.state.lock();
        st.sdio_irq_enabled = enable;
        if !enable {
            st.sdio_pending = false;
        }
        let bit = IntFlags::SDIO_INTERRUPT.bits();
        if enable {
            self.bus.modify(Reg::Imask, 0, bit);
        } else {
            self.bus.modify(Reg::Imask, bit, 0);
        }
        Ok(())
    }

    /// Takes the latched SDIO card interrupt.
    pub fn take_sdio_irq(&self) -> bool {
        core::mem::take(&mut self.state.lock().sdio_pending)
    }

    /// Saves controller state and gates its clocks.
    pub fn suspend(&self) -> HostResult {
        let mut st = self.state.lock();
        if !st.is_idle() {
            return Err(HostError::Busy);
        }
        if st.suspended {
            return Ok(());
        }
        let saved = SAVED_REGS.map(|reg| self.bus.read(reg));
        st.saved = Some(saved);
        st.suspended = true;
        drop(st);

        self.bus.write(Reg::Imask, 0);
        self.platform.irq.disable(self.config.irq);
        self.platform.clock.disable();
        info!("{}: suspended", self.config.name);
        Ok(())
    }

    /// Restores the state saved by [`HostContext::suspend`].
    pub fn resume(&self) -> HostResult {
        let saved = {
            let st = self.state.lock();
            if !st.suspended {
                return Ok(());
            }
            st.saved
        };
        self.platform.clock.enable()?;
        if let Some(saved) = saved {
            let mut card_clock_on = false;
            for (&reg, val) in SAVED_REGS.iter().zip(saved) {
                let val = match reg {
                    Reg::Gctrl => val & !Gctrl::RESET_ALL.bits(),
                    Reg::Clkcr => {
                        card_clock_on = val & Clkcr::CARD_CLK_ON.bits() != 0;
                        val
                    }
                    _ => val,
                };
                self.bus.write(reg, val);
            }
            if card_clock_on {
                self.update_clock()?;
            }
        }
        self.platform.irq.enable(self.config.irq);

        let mut st = self.state.lock();
        st.saved = None;
        st.suspended = false;
        info!("{}: resumed", self.config.name);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Samples the presence inputs for the detector.
    pub(crate) fn detect_input(&self, st: &HostState) -> DetectInput {
        let det = &self.config.detect;
        let status = self.status();
        DetectInput {
            now: self.platform.timer.now(),
            cd_level: det
                .cd_pin
                .map(|pin| self.platform.gpio.read(pin) != det.cd_active_low),
            data3: status.contains(StatusFlags::CARD_PRESENT),
            bus_idle: st.is_idle() && !status.intersects(StatusFlags::LINES_BUSY),
        }
    }

    /// Requests the interrupt source a detect mode depends on.
    pub(crate) fn arm_detect_source(&self, mode: DetectMode) -> HostResult {
        let det = &self.config.detect;
        match (mode, det.cd_pin) {
            (DetectMode::IrqGpio, Some(pin)) => {
                self.platform.gpio.set_debounce(pin, det.debounce)?;
                self.platform.gpio.request_irq(pin, GpioEdge::Both)?;
            }
            (DetectMode::PollGpio | DetectMode::IrqGpio, None) => {
                return Err(HostError::Unsupported);
            }
            (DetectMode::Data3Line, _) => {
                self.bus.modify(Reg::Imask, 0, IntFlags::CARD_CHANGE.bits());
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn disarm_detect_source(&self, mode: DetectMode) {
        match (mode, self.config.detect.cd_pin) {
            (DetectMode::IrqGpio, Some(pin)) => self.platform.gpio.free_irq(pin),
            (DetectMode::Data3Line, _) => {
                self.bus.modify(Reg::Imask, IntFlags::CARD_CHANGE.bits(), 0);
            }
            _ => {}
        }
    }
}

/// Composes the `CMD` register word for `req`.
pub fn command_word(req: &Request) -> CmdFlags {
    let cmd = &req.cmd;
    let opcode = CmdFlags::from_bits_retain(cmd.opcode as u32 & CmdFlags::OPCODE.bits());
    let mut word = CmdFlags::START | opcode;

    if cmd.resp != ResponseKind::None {
        word |= CmdFlags::RESP_EXPECT;
        if cmd.resp == ResponseKind::Long {
            word |= CmdFlags::LONG_RESP;
        }
        if cmd.check_crc {
            word |= CmdFlags::CHECK_RESP_CRC;
        }
    }

    match &req.data {
        Some(data) => {
            word |= CmdFlags::DATA_EXPECT | CmdFlags::WAIT_PRE_OVER;
            if data.direction == DataDirection::Write {
                word |= CmdFlags::WRITE;
            }
            match req.auto {
                Some(AutoCommand::Stop { .. }) => word |= CmdFlags::SEND_AUTO_STOP,
                Some(AutoCommand::SetBlockCount) => word |= CmdFlags::SEND_AUTO_SBC,
                None => {}
            }
        }
        None if cmd.opcode == MMC_STOP_TRANSMISSION => word |= CmdFlags::STOP_ABORT,
        None => word |= CmdFlags::WAIT_PRE_OVER,
    }

    match cmd.opcode {
        MMC_GO_IDLE_STATE => word |= CmdFlags::SEND_INIT_SEQ,
        SD_SWITCH_VOLTAGE if req.data.is_none() => word |= CmdFlags::VOLTAGE_SWITCH,
        _ => {}
    }
    word
}

impl<B: RegisterBus> DriverOps for HostContext<B> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        idma::ScatterSegment,
        request::{Command, Data},
    };

    fn read(blocks: u32) -> Request {
        let seg = ScatterSegment::new(0x4000_0000, 512 * blocks as usize);
        Request::new(Command::new(if blocks > 1 { 18 } else { 17 }, 8, ResponseKind::Short))
            .with_data(Data::new(DataDirection::Read, 512, blocks, std::vec![seg]))
    }

    #[test]
    fn single_block_read_word() {
        let word = command_word(&read(1));
        assert_eq!(
            word,
            CmdFlags::START
                | CmdFlags::from_bits_retain(17)
                | CmdFlags::RESP_EXPECT
                | CmdFlags::CHECK_RESP_CRC
                | CmdFlags::DATA_EXPECT
                | CmdFlags::WAIT_PRE_OVER
        );
        assert_eq!(
            WaitFlags::for_request(&read(1)),
            WaitFlags::DATA_OVER | WaitFlags::DMA_DONE
        );
    }

    #[test]
    fn auto_commands_select_their_bit_and_wait() {
        let stop = read(4).with_auto(AutoCommand::Stop { arg: 0 });
        let word = command_word(&stop);
        assert!(word.contains(CmdFlags::SEND_AUTO_STOP));
        assert!(!word.contains(CmdFlags::SEND_AUTO_SBC));
        assert_eq!(
            WaitFlags::for_request(&stop),
            WaitFlags::AUTO_CMD_DONE | WaitFlags::DMA_DONE
        );

        let sbc = read(4).with_auto(AutoCommand::SetBlockCount);
        let word = command_word(&sbc);
        assert!(word.contains(CmdFlags::SEND_AUTO_SBC));
        assert!(!word.contains(CmdFlags::SEND_AUTO_STOP));
        assert_eq!(
            WaitFlags::for_request(&sbc),
            WaitFlags::DATA_OVER | WaitFlags::DMA_DONE
        );
    }

    #[test]
    fn special_opcodes() {
        let word = command_word(&Request::new(Command::new(0, 0, ResponseKind::None)));
        assert!(word.contains(CmdFlags::SEND_INIT_SEQ | CmdFlags::WAIT_PRE_OVER));
        assert!(!word.contains(CmdFlags::RESP_EXPECT));

        let word = command_word(&Request::new(Command::new(12, 0, ResponseKind::ShortBusy)));
        assert!(word.contains(CmdFlags::STOP_ABORT));
        assert!(!word.contains(CmdFlags::WAIT_PRE_OVER));

        let word = command_word(&Request::new(Command::new(2, 0, ResponseKind::Long)));
        assert!(word.contains(CmdFlags::LONG_RESP | CmdFlags::CHECK_RESP_CRC));

        let word = command_word(&Request::new(Command::new(11, 0, ResponseKind::Short)));
        assert!(word.contains(CmdFlags::VOLTAGE_SWITCH));

        let r3 = Command::new(41, 0, ResponseKind::Short).unchecked();
        let word = command_word(&Request::new(r3));
        assert!(!word.contains(CmdFlags::CHECK_RESP_CRC));
    }

    #[test]
    fn raw_status_to_wait_flags() {
        let got = WaitFlags::from_raw(
            IntFlags::COMMAND_DONE | IntFlags::DATA_OVER,
            IdmaInt::RX_INT,
        );
        assert_eq!(got, WaitFlags::CMD_DONE | WaitFlags::DATA_OVER | WaitFlags::DMA_DONE);
        assert_eq!(
            (WaitFlags::DATA_OVER | WaitFlags::DMA_DONE).int_sources(),
            IntFlags::DATA_OVER
        );
    }
}
