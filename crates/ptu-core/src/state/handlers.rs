//! Transition handlers: one per reachable target state.
//!
//! Each handler drives the PIP2/PIP3 engines until the device is in the
//! requested state and returns the state actually reached. [`set_state`]
//! records the outcome and drops to [`DeviceState::Invalid`] on failure.

use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::events::PtuObserver;
use crate::pip2::Pip2Engine;
use crate::pip3::{Pip3Engine, Pip3Status};
use crate::protocol::constants::{
    BOOT_TO_SCANNING_INFO_INTERVAL, BOOT_TO_SCANNING_MAX_WAIT, BOOT_TO_SCANNING_POLL_INTERVAL,
    PROCESSOR_SWITCH_INFO_INTERVAL, PROCESSOR_SWITCH_MAX_WAIT, PROCESSOR_SWITCH_POLL_INTERVAL,
};
use crate::protocol::{ExecMode, FwCategory, Generation, ImageId, Processor, SysMode};
use crate::session::SessionError;
use crate::state::machine::{DeviceState, FlashLoader, StateContext};

/// How a condition is polled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPlan {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Period of the "still waiting" info log.
    pub info_interval: Duration,
}

impl PollPlan {
    pub fn boot_to_scanning() -> Self {
        Self {
            interval: BOOT_TO_SCANNING_POLL_INTERVAL,
            max_wait: BOOT_TO_SCANNING_MAX_WAIT,
            info_interval: BOOT_TO_SCANNING_INFO_INTERVAL,
        }
    }

    pub fn processor_switch() -> Self {
        Self {
            interval: PROCESSOR_SWITCH_POLL_INTERVAL,
            max_wait: PROCESSOR_SWITCH_MAX_WAIT,
            info_interval: PROCESSOR_SWITCH_INFO_INTERVAL,
        }
    }

    fn attempts(&self) -> u128 {
        match self.interval.as_millis() {
            0 => 1,
            interval => (self.max_wait.as_millis() / interval).max(1),
        }
    }

    /// Sleep and re-check `done` until it holds or the plan runs out.
    fn wait_for<F>(&self, waiting_for: &'static str, mut done: F) -> Result<(), SessionError>
    where
        F: FnMut() -> Result<bool, SessionError>,
    {
        let info_every = self.info_interval.as_millis();
        for attempt in 1..=self.attempts() {
            thread::sleep(self.interval);
            let waited = self.interval.as_millis() * attempt;
            if info_every > 0 && waited % info_every == 0 {
                info!("Waiting for {}", waiting_for);
            }
            if done()? {
                debug!(waited_ms = waited as u64, "Done waiting for {}", waiting_for);
                return Ok(());
            }
        }
        error!("Timeout waiting for {}", waiting_for);
        Err(SessionError::PollTimeout {
            waiting_for,
            waited: self.max_wait,
        })
    }
}

/// Knobs the transitions need besides the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSettings {
    /// Seconds the auxiliary MCU stays active after a processor switch.
    pub aux_active_duration: u8,
    pub boot_to_scanning: PollPlan,
    pub processor_switch: PollPlan,
}

impl Default for TransitionSettings {
    fn default() -> Self {
        Self {
            aux_active_duration: 0,
            boot_to_scanning: PollPlan::boot_to_scanning(),
            processor_switch: PollPlan::processor_switch(),
        }
    }
}

/// Everything a transition handler works with.
pub struct HandlerContext<'a, O: PtuObserver + ?Sized> {
    pub pip2: &'a mut Pip2Engine,
    pub pip3: &'a mut Pip3Engine,
    pub state: &'a mut StateContext,
    pub observer: &'a O,
    pub settings: &'a TransitionSettings,
}

impl<O: PtuObserver + ?Sized> HandlerContext<'_, O> {
    fn require_pip3(&self) -> Result<(), SessionError> {
        if self.pip3.is_active() {
            Ok(())
        } else {
            Err(SessionError::NotAttached {
                generation: Generation::Gen3,
            })
        }
    }

    fn require_pip2(&self) -> Result<(), SessionError> {
        if self.pip2.is_active() {
            Ok(())
        } else {
            Err(SessionError::NotAttached {
                generation: Generation::Gen2,
            })
        }
    }

    fn set_loader(&mut self, loader: FlashLoader) {
        self.state.set_loader(loader, self.observer);
    }
}

/// State of an application firmware in the given system mode.
fn classify(sys_mode: SysMode) -> Option<DeviceState> {
    match sys_mode {
        SysMode::Boot => Some(DeviceState::FwBoot),
        SysMode::Scanning => Some(DeviceState::FwScanning),
        SysMode::DeepSleep => Some(DeviceState::FwDeepSleep),
        SysMode::TestConfig => Some(DeviceState::FwTest),
        SysMode::DeepStandby => Some(DeviceState::FwDeepStandby),
        SysMode::SecondaryImage => Some(DeviceState::FwProgrammerImage),
        SysMode::Unknown(_) => None,
    }
}

fn log_status(status: &Pip3Status) {
    debug!(
        exec = %status.exec,
        sys_mode = %status.sys_mode,
        processor = %status.active_processor,
        "PIP3 status"
    );
}

fn expect_category(
    pip3: &mut Pip3Engine,
    expected: FwCategory,
) -> Result<(), SessionError> {
    let version = pip3.version()?;
    if version.category != expected {
        error!(
            expected = %expected,
            actual = %version.category,
            "Unexpected firmware category"
        );
        return Err(SessionError::UnexpectedCategory {
            expected,
            actual: version.category,
        });
    }
    Ok(())
}

/// Ask the device where it is, without changing anything.
pub fn determine_state<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
) -> Result<DeviceState, SessionError> {
    let result = probe_state(ctx);
    let reached = match &result {
        Ok(state) => *state,
        Err(_) => DeviceState::Invalid,
    };
    ctx.state.goto_state(reached, ctx.observer);
    result
}

fn probe_state<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
) -> Result<DeviceState, SessionError> {
    let gen3 = if ctx.pip3.is_active() {
        Some(ctx.pip3.status())
    } else {
        None
    };

    match gen3 {
        Some(Ok(status)) => {
            log_status(&status);
            if status.exec == ExecMode::Rom {
                return Err(SessionError::RomExec);
            }
            if status.active_processor == Processor::AuxMcu {
                let version = ctx.pip3.version()?;
                return match version.category {
                    FwCategory::Utility => Ok(DeviceState::AuxUtilityImage),
                    FwCategory::Programmer => Ok(DeviceState::AuxProgrammerImage),
                    other => Err(SessionError::UnexpectedCategory {
                        expected: FwCategory::Utility,
                        actual: other,
                    }),
                };
            }
            classify(status.sys_mode).ok_or(SessionError::UnexpectedStatus {
                exec: status.exec,
                sys_mode: status.sys_mode,
            })
        }
        gen3 => {
            if !ctx.pip2.is_active() {
                return match gen3 {
                    Some(Err(e)) => Err(e.into()),
                    _ => Err(SessionError::NotAttached {
                        generation: Generation::Gen3,
                    }),
                };
            }
            let status = ctx.pip2.status()?;
            debug!(exec = %status.exec, sys_mode = %status.sys_mode, "PIP2 status");
            Ok(DeviceState::Bootloader)
        }
    }
}

/// Bring the device into `target`.
///
/// On failure the recorded state becomes [`DeviceState::Invalid`].
pub fn set_state<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
    target: DeviceState,
) -> Result<(), SessionError> {
    debug!(target = %target, "Requested device state");
    let result = match target {
        DeviceState::Default => return Ok(()),
        DeviceState::FwSysModeAny => fw_sys_mode_any(ctx).and_then(|status| {
            classify(status.sys_mode).ok_or(SessionError::UnexpectedStatus {
                exec: status.exec,
                sys_mode: status.sys_mode,
            })
        }),
        DeviceState::FwScanning => fw_scanning(ctx),
        DeviceState::Bootloader => bootloader(ctx),
        DeviceState::FwProgrammerImage => programmer_image(ctx),
        DeviceState::AuxUtilityImage | DeviceState::AuxProgrammerImage => aux_image(ctx, target),
        DeviceState::Invalid
        | DeviceState::FwBoot
        | DeviceState::FwDeepSleep
        | DeviceState::FwTest
        | DeviceState::FwDeepStandby => Err(SessionError::Unsupported { target }),
    };

    match result {
        Ok(reached) => {
            ctx.state.goto_state(reached, ctx.observer);
            Ok(())
        }
        Err(e) => {
            error!(target = %target, "Failed to reach the device state: {}", e);
            ctx.state.goto_state(DeviceState::Invalid, ctx.observer);
            Err(e)
        }
    }
}

/// Any RAM-exec system mode. Leaves the ROM boot loader through a PIP2
/// RESET when needed.
fn fw_sys_mode_any<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
) -> Result<Pip3Status, SessionError> {
    ctx.require_pip3()?;

    match ctx.pip3.status() {
        Ok(status) if status.exec == ExecMode::Ram => {
            log_status(&status);
            debug!("Already in the {}", DeviceState::FwSysModeAny);
            let loader = if status.sys_mode == SysMode::SecondaryImage {
                FlashLoader::TouchProgrammerImage
            } else {
                FlashLoader::None
            };
            ctx.set_loader(loader);
            return Ok(status);
        }
        Ok(status) => {
            log_status(&status);
            error!("Stuck in the PIP3 ROM boot loader, which is not supported");
            return Err(SessionError::RomExec);
        }
        Err(e) => debug!("PIP3 STATUS failed, checking for the boot loader: {}", e),
    }

    if ctx.require_pip2().is_err() {
        error!(
            "The device seems stuck in the ROM boot loader, which can only be \
             left through the PIP2 interface on the I2C-DEV channel"
        );
        return Err(SessionError::NotAttached {
            generation: Generation::Gen2,
        });
    }

    let bl_status = ctx.pip2.status().inspect_err(|_| {
        error!("Neither PIP3 nor PIP2 STATUS worked; the boot loader image may be corrupt")
    })?;
    debug!(exec = %bl_status.exec, sys_mode = %bl_status.sys_mode, "PIP2 status");

    ctx.pip2.reset()?;

    let status = ctx.pip3.status().inspect_err(|_| {
        error!("PIP2 RESET did not bring up the application firmware")
    })?;
    log_status(&status);
    if status.exec != ExecMode::Ram {
        return Err(SessionError::UnexpectedStatus {
            exec: status.exec,
            sys_mode: status.sys_mode,
        });
    }
    ctx.set_loader(FlashLoader::None);
    debug!("Now in the {}", DeviceState::FwSysModeAny);
    Ok(status)
}

fn fw_scanning<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
) -> Result<DeviceState, SessionError> {
    let status = fw_sys_mode_any(ctx)?;

    match status.sys_mode {
        SysMode::Scanning => {
            debug!("Already in {}", SysMode::Scanning);
        }
        SysMode::Boot => {
            let plan = ctx.settings.boot_to_scanning;
            let pip3 = &mut *ctx.pip3;
            let mut last = status.sys_mode;
            plan.wait_for("the firmware to exit boot mode", || {
                last = pip3.status()?.sys_mode;
                Ok(last != SysMode::Boot)
            })?;
            if last != SysMode::Scanning {
                return Err(SessionError::UnexpectedStatus {
                    exec: ExecMode::Ram,
                    sys_mode: last,
                });
            }
        }
        SysMode::TestConfig => ctx.pip3.resume_scan()?,
        SysMode::SecondaryImage => {
            ctx.pip3.switch_image(ImageId::Primary)?;
            expect_category(ctx.pip3, FwCategory::Touch)?;
            ctx.set_loader(FlashLoader::None);
        }
        SysMode::DeepSleep | SysMode::DeepStandby | SysMode::Unknown(_) => {
            error!(
                "Switching from {} to {} is not supported",
                status.sys_mode,
                SysMode::Scanning
            );
            return Err(SessionError::UnexpectedStatus {
                exec: status.exec,
                sys_mode: status.sys_mode,
            });
        }
    }
    Ok(DeviceState::FwScanning)
}

fn bootloader<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
) -> Result<DeviceState, SessionError> {
    if ctx.require_pip2().is_err() {
        debug!(
            "The ROM boot loader is only reachable when the PIP2 API is active \
             on the I2C-DEV channel"
        );
        return Err(SessionError::NotAttached {
            generation: Generation::Gen2,
        });
    }

    if ctx.pip2.status_quiet().is_ok() {
        debug!("Already in the {}", DeviceState::Bootloader);
        return Ok(DeviceState::Bootloader);
    }

    ctx.require_pip3()?;
    let status = ctx.pip3.status().inspect_err(|_| {
        error!("Neither PIP2 nor PIP3 STATUS worked")
    })?;
    log_status(&status);

    ctx.pip3.switch_image(ImageId::RomBootloader)?;
    ctx.pip2.status().inspect_err(|_| {
        error!("Switched to the ROM boot loader but PIP2 STATUS failed")
    })?;
    debug!("Now in the {}", DeviceState::Bootloader);
    Ok(DeviceState::Bootloader)
}

fn programmer_image<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
) -> Result<DeviceState, SessionError> {
    if ctx.require_pip3().is_err() {
        debug!("The programmer image is only reachable through the PIP3 API");
        return Err(SessionError::NotAttached {
            generation: Generation::Gen3,
        });
    }

    ctx.pip3.switch_image(ImageId::Secondary)?;
    let status = ctx.pip3.status()?;
    log_status(&status);
    if status.exec != ExecMode::Ram || status.sys_mode != SysMode::SecondaryImage {
        error!(
            "Not in {} exec and {}",
            ExecMode::Ram,
            SysMode::SecondaryImage
        );
        return Err(SessionError::UnexpectedStatus {
            exec: status.exec,
            sys_mode: status.sys_mode,
        });
    }
    expect_category(ctx.pip3, FwCategory::Programmer)?;
    debug!("Entered the secondary image");
    Ok(DeviceState::FwProgrammerImage)
}

fn aux_image<O: PtuObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, O>,
    target: DeviceState,
) -> Result<DeviceState, SessionError> {
    ctx.require_pip3()?;
    let expected = match target {
        DeviceState::AuxProgrammerImage => FwCategory::Programmer,
        _ => FwCategory::Utility,
    };

    let duration = ctx.settings.aux_active_duration;
    if duration == 0 {
        warn!("AUX MCU active duration is 0 s; the switch may not stick");
    }
    ctx.pip3
        .switch_active_processor(Processor::AuxMcu, duration)?;

    let plan = ctx.settings.processor_switch;
    let pip3 = &mut *ctx.pip3;
    plan.wait_for("the AUX MCU to become the active processor", || {
        match pip3.status() {
            Ok(status) => Ok(status.active_processor == Processor::AuxMcu),
            // The bus may be briefly unavailable while processors swap.
            Err(e) if e.is_unreachable() => Ok(false),
            Err(e) => Err(e.into()),
        }
    })?;

    expect_category(ctx.pip3, expected)?;
    Ok(target)
}
