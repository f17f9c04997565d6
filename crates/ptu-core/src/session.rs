//! Session: owns both protocol engines and the device state, and runs the
//! multi-step operations (flashing, self-tests, version queries) on top of
//! the state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{CommandError, FlashEngine};
use crate::events::{PtuEvent, PtuObserver, TracingObserver};
use crate::firmware::{FirmwareError, FwBinHeader, FwVersion};
use crate::pip2::Pip2Engine;
use crate::pip3::Pip3Engine;
use crate::protocol::constants::{
    MAX_NUM_OF_FILES_TO_ERASE, PRIMARY_FW_BIN_FILE_NUM, RSP_MIN_LEN,
};
use crate::protocol::{ExecMode, FwCategory, Generation, ReportId, SysMode};
use crate::self_test::{DataFormat, DataUnit, OutputFormat, decode_values, expected_byte_count};
use crate::state::{
    DeviceState, FlashLoader, HandlerContext, PollPlan, StateContext, TransitionSettings,
    determine_state, set_state,
};
use crate::transport::{
    DEFAULT_I2C_ADDRESS, HidrawTransport, I2cTransport, ObservableTransport, Transport,
};

/// Result bytes a single sensor can take in a self-test response.
const MAX_BYTES_PER_SENSOR: usize = 8;
/// GET_SELF_TEST_RESULTS bytes ahead of the data.
const SELF_TEST_RESULTS_PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("The {generation} API is not attached")]
    NotAttached { generation: Generation },

    #[error("Switching to '{target}' is not supported")]
    Unsupported { target: DeviceState },

    #[error("Device is executing from ROM; the PIP3 ROM boot loader is not supported")]
    RomExec,

    #[error("Unexpected device status: {exec} exec, {sys_mode}")]
    UnexpectedStatus { exec: ExecMode, sys_mode: SysMode },

    #[error("Expected a {expected} firmware image, VERSION reports {actual}")]
    UnexpectedCategory {
        expected: FwCategory,
        actual: FwCategory,
    },

    #[error("Timed out after {waited:?} waiting for {waiting_for}")]
    PollTimeout {
        waiting_for: &'static str,
        waited: Duration,
    },

    #[error("The {active} is already active and is not one of the requested loaders")]
    LoaderConflict { active: FlashLoader },

    #[error("No valid flash loader could be entered")]
    NoLoader,

    #[error("No flash loader is active")]
    NoActiveLoader,

    #[error("{count} files to erase given, at most {max} are supported")]
    TooManyEraseFiles { count: usize, max: usize },

    #[error("Self-test returned {actual} bytes, expected {expected}")]
    SelfTestLength { expected: usize, actual: usize },

    #[error("{source}; cleanup also failed: {cleanup}")]
    Cleanup {
        #[source]
        source: Box<SessionError>,
        cleanup: Box<SessionError>,
    },
}

/// Keep the first error, attaching a cleanup failure to it when both fail.
fn with_cleanup<T>(
    result: Result<T, SessionError>,
    cleanup: Result<(), SessionError>,
) -> Result<T, SessionError> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(e), Err(cleanup)) => Err(SessionError::Cleanup {
            source: Box::new(e),
            cleanup: Box::new(cleanup),
        }),
    }
}

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// hidraw node carrying PIP3.
    pub hidraw_path: Option<PathBuf>,
    /// I2C bus number for PIP2; PIP2 stays unused when absent.
    pub i2c_bus: Option<u32>,
    /// 7-bit I2C slave address of the touch controller.
    pub i2c_address: u8,
    /// Seconds the AUX MCU stays active after a processor switch.
    pub aux_active_duration_secs: u8,
    /// How long to wait for the AUX MCU to take over, in milliseconds.
    pub aux_switch_timeout_ms: u64,
    /// How long to wait for firmware to leave boot mode, in milliseconds.
    pub boot_to_scanning_max_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hidraw_path: None,
            i2c_bus: None,
            i2c_address: DEFAULT_I2C_ADDRESS,
            aux_active_duration_secs: 0,
            aux_switch_timeout_ms: PollPlan::processor_switch().max_wait.as_millis() as u64,
            boot_to_scanning_max_wait_ms: PollPlan::boot_to_scanning().max_wait.as_millis()
                as u64,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn transition_settings(&self) -> TransitionSettings {
        let mut settings = TransitionSettings {
            aux_active_duration: self.aux_active_duration_secs,
            ..Default::default()
        };
        settings.boot_to_scanning.max_wait = Duration::from_millis(self.boot_to_scanning_max_wait_ms);
        settings.processor_switch.max_wait = Duration::from_millis(self.aux_switch_timeout_ms);
        settings
    }
}

/// Self-test results decoded into values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestReport {
    pub self_test_id: u8,
    pub format: DataFormat,
    pub unit: DataUnit,
    pub values: Vec<i32>,
}

/// A connection to one touch controller.
pub struct Session<O: PtuObserver = TracingObserver> {
    pip2: Pip2Engine,
    pip3: Pip3Engine,
    state: StateContext,
    settings: TransitionSettings,
    observer: Arc<O>,
}

impl Session<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: PtuObserver + 'static> Session<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: &SessionConfig, observer: Arc<O>) -> Self {
        Self::with_engines(config, Pip2Engine::new(), Pip3Engine::new(), observer)
    }

    /// Create a session around engines built by the caller (custom timing).
    pub fn with_engines(
        config: &SessionConfig,
        pip2: Pip2Engine,
        pip3: Pip3Engine,
        observer: Arc<O>,
    ) -> Self {
        Self {
            pip2,
            pip3,
            state: StateContext::new(),
            settings: config.transition_settings(),
            observer,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state.state()
    }

    pub fn loader(&self) -> FlashLoader {
        self.state.loader()
    }

    pub fn pip2(&mut self) -> &mut Pip2Engine {
        &mut self.pip2
    }

    pub fn pip3(&mut self) -> &mut Pip3Engine {
        &mut self.pip3
    }

    pub fn aux_active_duration(&self) -> u8 {
        self.settings.aux_active_duration
    }

    pub fn set_aux_active_duration(&mut self, seconds: u8) {
        debug!(seconds, "AUX MCU active duration");
        self.settings.aux_active_duration = seconds;
    }

    fn emit(&self, event: PtuEvent) {
        self.observer.on_event(&event);
    }

    fn observed(&self, channel: Box<dyn Transport>) -> Box<dyn Transport> {
        Box::new(ObservableTransport::new(channel, Arc::clone(&self.observer)))
    }

    /// Attach PIP2 to a raw-bus channel.
    pub fn attach_pip2(&mut self, channel: Box<dyn Transport>) -> Result<(), SessionError> {
        let kind = channel.kind();
        let channel = self.observed(channel);
        self.pip2.setup(channel)?;
        self.emit(PtuEvent::ChannelAttached {
            generation: Generation::Gen2,
            channel: kind,
            vid: 0,
            pid: 0,
        });
        Ok(())
    }

    /// Attach PIP3 to a report channel, listening for solicited responses.
    pub fn attach_pip3(&mut self, channel: Box<dyn Transport>) -> Result<(), SessionError> {
        let kind = channel.kind();
        let channel = self.observed(channel);
        self.pip3.setup(channel, ReportId::SolicitedResponse)?;
        let descriptor = self.pip3.descriptor();
        self.emit(PtuEvent::ChannelAttached {
            generation: Generation::Gen3,
            channel: kind,
            vid: descriptor.vendor_id,
            pid: descriptor.product_id,
        });
        Ok(())
    }

    pub fn open_hidraw(&mut self, path: &Path) -> Result<(), SessionError> {
        info!(path = %path.display(), "Using hidraw node for PIP3");
        self.attach_pip3(Box::new(HidrawTransport::new(path)))
    }

    pub fn open_i2c(&mut self, bus: u32, address: u8) -> Result<(), SessionError> {
        info!(bus, address = %format!("0x{:02X}", address), "Using I2C-DEV for PIP2");
        self.attach_pip2(Box::new(I2cTransport::new(bus, address)))
    }

    /// Release both channels.
    pub fn teardown(&mut self) -> Result<(), SessionError> {
        let pip2 = self.pip2.teardown();
        let pip3 = self.pip3.teardown();
        self.emit(PtuEvent::ChannelDetached {
            generation: Generation::Gen2,
        });
        self.emit(PtuEvent::ChannelDetached {
            generation: Generation::Gen3,
        });
        with_cleanup(pip3.map_err(SessionError::from), pip2.map_err(SessionError::from))
    }

    fn handler_context(&mut self) -> HandlerContext<'_, O> {
        HandlerContext {
            pip2: &mut self.pip2,
            pip3: &mut self.pip3,
            state: &mut self.state,
            observer: self.observer.as_ref(),
            settings: &self.settings,
        }
    }

    /// Query the device and record where it is.
    pub fn determine_state(&mut self) -> Result<DeviceState, SessionError> {
        determine_state(&mut self.handler_context())
    }

    /// Bring the device into `target`.
    pub fn set_state(&mut self, target: DeviceState) -> Result<(), SessionError> {
        set_state(&mut self.handler_context(), target)
    }

    fn flash_engine(&mut self) -> Result<&mut dyn FlashEngine, SessionError> {
        match self.state.loader() {
            FlashLoader::None => Err(SessionError::NoActiveLoader),
            FlashLoader::RomBootloader => Ok(&mut self.pip2),
            FlashLoader::TouchProgrammerImage | FlashLoader::AuxProgrammerImage => {
                Ok(&mut self.pip3)
            }
        }
    }

    /// Write `image` to flash file `file_num`.
    ///
    /// The first loader in `loaders` that is active or can be entered is
    /// used. Each entry of `erase_files` names a config file to erase
    /// beforehand; 0 entries are skipped. The file is always closed and the
    /// loader always exited, whatever happens in between.
    #[instrument(skip(self, image, erase_files, loaders), fields(len = image.len()))]
    pub fn write_image_to_flash_file(
        &mut self,
        file_num: u8,
        image: &[u8],
        erase_files: &[u8],
        loaders: &[FlashLoader],
    ) -> Result<(), SessionError> {
        if erase_files.len() > MAX_NUM_OF_FILES_TO_ERASE {
            error!(
                count = erase_files.len(),
                max = MAX_NUM_OF_FILES_TO_ERASE,
                "Too many files to erase"
            );
            return Err(SessionError::TooManyEraseFiles {
                count: erase_files.len(),
                max: MAX_NUM_OF_FILES_TO_ERASE,
            });
        }

        let mut handle = None;
        let result = self
            .enter_loader(loaders)
            .and_then(|()| self.flash_file(file_num, image, erase_files, &mut handle));

        let close = match handle {
            Some(handle) => self
                .flash_engine()
                .and_then(|engine| engine.file_close(handle).map_err(SessionError::from)),
            None => Ok(()),
        };
        let result = with_cleanup(result, close);
        let exit = self.exit_loader();
        let result = with_cleanup(result, exit);

        match &result {
            Ok(()) => {
                info!(file_num, "Flash file written");
                self.emit(PtuEvent::Complete);
            }
            Err(e) => self.emit(PtuEvent::Error {
                message: e.to_string(),
            }),
        }
        result
    }

    fn flash_file(
        &mut self,
        file_num: u8,
        image: &[u8],
        erase_files: &[u8],
        handle: &mut Option<u8>,
    ) -> Result<(), SessionError> {
        let engine = self.flash_engine()?;
        let opened = engine.file_open(file_num)?;
        *handle = Some(opened);
        debug!(file_num, handle = opened, "Opened flash file");

        engine.file_erase(opened)?;
        for &config_file in erase_files {
            self.erase_config_file(config_file)?;
        }

        let observer = Arc::clone(&self.observer);
        let operation = format!("Writing flash file {file_num}");
        let engine = self.flash_engine()?;
        engine.file_write(opened, image, &mut |written, total| {
            observer.on_event(&PtuEvent::Progress {
                operation: operation.clone(),
                current: written as u64,
                total: total as u64,
            });
        })?;
        Ok(())
    }

    fn erase_config_file(&mut self, file_num: u8) -> Result<(), SessionError> {
        if file_num == 0 {
            debug!("Config file will not be erased");
            return Ok(());
        }
        debug!(file_num, "Erasing config file");

        let engine = self.flash_engine()?;
        let handle = engine.file_open(file_num)?;
        let erase = engine.file_erase(handle).map_err(SessionError::from);
        let close = engine.file_close(handle).map_err(SessionError::from);
        with_cleanup(erase, close)
    }

    fn enter_loader(&mut self, loaders: &[FlashLoader]) -> Result<(), SessionError> {
        let active = self.state.loader();
        if active != FlashLoader::None {
            if loaders.contains(&active) {
                debug!("The {} is already active", active);
                return Ok(());
            }
            error!("The {} is already active", active);
            return Err(SessionError::LoaderConflict { active });
        }

        for &loader in loaders {
            let Some(target) = loader.device_state() else {
                continue;
            };
            match self.set_state(target) {
                Ok(()) => {
                    self.state.set_loader(loader, self.observer.as_ref());
                    debug!("Activated the {} for flash access", loader);
                    return Ok(());
                }
                Err(e) => debug!("Could not enter the {}: {}", loader, e),
            }
        }

        error!("No valid flash loader available or specified");
        Err(SessionError::NoLoader)
    }

    fn exit_loader(&mut self) -> Result<(), SessionError> {
        let initial = self.state.loader();

        if initial == FlashLoader::RomBootloader {
            if !self.pip3.is_active() {
                warn!("Staying in the PIP2 ROM boot loader because the PIP3 API is inactive");
                return Ok(());
            }
            self.set_state(DeviceState::FwSysModeAny)?;
        }

        if let Err(e) = self.set_state(DeviceState::FwScanning) {
            debug!("Left the flash loader but could not enter Scanning mode: {}", e);
        }

        if initial == FlashLoader::TouchProgrammerImage
            && self.state.loader() == FlashLoader::TouchProgrammerImage
        {
            warn!("Stuck in the secondary loader image. Please update the primary touch image.");
        }
        Ok(())
    }

    /// Read the bin header of the primary firmware programmed on the device.
    pub fn read_fw_bin_header(&mut self) -> Result<FwBinHeader, SessionError> {
        self.set_state(DeviceState::FwProgrammerImage)?;

        let mut handle = None;
        let result = self.read_primary_header(&mut handle);

        let close = match handle {
            Some(handle) => self.pip3.file_close(handle).map_err(SessionError::from),
            None => Ok(()),
        };
        let result = with_cleanup(result, close);
        let back = self.set_state(DeviceState::FwScanning);
        with_cleanup(result, back)
    }

    fn read_primary_header(&mut self, handle: &mut Option<u8>) -> Result<FwBinHeader, SessionError> {
        let opened = self.pip3.file_open(PRIMARY_FW_BIN_FILE_NUM)?;
        *handle = Some(opened);
        debug!("Opened the primary firmware bin file");
        let data = self.pip3.file_read(opened, FwBinHeader::SIZE as u16)?;
        Ok(FwBinHeader::parse(&data)?)
    }

    /// Version of the firmware running on the device.
    ///
    /// `Ok(None)` means the device cannot be brought into Scanning mode,
    /// which usually means the firmware needs updating.
    pub fn active_firmware_version(&mut self) -> Result<Option<FwVersion>, SessionError> {
        if let Err(e) = self.set_state(DeviceState::FwScanning) {
            debug!(
                "Unable to reach {} ({}); a firmware update is required",
                DeviceState::FwScanning,
                e
            );
            return Ok(None);
        }
        let info = self.pip3.get_sysinfo()?;
        Ok(Some(FwVersion::from_sysinfo(&info)))
    }

    /// Run a firmware self-test and decode its results.
    ///
    /// Scanning is suspended for the duration and always resumed.
    /// `expected_values`, when known, is checked against the response.
    #[instrument(skip(self, params))]
    pub fn run_self_test(
        &mut self,
        self_test_id: u8,
        output: OutputFormat,
        params: &[u8],
        signed: bool,
        expected_values: Option<usize>,
    ) -> Result<SelfTestReport, SessionError> {
        self.pip3.suspend_scan()?;
        let result = self.self_test_steps(self_test_id, output, params, signed, expected_values);
        let resume = self.pip3.resume_scan().map_err(SessionError::from);
        with_cleanup(result, resume)
    }

    fn self_test_steps(
        &mut self,
        self_test_id: u8,
        output: OutputFormat,
        params: &[u8],
        signed: bool,
        expected_values: Option<usize>,
    ) -> Result<SelfTestReport, SessionError> {
        if !params.is_empty() {
            self.pip3.load_self_test_param(self_test_id, params)?;
        }
        self.pip3.run_self_test(self_test_id)?;

        let capacity = match expected_values {
            Some(values) => {
                values * MAX_BYTES_PER_SENSOR + SELF_TEST_RESULTS_PREFIX_LEN + RSP_MIN_LEN
            }
            None => usize::from(u16::MAX),
        };
        let results = self.pip3.get_self_test_results(self_test_id, capacity)?;

        if results.format == DataFormat::TwoByteUnsignedPlusExtra {
            debug!("Results include the average from the most recent calibration");
        }
        if let Some(values) = expected_values {
            let expected = expected_byte_count(values, output, results.format);
            if results.data.len() != expected {
                error!(
                    expected,
                    actual = results.data.len(),
                    "Unexpected self-test response length"
                );
                return Err(SessionError::SelfTestLength {
                    expected,
                    actual: results.data.len(),
                });
            }
        }

        Ok(SelfTestReport {
            self_test_id,
            format: results.format,
            unit: results.unit,
            values: decode_values(&results.data, output, signed),
        })
    }

    pub fn calibrate(&mut self, mode: u8, data: [u8; 3]) -> Result<(), SessionError> {
        Ok(self.pip3.calibrate(mode, data)?)
    }

    pub fn initialize_baseline(&mut self, data_id_mask: u8) -> Result<(), SessionError> {
        Ok(self.pip3.initialize_baseline(data_id_mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Timing;
    use crate::events::NullObserver;
    use crate::protocol::{Pip2CommandId, Pip3CommandId};
    use crate::transport::{ChannelKind, MockTransport};

    struct Rig {
        session: Session<NullObserver>,
        hid: MockTransport,
        bus: MockTransport,
    }

    fn rig(with_pip2: bool, with_pip3: bool) -> Rig {
        let config = SessionConfig {
            boot_to_scanning_max_wait_ms: 0,
            aux_switch_timeout_ms: 0,
            ..Default::default()
        };
        let mut session = Session::with_engines(
            &config,
            Pip2Engine::with_timing(Timing::immediate()),
            Pip3Engine::with_timing(Timing::immediate()),
            Arc::new(NullObserver),
        );
        let hid = MockTransport::with_kind(ChannelKind::Hidraw);
        let bus = MockTransport::with_kind(ChannelKind::I2cDev);
        if with_pip3 {
            session.attach_pip3(Box::new(hid.clone())).unwrap();
        }
        if with_pip2 {
            session.attach_pip2(Box::new(bus.clone())).unwrap();
        }
        Rig { session, hid, bus }
    }

    const SCANNING: [u8; 4] = [0x01, 0x01, 0x00, 0x00];
    const SECONDARY: [u8; 4] = [0x01, 0x05, 0x00, 0x00];
    const BL_STATUS: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

    fn version(category: u8) -> Vec<u8> {
        let mut payload = vec![0u8; 26];
        payload[8] = category << 4;
        payload
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ptu-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.toml");

        let config = SessionConfig {
            hidraw_path: Some(PathBuf::from("/dev/hidraw0")),
            i2c_bus: Some(3),
            aux_active_duration_secs: 30,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_defaults_fill_missing_keys() {
        let config: SessionConfig = toml::from_str("i2c_bus = 1").unwrap();
        assert_eq!(config.i2c_address, DEFAULT_I2C_ADDRESS);
        assert_eq!(config.boot_to_scanning_max_wait_ms, 2000);
        assert_eq!(config.aux_switch_timeout_ms, 5000);
    }

    #[test]
    fn test_flash_through_rom_bootloader() {
        let mut rig = rig(true, true);
        // Entering: the boot loader already answers.
        rig.bus.queue_pip2_response(0x01, 0, &BL_STATUS);
        rig.bus.queue_pip2_response(0x10, 0, &[0x03]);
        rig.bus.queue_pip2_response(0x14, 0, &[]);
        rig.bus.queue_pip2_response(0x13, 0, &[]);
        rig.bus.queue_pip2_response(0x13, 0, &[]);
        rig.bus.queue_pip2_response(0x11, 0, &[]);
        // Leaving: PIP3 silent, PIP2 STATUS + RESET, then firmware scans.
        rig.hid.queue_timeout();
        rig.bus.queue_pip2_response(0x01, 0, &BL_STATUS);
        rig.hid.queue_pip3_response(0x01, 0, &SCANNING);
        rig.hid.queue_pip3_response(0x01, 0, &SCANNING);

        rig.session
            .write_image_to_flash_file(1, &[0x5A; 300], &[0], &[FlashLoader::RomBootloader])
            .unwrap();

        let ids: Vec<u8> = [
            Pip2CommandId::Status,
            Pip2CommandId::FileOpen,
            Pip2CommandId::FileIoctl,
            Pip2CommandId::FileWrite,
            Pip2CommandId::FileWrite,
            Pip2CommandId::FileClose,
            Pip2CommandId::Status,
            Pip2CommandId::Reset,
        ]
        .iter()
        .map(|c| c.as_u8())
        .collect();
        assert_eq!(rig.bus.sent_command_ids(), ids);
        assert_eq!(rig.session.loader(), FlashLoader::None);
        assert_eq!(rig.session.state(), DeviceState::FwScanning);
    }

    #[test]
    fn test_flash_through_programmer_image() {
        let mut rig = rig(false, true);
        // ROM boot loader is not reachable without PIP2; programmer image is.
        rig.hid.queue_pip3_response(0x01, 0, &SECONDARY);
        rig.hid.queue_pip3_response(0x07, 0, &version(1));
        rig.hid.queue_pip3_response(0x10, 0, &[0x02]);
        rig.hid.queue_pip3_response(0x14, 0, &[]);
        rig.hid.queue_pip3_response(0x13, 0, &[]);
        rig.hid.queue_pip3_response(0x11, 0, &[]);
        rig.hid.queue_pip3_response(0x01, 0, &SECONDARY);
        rig.hid.queue_pip3_response(0x07, 0, &version(0));

        rig.session
            .write_image_to_flash_file(
                1,
                &[0xA5; 40],
                &[],
                &[FlashLoader::RomBootloader, FlashLoader::TouchProgrammerImage],
            )
            .unwrap();

        assert!(rig.bus.get_writes().is_empty());
        assert_eq!(rig.hid.pending_replies(), 0);
        assert_eq!(rig.session.loader(), FlashLoader::None);
        assert_eq!(rig.session.state(), DeviceState::FwScanning);
    }

    #[test]
    fn test_too_many_erase_files() {
        let mut rig = rig(true, true);
        let err = rig
            .session
            .write_image_to_flash_file(1, &[0; 4], &[2; 11], &[FlashLoader::RomBootloader])
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::TooManyEraseFiles { count: 11, max: 10 }
        ));
        assert!(rig.bus.get_writes().is_empty());
        assert!(rig.hid.get_writes().is_empty());
    }

    #[test]
    fn test_write_failure_still_closes_and_exits() {
        let mut rig = rig(true, false);
        rig.bus.queue_pip2_response(0x01, 0, &BL_STATUS);
        rig.bus.queue_pip2_response(0x10, 0, &[0x03]);
        rig.bus.queue_pip2_response(0x14, 0, &[]);
        rig.bus.queue_pip2_response(0x13, 0x0D, &[]);
        rig.bus.queue_pip2_response(0x11, 0, &[]);

        let err = rig
            .session
            .write_image_to_flash_file(1, &[0; 600], &[], &[FlashLoader::RomBootloader])
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Command(CommandError::Status { .. })
        ));
        // One failed FILE_WRITE, no further chunks, then FILE_CLOSE.
        assert_eq!(
            rig.bus.sent_command_ids().last(),
            Some(&Pip2CommandId::FileClose.as_u8())
        );
        assert_eq!(
            rig.bus
                .sent_command_ids()
                .iter()
                .filter(|&&id| id == Pip2CommandId::FileWrite.as_u8())
                .count(),
            1
        );
        // PIP3 is not attached, so the ROM boot loader stays active.
        assert_eq!(rig.session.loader(), FlashLoader::RomBootloader);
    }

    #[test]
    fn test_loader_conflict() {
        let mut rig = rig(true, false);
        rig.bus.queue_pip2_response(0x01, 0, &BL_STATUS);
        rig.bus.queue_pip2_response(0x10, 0, &[0x03]);
        rig.bus.queue_pip2_response(0x14, 0, &[]);
        rig.bus.queue_pip2_response(0x13, 0, &[]);
        rig.bus.queue_pip2_response(0x11, 0, &[]);
        rig.session
            .write_image_to_flash_file(1, &[0; 8], &[], &[FlashLoader::RomBootloader])
            .unwrap();

        let err = rig
            .session
            .write_image_to_flash_file(1, &[0; 8], &[], &[FlashLoader::TouchProgrammerImage])
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::LoaderConflict {
                active: FlashLoader::RomBootloader
            }
        ));
    }

    #[test]
    fn test_no_loader_available() {
        let mut rig = rig(false, true);
        let err = rig
            .session
            .write_image_to_flash_file(1, &[0; 8], &[], &[FlashLoader::RomBootloader])
            .unwrap_err();
        assert!(matches!(err, SessionError::NoLoader));
    }

    #[test]
    fn test_erase_config_files() {
        let mut rig = rig(true, false);
        rig.bus.queue_pip2_response(0x01, 0, &BL_STATUS);
        rig.bus.queue_pip2_response(0x10, 0, &[0x01]);
        rig.bus.queue_pip2_response(0x14, 0, &[]);
        // Config file 3: open, erase, close.
        rig.bus.queue_pip2_response(0x10, 0, &[0x02]);
        rig.bus.queue_pip2_response(0x14, 0, &[]);
        rig.bus.queue_pip2_response(0x11, 0, &[]);
        rig.bus.queue_pip2_response(0x13, 0, &[]);
        rig.bus.queue_pip2_response(0x11, 0, &[]);

        rig.session
            .write_image_to_flash_file(1, &[0; 8], &[0, 3], &[FlashLoader::RomBootloader])
            .unwrap();
        let writes = rig.bus.get_writes();
        // Second FILE_OPEN targets config file 3.
        assert_eq!(writes[3][6], 3);
        assert_eq!(rig.bus.pending_replies(), 0);
    }

    #[test]
    fn test_read_fw_bin_header() {
        let mut rig = rig(false, true);
        let mut header = vec![0u8; FwBinHeader::SIZE];
        header[3] = 4;
        header[4] = 2;
        rig.hid.queue_pip3_response(0x01, 0, &SECONDARY);
        rig.hid.queue_pip3_response(0x07, 0, &version(1));
        rig.hid.queue_pip3_response(0x10, 0, &[0x01]);
        rig.hid.queue_pip3_response(0x12, 0, &header);
        rig.hid.queue_pip3_response(0x11, 0, &[]);
        rig.hid.queue_pip3_response(0x01, 0, &SECONDARY);
        rig.hid.queue_pip3_response(0x07, 0, &version(0));

        let parsed = rig.session.read_fw_bin_header().unwrap();
        assert_eq!((parsed.fw_major, parsed.fw_minor), (4, 2));
        assert_eq!(rig.session.state(), DeviceState::FwScanning);
    }

    #[test]
    fn test_active_firmware_version() {
        let mut rig = rig(false, true);
        assert_eq!(rig.session.active_firmware_version().unwrap(), None);
        assert_eq!(rig.session.state(), DeviceState::Invalid);

        let mut sysinfo = vec![0u8; 49];
        sysinfo[4] = 2;
        sysinfo[5] = 7;
        sysinfo[6..10].copy_from_slice(&1000u32.to_le_bytes());
        sysinfo[10..12].copy_from_slice(&5u16.to_le_bytes());
        rig.hid.queue_pip3_response(0x01, 0, &SCANNING);
        rig.hid.queue_pip3_response(0x32, 0, &sysinfo);
        let version = rig.session.active_firmware_version().unwrap().unwrap();
        assert_eq!(version.to_string(), "2.7.1000.5");
    }

    #[test]
    fn test_self_test_decodes_and_resumes() {
        let mut rig = rig(false, true);
        rig.hid.queue_pip3_response(0x33, 0, &[]);
        rig.hid.queue_pip3_response(0x26, 0, &[]);
        rig.hid.queue_pip3_response(
            0x27,
            0,
            &[0x05, 0x22, 0x04, 0x00, 0xFE, 0xFF, 0x10, 0x00],
        );
        rig.hid.queue_pip3_response(0x34, 0, &[]);

        let report = rig
            .session
            .run_self_test(0x05, OutputFormat::U16, &[], true, Some(2))
            .unwrap();
        assert_eq!(report.values, vec![-2, 16]);
        assert_eq!(report.unit, DataUnit::Counts);
        assert_eq!(
            rig.hid.sent_command_ids(),
            [
                Pip3CommandId::SuspendScan.as_u8(),
                Pip3CommandId::RunSelfTest.as_u8(),
                Pip3CommandId::GetSelfTestResults.as_u8(),
                Pip3CommandId::ResumeScan.as_u8()
            ]
        );
    }

    #[test]
    fn test_self_test_length_mismatch_still_resumes() {
        let mut rig = rig(false, true);
        rig.hid.queue_pip3_response(0x33, 0, &[]);
        rig.hid.queue_pip3_response(0x26, 0, &[]);
        rig.hid
            .queue_pip3_response(0x27, 0, &[0x05, 0x01, 0x02, 0x00, 0x01, 0x00]);
        rig.hid.queue_pip3_response(0x34, 0, &[]);

        let err = rig
            .session
            .run_self_test(0x05, OutputFormat::U16, &[], false, Some(1))
            .unwrap_err();
        // The extra calibration word makes 4 bytes expected.
        assert!(matches!(
            err,
            SessionError::SelfTestLength {
                expected: 4,
                actual: 2
            }
        ));
        assert_eq!(
            rig.hid.sent_command_ids().last(),
            Some(&Pip3CommandId::ResumeScan.as_u8())
        );
    }

    #[test]
    fn test_aux_duration_setting() {
        let mut rig = rig(false, false);
        assert_eq!(rig.session.aux_active_duration(), 0);
        rig.session.set_aux_active_duration(45);
        assert_eq!(rig.session.aux_active_duration(), 45);
    }
}
