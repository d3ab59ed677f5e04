//! Digilent WaveForms runtime (`libdwf`) backend.

use crate::{AcqState, AcquisitionMode, Device, DeviceError, OutFunction, RecordStatus};
use libc::{c_char, c_double, c_int, c_uchar};

type Hdwf = c_int;

const HDWF_NONE: Hdwf = 0;
const PARAM_ON_CLOSE: c_int = 4;
/// Keep the outputs running when the handle is closed.
const ON_CLOSE_RUN: c_int = 0;
const NODE_CARRIER: c_int = 0;
const FUNC_PULSE: c_uchar = 7;
const FUNC_CUSTOM: c_uchar = 30;
const ACQMODE_RECORD: c_int = 3;

#[link(name = "dwf")]
extern "C" {
    fn FDwfGetLastErrorMsg(szError: *mut c_char) -> c_int;
    fn FDwfGetVersion(szVersion: *mut c_char) -> c_int;
    fn FDwfParamSet(param: c_int, value: c_int) -> c_int;

    fn FDwfDeviceOpen(idxDevice: c_int, phdwf: *mut Hdwf) -> c_int;
    fn FDwfDeviceClose(hdwf: Hdwf) -> c_int;
    fn FDwfDeviceAutoConfigureSet(hdwf: Hdwf, autoConfigure: c_int) -> c_int;

    fn FDwfAnalogOutNodeEnableSet(hdwf: Hdwf, idxChannel: c_int, node: c_int, fEnable: c_int) -> c_int;
    fn FDwfAnalogOutNodeFunctionSet(hdwf: Hdwf, idxChannel: c_int, node: c_int, func: c_uchar) -> c_int;
    fn FDwfAnalogOutNodeDataSet(
        hdwf: Hdwf,
        idxChannel: c_int,
        node: c_int,
        rgdData: *const c_double,
        cdData: c_int,
    ) -> c_int;
    fn FDwfAnalogOutNodeFrequencySet(hdwf: Hdwf, idxChannel: c_int, node: c_int, hzFrequency: c_double) -> c_int;
    fn FDwfAnalogOutNodeAmplitudeSet(hdwf: Hdwf, idxChannel: c_int, node: c_int, vAmplitude: c_double) -> c_int;
    fn FDwfAnalogOutRunSet(hdwf: Hdwf, idxChannel: c_int, secRun: c_double) -> c_int;
    fn FDwfAnalogOutWaitSet(hdwf: Hdwf, idxChannel: c_int, secWait: c_double) -> c_int;
    fn FDwfAnalogOutRepeatSet(hdwf: Hdwf, idxChannel: c_int, cRepeat: c_int) -> c_int;
    fn FDwfAnalogOutConfigure(hdwf: Hdwf, idxChannel: c_int, fStart: c_int) -> c_int;
    fn FDwfAnalogOutReset(hdwf: Hdwf, idxChannel: c_int) -> c_int;

    fn FDwfAnalogInChannelEnableSet(hdwf: Hdwf, idxChannel: c_int, fEnable: c_int) -> c_int;
    fn FDwfAnalogInChannelRangeSet(hdwf: Hdwf, idxChannel: c_int, voltsRange: c_double) -> c_int;
    fn FDwfAnalogInAcquisitionModeSet(hdwf: Hdwf, acqmode: c_int) -> c_int;
    fn FDwfAnalogInFrequencySet(hdwf: Hdwf, hzFrequency: c_double) -> c_int;
    fn FDwfAnalogInRecordLengthSet(hdwf: Hdwf, sLength: c_double) -> c_int;
    fn FDwfAnalogInConfigure(hdwf: Hdwf, fReconfigure: c_int, fStart: c_int) -> c_int;
    fn FDwfAnalogInReset(hdwf: Hdwf) -> c_int;
    fn FDwfAnalogInStatus(hdwf: Hdwf, fReadData: c_int, psts: *mut c_uchar) -> c_int;
    fn FDwfAnalogInStatusRecord(
        hdwf: Hdwf,
        pcdDataAvailable: *mut c_int,
        pcdDataLost: *mut c_int,
        pcdDataCorrupt: *mut c_int,
    ) -> c_int;
    fn FDwfAnalogInStatusData(hdwf: Hdwf, idxChannel: c_int, rgdVoltData: *mut c_double, cdData: c_int) -> c_int;
}

fn read_c_string(buffer: &[u8]) -> String {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).trim().to_owned()
}

pub fn last_error_msg() -> String {
    let mut buffer = vec![0u8; 512];
    unsafe { FDwfGetLastErrorMsg(buffer.as_mut_ptr() as *mut c_char) };
    read_c_string(&buffer)
}

pub fn version() -> String {
    let mut buffer = vec![0u8; 32];
    let res = unsafe { FDwfGetVersion(buffer.as_mut_ptr() as *mut c_char) };
    if res == 0 {
        return String::new();
    }
    read_c_string(&buffer)
}

/// Map a `BOOL` return into a `Result`.
fn check(call: &'static str, res: c_int) -> Result<(), DeviceError> {
    if res != 0 {
        Ok(())
    } else {
        Err(DeviceError::Call {
            call,
            message: last_error_msg(),
        })
    }
}

fn flag(value: bool) -> c_int {
    c_int::from(value)
}

fn count(call: &'static str, n: usize) -> Result<c_int, DeviceError> {
    c_int::try_from(n).map_err(|_| DeviceError::Call {
        call,
        message: format!("{n} samples exceed the library's buffer size type"),
    })
}

/// First device found by the WaveForms runtime, e.g. an Analog Discovery 2.
#[derive(Debug)]
pub struct DwfDevice {
    index: c_int,
    hdwf: Hdwf,
}

impl Default for DwfDevice {
    fn default() -> Self {
        Self::new(-1)
    }
}

impl DwfDevice {
    /// `index` of -1 opens the first available device.
    pub fn new(index: i32) -> Self {
        Self {
            index,
            hdwf: HDWF_NONE,
        }
    }

    fn handle(&self) -> Result<Hdwf, DeviceError> {
        if self.hdwf == HDWF_NONE {
            Err(DeviceError::NotOpen)
        } else {
            Ok(self.hdwf)
        }
    }
}

impl Drop for DwfDevice {
    fn drop(&mut self) {
        if self.hdwf != HDWF_NONE {
            unsafe { FDwfDeviceClose(self.hdwf) };
        }
    }
}

impl Device for DwfDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        check("FDwfParamSet", unsafe { FDwfParamSet(PARAM_ON_CLOSE, ON_CLOSE_RUN) })?;
        let mut hdwf = HDWF_NONE;
        let res = unsafe { FDwfDeviceOpen(self.index, &mut hdwf) };
        if res == 0 || hdwf == HDWF_NONE {
            let msg = last_error_msg();
            return Err(DeviceError::NotFound(if msg.is_empty() {
                "Failed to open device".into()
            } else {
                msg
            }));
        }
        self.hdwf = hdwf;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let h = self.handle()?;
        self.hdwf = HDWF_NONE;
        check("FDwfDeviceClose", unsafe { FDwfDeviceClose(h) })
    }

    fn is_open(&self) -> bool {
        self.hdwf != HDWF_NONE
    }

    fn version(&self) -> String {
        version()
    }

    fn last_error(&self) -> String {
        last_error_msg()
    }

    fn set_auto_configure(&mut self, enable: bool) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfDeviceAutoConfigureSet", unsafe {
            FDwfDeviceAutoConfigureSet(h, flag(enable))
        })
    }

    fn out_enable(&mut self, channel: i32, enable: bool) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutNodeEnableSet", unsafe {
            FDwfAnalogOutNodeEnableSet(h, channel, NODE_CARRIER, flag(enable))
        })
    }

    fn out_function(&mut self, channel: i32, function: OutFunction) -> Result<(), DeviceError> {
        let h = self.handle()?;
        let func = match function {
            OutFunction::Pulse => FUNC_PULSE,
            OutFunction::Custom => FUNC_CUSTOM,
        };
        check("FDwfAnalogOutNodeFunctionSet", unsafe {
            FDwfAnalogOutNodeFunctionSet(h, channel, NODE_CARRIER, func)
        })
    }

    fn out_data(&mut self, channel: i32, data: &[f64]) -> Result<(), DeviceError> {
        let h = self.handle()?;
        let n = count("FDwfAnalogOutNodeDataSet", data.len())?;
        check("FDwfAnalogOutNodeDataSet", unsafe {
            FDwfAnalogOutNodeDataSet(h, channel, NODE_CARRIER, data.as_ptr(), n)
        })
    }

    fn out_frequency(&mut self, channel: i32, hz: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutNodeFrequencySet", unsafe {
            FDwfAnalogOutNodeFrequencySet(h, channel, NODE_CARRIER, hz)
        })
    }

    fn out_amplitude(&mut self, channel: i32, volts: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutNodeAmplitudeSet", unsafe {
            FDwfAnalogOutNodeAmplitudeSet(h, channel, NODE_CARRIER, volts)
        })
    }

    fn out_run(&mut self, channel: i32, seconds: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutRunSet", unsafe { FDwfAnalogOutRunSet(h, channel, seconds) })
    }

    fn out_wait(&mut self, channel: i32, seconds: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutWaitSet", unsafe { FDwfAnalogOutWaitSet(h, channel, seconds) })
    }

    fn out_repeat(&mut self, channel: i32, count: i32) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutRepeatSet", unsafe { FDwfAnalogOutRepeatSet(h, channel, count) })
    }

    fn out_configure(&mut self, channel: i32, start: bool) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutConfigure", unsafe {
            FDwfAnalogOutConfigure(h, channel, flag(start))
        })
    }

    fn out_reset(&mut self, channel: i32) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogOutReset", unsafe { FDwfAnalogOutReset(h, channel) })
    }

    fn in_channel_enable(&mut self, channel: i32, enable: bool) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogInChannelEnableSet", unsafe {
            FDwfAnalogInChannelEnableSet(h, channel, flag(enable))
        })
    }

    fn in_channel_range(&mut self, channel: i32, volts: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogInChannelRangeSet", unsafe {
            FDwfAnalogInChannelRangeSet(h, channel, volts)
        })
    }

    fn in_acquisition_mode(&mut self, mode: AcquisitionMode) -> Result<(), DeviceError> {
        let h = self.handle()?;
        let mode = match mode {
            AcquisitionMode::Record => ACQMODE_RECORD,
        };
        check("FDwfAnalogInAcquisitionModeSet", unsafe {
            FDwfAnalogInAcquisitionModeSet(h, mode)
        })
    }

    fn in_frequency(&mut self, hz: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogInFrequencySet", unsafe { FDwfAnalogInFrequencySet(h, hz) })
    }

    fn in_record_length(&mut self, seconds: f64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogInRecordLengthSet", unsafe {
            FDwfAnalogInRecordLengthSet(h, seconds)
        })
    }

    fn in_configure(&mut self, reconfigure: bool, start: bool) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogInConfigure", unsafe {
            FDwfAnalogInConfigure(h, flag(reconfigure), flag(start))
        })
    }

    fn in_reset(&mut self) -> Result<(), DeviceError> {
        let h = self.handle()?;
        check("FDwfAnalogInReset", unsafe { FDwfAnalogInReset(h) })
    }

    fn in_status(&mut self, read_data: bool) -> Result<AcqState, DeviceError> {
        let h = self.handle()?;
        let mut sts: c_uchar = 0;
        check("FDwfAnalogInStatus", unsafe {
            FDwfAnalogInStatus(h, flag(read_data), &mut sts)
        })?;
        Ok(match sts {
            0 => AcqState::Ready,
            1 => AcqState::Armed,
            2 => AcqState::Done,
            3 => AcqState::Running,
            4 => AcqState::Configuring,
            5 => AcqState::Prefilling,
            _ => AcqState::Waiting,
        })
    }

    fn in_status_record(&mut self) -> Result<RecordStatus, DeviceError> {
        let h = self.handle()?;
        let (mut available, mut lost, mut corrupted): (c_int, c_int, c_int) = (0, 0, 0);
        check("FDwfAnalogInStatusRecord", unsafe {
            FDwfAnalogInStatusRecord(h, &mut available, &mut lost, &mut corrupted)
        })?;
        Ok(RecordStatus::new(
            available.max(0) as usize,
            lost.max(0) as usize,
            corrupted.max(0) as usize,
        ))
    }

    fn in_status_data(&mut self, channel: i32, dest: &mut [f64]) -> Result<(), DeviceError> {
        let h = self.handle()?;
        let n = count("FDwfAnalogInStatusData", dest.len())?;
        check("FDwfAnalogInStatusData", unsafe {
            FDwfAnalogInStatusData(h, channel, dest.as_mut_ptr(), n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_string_stops_at_nul() {
        assert_eq!(read_c_string(b"3.20.1\0\0garbage"), "3.20.1");
        assert_eq!(read_c_string(b"no terminator"), "no terminator");
    }

    #[test]
    fn unopened_device() {
        let mut dev = DwfDevice::default();
        assert!(!dev.is_open());
        assert_eq!(dev.in_frequency(1e6), Err(DeviceError::NotOpen));
    }
}
