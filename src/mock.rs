//! Scriptable in-memory transport for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::frame::{ClassicWireFrame, FdWireFrame, Timestamp};
use crate::timing::BitTimingConfig;
use crate::transport::{ChannelHandle, Received, Transport, TransportResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Enumerate,
    IsFdCapable(ChannelHandle),
    Init(ChannelHandle, u32),
    InitFd(ChannelHandle, String),
    SetFilter(ChannelHandle, u32, u32),
    Uninit(ChannelHandle),
    Write(ChannelHandle, ClassicWireFrame),
    WriteFd(ChannelHandle, FdWireFrame),
}

#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    Classic(ClassicWireFrame, u64),
    Fd(FdWireFrame, u64),
    Error(TransportError),
}

#[derive(Debug)]
pub(crate) struct MockState {
    pub channels: Vec<ChannelHandle>,
    pub fd_capable: bool,
    pub fail_init: bool,
    pub fail_filter: bool,
    pub fail_write: bool,
    pub fail_uninit: bool,
    pub write_delay: Option<Duration>,
    pub inbound: VecDeque<Inbound>,
    pub calls: Vec<Call>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            channels: vec![ChannelHandle(0x51), ChannelHandle(0x52)],
            fd_capable: true,
            fail_init: false,
            fail_filter: false,
            fail_write: false,
            fail_uninit: false,
            write_delay: None,
            inbound: VecDeque::new(),
            calls: Vec::new(),
        }
    }
}

/// Cloneable handle: the manager owns one clone, the test inspects another
#[derive(Debug, Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state());
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn push_classic(&self, frame: ClassicWireFrame, timestamp_us: u64) {
        self.state()
            .inbound
            .push_back(Inbound::Classic(frame, timestamp_us));
    }

    pub(crate) fn push_fd(&self, frame: FdWireFrame, timestamp_us: u64) {
        self.state().inbound.push_back(Inbound::Fd(frame, timestamp_us));
    }

    pub(crate) fn push_error(&self, error: TransportError) {
        self.state().inbound.push_back(Inbound::Error(error));
    }

    pub(crate) fn pending(&self) -> usize {
        self.state().inbound.len()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn fail_if(flag: bool) -> TransportResult<()> {
        if flag {
            Err(TransportError::Driver("scripted failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Transport for MockTransport {
    fn enumerate(&mut self) -> TransportResult<Vec<ChannelHandle>> {
        self.record(Call::Enumerate);
        Ok(self.state().channels.clone())
    }

    fn is_fd_capable(&mut self, channel: ChannelHandle) -> TransportResult<bool> {
        self.record(Call::IsFdCapable(channel));
        Ok(self.state().fd_capable)
    }

    fn init(&mut self, channel: ChannelHandle, nominal_bitrate: u32) -> TransportResult<()> {
        self.record(Call::Init(channel, nominal_bitrate));
        Self::fail_if(self.state().fail_init)
    }

    fn init_fd(&mut self, channel: ChannelHandle, timing: &BitTimingConfig) -> TransportResult<()> {
        self.record(Call::InitFd(channel, timing.to_config_string()));
        Self::fail_if(self.state().fail_init)
    }

    fn set_filter(&mut self, channel: ChannelHandle, low: u32, high: u32) -> TransportResult<()> {
        self.record(Call::SetFilter(channel, low, high));
        Self::fail_if(self.state().fail_filter)
    }

    fn uninit(&mut self, channel: ChannelHandle) -> TransportResult<()> {
        self.record(Call::Uninit(channel));
        Self::fail_if(self.state().fail_uninit)
    }

    fn write(&mut self, channel: ChannelHandle, frame: &ClassicWireFrame) -> TransportResult<()> {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.record(Call::Write(channel, *frame));
        Self::fail_if(self.state().fail_write)
    }

    fn write_fd(&mut self, channel: ChannelHandle, frame: &FdWireFrame) -> TransportResult<()> {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.record(Call::WriteFd(channel, *frame));
        Self::fail_if(self.state().fail_write)
    }

    fn read(
        &mut self,
        _channel: ChannelHandle,
    ) -> TransportResult<Option<Received<ClassicWireFrame>>> {
        match self.state().inbound.pop_front() {
            None => Ok(None),
            Some(Inbound::Classic(frame, ts)) => Ok(Some(Received::new(frame, Timestamp(ts)))),
            Some(Inbound::Fd(frame, _)) => Err(TransportError::Driver(format!(
                "FD frame 0x{:X} queued on a classic channel",
                frame.id
            ))),
            Some(Inbound::Error(e)) => Err(e),
        }
    }

    fn read_fd(&mut self, _channel: ChannelHandle) -> TransportResult<Option<Received<FdWireFrame>>> {
        match self.state().inbound.pop_front() {
            None => Ok(None),
            Some(Inbound::Fd(frame, ts)) => Ok(Some(Received::new(frame, Timestamp(ts)))),
            Some(Inbound::Classic(frame, ts)) => {
                // Classic frames on an FD channel arrive with the same layout
                let mut fd = FdWireFrame::new();
                fd.id = frame.id;
                fd.flags = frame.flags;
                fd.dlc = frame.dlc;
                fd.data[..8].copy_from_slice(&frame.data);
                Ok(Some(Received::new(fd, Timestamp(ts))))
            }
            Some(Inbound::Error(e)) => Err(e),
        }
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
