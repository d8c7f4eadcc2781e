//! CAN connection manager
//!
//! `CanManager` owns one transport and at most one active channel. It wires
//! the connection state machine, the transmit gate, the background receive
//! loop and the subscriber registry together.
//!
//! Three locks are involved and only connection transitions hold more than
//! one at a time:
//! - the lifecycle lock serializes connect, disconnect and receive control,
//! - the transport lock guards the driver handle and connection state,
//! - the registry lock guards the subscriber list.

use std::sync::atomic::AtomicU8;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};

use crate::connection::{
    lock, AcceptanceFilter, ConnectionEvent, ConnectionState, Observers, Port,
};
use crate::constants::DEFAULT_IDLE_BACKOFF;
use crate::error::{CanError, Result};
use crate::frame::{BusMode, Frame, Timestamp};
use crate::receiver::{self, Inbound, ReceiveLoop, ReceiveState};
use crate::registry::{Continuation, SubscriberId, SubscriberRegistry};
use crate::timing;
use crate::transmit::TransmitGate;
use crate::transport::{ChannelHandle, Transport, TransportResult};

/// Manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Sleep applied by the receive loop when no frame is pending
    pub idle_backoff: Duration,
    /// Start the receive loop on every successful connect
    pub auto_receive: bool,
    /// Pause after each write before the next sender gets its turn
    pub transmit_backoff: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            auto_receive: true,
            transmit_backoff: None,
        }
    }
}

impl ManagerConfig {
    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_auto_receive(mut self, auto_receive: bool) -> Self {
        self.auto_receive = auto_receive;
        self
    }

    pub fn with_transmit_backoff(mut self, transmit_backoff: Option<Duration>) -> Self {
        self.transmit_backoff = transmit_backoff;
        self
    }
}

#[derive(Default)]
struct Lifecycle {
    receiver: Option<ReceiveLoop>,
    /// Outcome of the most recent channel release
    last_release: Option<TransportResult<()>>,
}

/// Thread-safe CAN / CAN FD connection manager
///
/// # Example
///
/// ```no_run
/// use can_manager::{CanManager, Continuation, Frame, GsUsbTransport};
///
/// let mut transport = GsUsbTransport::new();
/// let channel = match can_manager::Transport::enumerate(&mut transport)?.first() {
///     Some(&channel) => channel,
///     None => return Ok(()),
/// };
///
/// let manager = CanManager::new(transport);
/// manager.connect(channel, 500_000)?;
/// manager.add_receive_callback(|frame, timestamp| {
///     println!("{:>12.6}  {}", timestamp.as_secs_f64(), frame);
///     Continuation::Continue
/// });
///
/// manager.send_classic(&Frame::new(0x123, &[0x01, 0x02, 0x03, 0x04])?)?;
/// manager.disconnect()?;
/// # Ok::<(), can_manager::CanError>(())
/// ```
pub struct CanManager<T: Transport + 'static> {
    config: ManagerConfig,
    lifecycle: Mutex<Lifecycle>,
    /// State of the current receive loop; readable while `lifecycle` is held
    receive_state: Mutex<Option<Arc<AtomicU8>>>,
    port: Arc<Mutex<Port<T>>>,
    registry: Arc<SubscriberRegistry>,
    gate: TransmitGate,
    observers: Observers,
}

impl<T: Transport + 'static> CanManager<T> {
    /// Create a manager with the default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ManagerConfig::default())
    }

    /// Create a manager with a custom configuration
    pub fn with_config(transport: T, config: ManagerConfig) -> Self {
        Self {
            gate: TransmitGate::new(config.transmit_backoff),
            config,
            lifecycle: Mutex::new(Lifecycle::default()),
            receive_state: Mutex::new(None),
            port: Arc::new(Mutex::new(Port::new(transport))),
            registry: Arc::new(SubscriberRegistry::new()),
            observers: Observers::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Channels the transport currently reports as available
    pub fn available_channels(&self) -> Result<Vec<ChannelHandle>> {
        Ok(lock(&self.port).transport.enumerate()?)
    }

    /// Check if a channel can run CAN FD
    pub fn is_fd_capable(&self, channel: ChannelHandle) -> Result<bool> {
        Ok(lock(&self.port).transport.is_fd_capable(channel)?)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Connect a classic CAN channel accepting every identifier
    pub fn connect(&self, channel: ChannelHandle, nominal_bitrate: u32) -> Result<()> {
        self.connect_with_filter(channel, nominal_bitrate, AcceptanceFilter::default())
    }

    /// Connect a classic CAN channel with an explicit acceptance range
    pub fn connect_with_filter(
        &self,
        channel: ChannelHandle,
        nominal_bitrate: u32,
        filter: AcceptanceFilter,
    ) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        lock(&self.port).open(channel, nominal_bitrate, filter)?;
        info!(
            "Connected channel {} at {} bit/s (classic CAN)",
            channel, nominal_bitrate
        );
        self.finish_connect(&mut lifecycle, channel, BusMode::Classic)
    }

    /// Connect a CAN FD channel accepting every identifier
    pub fn connect_fd(
        &self,
        channel: ChannelHandle,
        nominal_bitrate: u32,
        data_bitrate: u32,
    ) -> Result<()> {
        self.connect_fd_with_filter(
            channel,
            nominal_bitrate,
            data_bitrate,
            AcceptanceFilter::default(),
        )
    }

    /// Connect a CAN FD channel with an explicit acceptance range
    ///
    /// The rate pair and the channel's FD capability are both validated
    /// before the transport is initialized.
    pub fn connect_fd_with_filter(
        &self,
        channel: ChannelHandle,
        nominal_bitrate: u32,
        data_bitrate: u32,
        filter: AcceptanceFilter,
    ) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        let timing = timing::lookup(nominal_bitrate, data_bitrate)?;
        lock(&self.port).open_fd(channel, &timing, filter)?;
        info!(
            "Connected channel {} at {}/{} bit/s (CAN FD)",
            channel, nominal_bitrate, data_bitrate
        );
        self.finish_connect(&mut lifecycle, channel, BusMode::Fd)
    }

    fn finish_connect(
        &self,
        lifecycle: &mut Lifecycle,
        channel: ChannelHandle,
        mode: BusMode,
    ) -> Result<()> {
        if self.config.auto_receive {
            if let Err(e) = self.start_loop(lifecycle) {
                if let Some((_, Err(release))) = lock(&self.port).close() {
                    warn!("Failed to release channel {}: {}", channel, release);
                }
                return Err(e);
            }
        }
        self.observers
            .emit(ConnectionEvent::Connected { channel, mode });
        Ok(())
    }

    /// Disconnect the active channel
    ///
    /// Stops and joins the receive loop before the channel is released, so no
    /// subscriber runs once this returns. Calling it while disconnected is a
    /// no-op that reports the outcome of the previous release.
    pub fn disconnect(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        self.stop_loop(&mut lifecycle);

        // Waits for any in-flight write before releasing
        let closed = lock(&self.port).close();
        match closed {
            Some((channel, outcome)) => {
                match &outcome {
                    Ok(()) => info!("Disconnected channel {}", channel),
                    Err(e) => warn!("Channel {} released with error: {}", channel, e),
                }
                lifecycle.last_release = Some(outcome.clone());
                self.observers
                    .emit(ConnectionEvent::Disconnected { channel });
                Ok(outcome?)
            }
            None => Ok(lifecycle.last_release.clone().unwrap_or(Ok(()))?),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        lock(&self.port).state
    }

    /// Check if a channel is active
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Active channel, if connected
    pub fn connected_channel(&self) -> Option<ChannelHandle> {
        self.state().link().map(|(channel, _)| channel)
    }

    /// Bus mode of the active channel, if connected
    pub fn bus_mode(&self) -> Option<BusMode> {
        self.state().link().map(|(_, mode)| mode)
    }

    /// Receive connect/disconnect notifications
    ///
    /// Events are queued on an unbounded channel, one per transition, in
    /// transition order. Dropping the receiver unsubscribes.
    pub fn subscribe_connection_events(&self) -> Receiver<ConnectionEvent> {
        self.observers.subscribe()
    }

    // ------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------

    /// Send a frame in the given bus mode
    ///
    /// Blocks while another sender is writing. The mode must match the
    /// connection's mode.
    pub fn send(&self, frame: &Frame, mode: BusMode) -> Result<()> {
        self.gate.send(&self.port, frame, mode)
    }

    /// Send a classic CAN frame (up to 8 bytes)
    pub fn send_classic(&self, frame: &Frame) -> Result<()> {
        self.send(frame, BusMode::Classic)
    }

    /// Send a CAN FD frame (up to 64 bytes, padded to the next length code)
    pub fn send_fd(&self, frame: &Frame) -> Result<()> {
        self.send(frame, BusMode::Fd)
    }

    /// Check if any send is waiting or writing
    pub fn is_transmitting(&self) -> bool {
        self.gate.is_transmitting()
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Register a receive callback
    ///
    /// Callbacks run on the receive thread, latest-registered first, and
    /// return [`Continuation::Unsubscribe`] to remove themselves. The set is
    /// cleared whenever the receive loop stops.
    pub fn add_receive_callback<F>(&self, callback: F) -> SubscriberId
    where
        F: FnMut(&Frame, Timestamp) -> Continuation + Send + 'static,
    {
        self.registry.add(callback)
    }

    /// Remove a receive callback; returns `false` if it was not registered
    pub fn remove_receive_callback(&self, id: SubscriberId) -> bool {
        self.registry.remove(id)
    }

    /// Number of registered receive callbacks
    pub fn receive_callback_count(&self) -> usize {
        self.registry.len()
    }

    /// Start the background receive loop
    ///
    /// No-op if it is already running.
    pub fn start_receiving(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if !self.state().is_connected() {
            return Err(CanError::NotConnected);
        }
        self.start_loop(&mut lifecycle)
    }

    /// Stop the background receive loop and wait for it to exit
    ///
    /// Clears every receive callback. The connection stays up.
    pub fn stop_receiving(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        self.stop_loop(&mut lifecycle);
        Ok(())
    }

    /// State of the receive loop; `Idle` when none has been started
    pub fn receive_state(&self) -> ReceiveState {
        lock(&self.receive_state)
            .as_deref()
            .map_or(ReceiveState::Idle, ReceiveState::load)
    }

    /// Poll the transport once for a frame
    ///
    /// Returns `None` when the queue is empty or a status frame was read.
    /// Meant for use without the receive loop; with it running, frames are
    /// split between the two readers.
    pub fn try_receive(&self) -> Result<Option<(Frame, Timestamp)>> {
        match receiver::poll(&self.port)? {
            Inbound::Data(frame, timestamp) => Ok(Some((frame, timestamp))),
            Inbound::Status | Inbound::Empty => Ok(None),
        }
    }

    fn start_loop(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        if lifecycle
            .receiver
            .as_ref()
            .is_some_and(ReceiveLoop::is_running)
        {
            return Ok(());
        }
        // Join a loop that exited on its own before replacing it
        self.stop_loop(lifecycle);

        let mut rx_loop = ReceiveLoop::new();
        rx_loop.start(
            Arc::clone(&self.port),
            Arc::clone(&self.registry),
            self.config.idle_backoff,
        )?;
        *lock(&self.receive_state) = Some(rx_loop.shared_state());
        lifecycle.receiver = Some(rx_loop);
        Ok(())
    }

    fn stop_loop(&self, lifecycle: &mut Lifecycle) {
        if let Some(mut rx_loop) = lifecycle.receiver.take() {
            rx_loop.stop();
        }
        *lock(&self.receive_state) = None;
    }

    /// Take the lifecycle lock; refused on the receive thread, where waiting
    /// for the loop to stop would wait on ourselves
    fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
        if receiver::on_receive_thread() {
            return Err(CanError::CalledFromReceiveThread);
        }
        Ok(lock(&self.lifecycle))
    }
}

impl<T: Transport + 'static> std::fmt::Debug for CanManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanManager")
            .field("state", &self.state())
            .field("receive_state", &self.receive_state())
            .field("subscribers", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Transport + 'static> Drop for CanManager<T> {
    fn drop(&mut self) {
        // Try to release the channel when dropped
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CANFD_DLC_TO_LEN;
    use crate::frame::{encode_classic, encode_fd};
    use crate::mock::{wait_until, Call, MockTransport};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    const CH: ChannelHandle = ChannelHandle(0x51);

    fn manager() -> (MockTransport, CanManager<MockTransport>) {
        let mock = MockTransport::new();
        let config = ManagerConfig::default().with_idle_backoff(Duration::from_millis(1));
        (mock.clone(), CanManager::with_config(mock, config))
    }

    fn classic(id: u32, data: &[u8]) -> crate::frame::ClassicWireFrame {
        encode_classic(&Frame::new(id, data).unwrap()).unwrap()
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (mock, manager) = manager();
        let events = manager.subscribe_connection_events();

        manager.connect(CH, 500_000).unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.connected_channel(), Some(CH));
        assert_eq!(manager.bus_mode(), Some(BusMode::Classic));
        assert_eq!(manager.receive_state(), ReceiveState::Running);

        manager.disconnect().unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.receive_state(), ReceiveState::Idle);

        assert_eq!(
            events.try_recv().unwrap(),
            ConnectionEvent::Connected {
                channel: CH,
                mode: BusMode::Classic
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectionEvent::Disconnected { channel: CH }
        );
        assert!(events.try_recv().is_err());

        let calls = mock.calls();
        assert_eq!(calls[0], Call::Init(CH, 500_000));
        assert_eq!(calls[1], Call::SetFilter(CH, 0, 0x1FFF_FFFF));
        assert_eq!(calls.last(), Some(&Call::Uninit(CH)));
    }

    #[test]
    fn test_connect_with_filter() {
        let (mock, manager) = manager();
        manager
            .connect_with_filter(CH, 250_000, AcceptanceFilter::new(0x700, 0x7FF))
            .unwrap();
        assert!(mock.calls().contains(&Call::SetFilter(CH, 0x700, 0x7FF)));
    }

    #[test]
    fn test_connect_while_connected() {
        let (_mock, manager) = manager();
        let events = manager.subscribe_connection_events();
        manager.connect(CH, 500_000).unwrap();

        assert_eq!(
            manager.connect(ChannelHandle(0x52), 500_000),
            Err(CanError::AlreadyConnected(CH))
        );
        assert_eq!(manager.connected_channel(), Some(CH));
        assert!(events.try_recv().unwrap().is_connected());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_failed_connect_leaves_disconnected() {
        let (mock, manager) = manager();
        let events = manager.subscribe_connection_events();
        mock.update(|s| s.fail_init = true);

        let err = manager.connect(CH, 500_000).unwrap_err();
        assert!(err.is_transport_error());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.receive_state(), ReceiveState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_connect_fd() {
        let (mock, manager) = manager();
        manager.connect_fd(CH, 500_000, 2_000_000).unwrap();
        assert_eq!(manager.bus_mode(), Some(BusMode::Fd));
        assert_eq!(
            mock.calls()[..2],
            [
                Call::IsFdCapable(CH),
                Call::InitFd(
                    CH,
                    "f_clock = 80000000, nom_brp = 10, nom_tseg1 = 12, nom_tseg2 = 3, nom_sjw = 1, \
                     data_brp = 4, data_tseg1 = 7, data_tseg2 = 2, data_sjw = 1"
                        .into()
                )
            ]
        );
    }

    #[test]
    fn test_connect_fd_without_capability() {
        let (mock, manager) = manager();
        mock.update(|s| s.fd_capable = false);

        let err = manager.connect_fd(CH, 500_000, 2_000_000).unwrap_err();
        assert_eq!(err, CanError::FdNotSupported(CH));
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::InitFd(..) | Call::Init(..))));
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_connect_fd_unsupported_rates() {
        let (mock, manager) = manager();
        let err = manager.connect_fd(CH, 125_000, 2_000_000).unwrap_err();
        assert!(err.is_unsupported());
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mock, manager) = manager();
        let events = manager.subscribe_connection_events();
        manager.disconnect().unwrap();

        manager.connect(CH, 500_000).unwrap();
        mock.update(|s| s.fail_uninit = true);
        assert!(manager.disconnect().is_err());
        assert!(!manager.is_connected());
        // Repeats the previous release outcome without another transport call
        let uninits = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Uninit(_)))
            .count();
        assert!(manager.disconnect().is_err());
        assert_eq!(
            mock.calls()
                .iter()
                .filter(|c| matches!(c, Call::Uninit(_)))
                .count(),
            uninits
        );

        let events: Vec<_> = events.try_iter().collect();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_send_requires_connection() {
        let (mock, manager) = manager();
        let frame = Frame::new(0x100, &[1, 2]).unwrap();
        assert_eq!(manager.send_classic(&frame), Err(CanError::NotConnected));

        manager.connect(CH, 500_000).unwrap();
        manager.send_classic(&frame).unwrap();
        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Write(CH, w) if w.decode().unwrap() == frame)));
    }

    #[test]
    fn test_send_fd_pads_payload() {
        let (mock, manager) = manager();
        manager.connect_fd(CH, 1_000_000, 8_000_000).unwrap();

        let frame = Frame::new_extended(0x18FF_50E5, &[0xAB; 10]).unwrap();
        manager.send_fd(&frame).unwrap();
        let written = mock
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::WriteFd(_, w) => Some(w),
                _ => None,
            })
            .unwrap();
        assert_eq!(written.dlc, 9);
        assert_eq!(&written.data[..10], &[0xAB; 10]);
        assert!(written.data[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_concurrent_sends() {
        let (mock, manager) = manager();
        let manager = Arc::new(manager);
        manager.connect(CH, 500_000).unwrap();

        let senders: Vec<_> = (0..16u32)
            .map(|n| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let payload = [n as u8; 8];
                    let frame = Frame::new(0x100 + n, &payload).unwrap();
                    manager.send_classic(&frame)
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap().unwrap();
        }

        let written: Vec<_> = mock
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Write(_, w) => Some(w),
                _ => None,
            })
            .collect();
        assert_eq!(written.len(), 16);
        let ids: HashSet<u32> = written.iter().map(|w| w.id).collect();
        assert_eq!(ids.len(), 16);
        for w in &written {
            let n = (w.id - 0x100) as u8;
            assert_eq!(w.data, [n; 8]);
        }
        assert!(!manager.is_transmitting());
    }

    #[test]
    fn test_disconnect_waits_for_in_flight_send() {
        let (mock, manager) = manager();
        let manager = Arc::new(manager);
        manager.connect(CH, 500_000).unwrap();
        mock.update(|s| s.write_delay = Some(Duration::from_millis(100)));

        let sender = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.send_classic(&Frame::new(0x1, &[1]).unwrap()))
        };
        assert!(wait_until(|| manager.is_transmitting()));
        thread::sleep(Duration::from_millis(10));
        manager.disconnect().unwrap();

        let result = sender.join().unwrap();
        let calls = mock.calls();
        let write = calls.iter().position(|c| matches!(c, Call::Write(..)));
        let uninit = calls.iter().position(|c| matches!(c, Call::Uninit(_)));
        match result {
            // Either the write finished before release, or it never started
            Ok(()) => assert!(write.unwrap() < uninit.unwrap()),
            Err(e) => {
                assert_eq!(e, CanError::NotConnected);
                assert!(write.is_none());
            }
        }
    }

    #[test]
    fn test_callbacks_receive_frames() {
        let (mock, manager) = manager();
        manager.connect(CH, 500_000).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            manager.add_receive_callback(move |_, _| {
                order.lock().unwrap().push(name);
                Continuation::Continue
            });
        }
        mock.push_classic(classic(0x10, &[1]), 100);

        assert!(wait_until(|| order.lock().unwrap().len() == 3));
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
        assert_eq!(manager.receive_callback_count(), 3);
    }

    #[test]
    fn test_self_unsubscribe_not_invoked_again() {
        let (mock, manager) = manager();
        manager
            .connect_fd(CH, 500_000, 4_000_000)
            .unwrap();

        let once_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));
        {
            let all_hits = Arc::clone(&all_hits);
            manager.add_receive_callback(move |_, _| {
                all_hits.fetch_add(1, Ordering::SeqCst);
                Continuation::Continue
            });
        }
        {
            let once_hits = Arc::clone(&once_hits);
            manager.add_receive_callback(move |_, _| {
                once_hits.fetch_add(1, Ordering::SeqCst);
                Continuation::Unsubscribe
            });
        }

        for n in 0..3u8 {
            let frame = Frame::new(0x200, &[n; 16]).unwrap();
            mock.push_fd(encode_fd(&frame).unwrap(), n as u64);
        }

        assert!(wait_until(|| all_hits.load(Ordering::SeqCst) == 3));
        assert_eq!(once_hits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.receive_callback_count(), 1);
    }

    #[test]
    fn test_no_callback_after_disconnect() {
        let (mock, manager) = manager();
        manager.connect(CH, 500_000).unwrap();

        let disconnected = Arc::new(AtomicBool::new(false));
        let late_call = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let disconnected = Arc::clone(&disconnected);
            let late_call = Arc::clone(&late_call);
            let hits = Arc::clone(&hits);
            manager.add_receive_callback(move |_, _| {
                if disconnected.load(Ordering::SeqCst) {
                    late_call.store(true, Ordering::SeqCst);
                }
                hits.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                Continuation::Continue
            });
        }
        for id in 0..500 {
            mock.push_classic(classic(id, &[]), 0);
        }
        assert!(wait_until(|| hits.load(Ordering::SeqCst) > 0));

        manager.disconnect().unwrap();
        disconnected.store(true, Ordering::SeqCst);

        mock.push_classic(classic(0x7FF, &[]), 0);
        thread::sleep(Duration::from_millis(20));
        assert!(!late_call.load(Ordering::SeqCst));
        assert_eq!(manager.receive_callback_count(), 0);
    }

    #[test]
    fn test_status_and_malformed_frames_not_delivered() {
        let (mock, manager) = manager();
        manager.connect(CH, 500_000).unwrap();
        let (tx, rx) = mpsc::channel();
        manager.add_receive_callback(move |frame, _| {
            tx.send(frame.id()).unwrap();
            Continuation::Continue
        });

        let mut malformed = classic(0x11, &[]);
        malformed.dlc = 99;
        mock.push_classic(crate::frame::ClassicWireFrame::status(0x04), 0);
        mock.push_classic(malformed, 0);
        mock.push_classic(classic(0x22, &[]), 0);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0x22);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_manual_receive() {
        let mock = MockTransport::new();
        let manager =
            CanManager::with_config(mock.clone(), ManagerConfig::default().with_auto_receive(false));
        assert_eq!(manager.try_receive(), Err(CanError::NotConnected));

        manager.connect_fd(CH, 250_000, 10_000_000).unwrap();
        assert_eq!(manager.receive_state(), ReceiveState::Idle);
        assert_eq!(manager.try_receive().unwrap(), None);

        for &len in CANFD_DLC_TO_LEN.iter() {
            let frame = Frame::new(0x42, &vec![0xC3; len]).unwrap();
            mock.push_fd(encode_fd(&frame).unwrap(), len as u64);
            assert_eq!(
                manager.try_receive().unwrap(),
                Some((frame, Timestamp(len as u64)))
            );
        }
    }

    #[test]
    fn test_start_and_stop_receiving() {
        let mock = MockTransport::new();
        let manager =
            CanManager::with_config(mock.clone(), ManagerConfig::default().with_auto_receive(false));
        assert_eq!(manager.start_receiving(), Err(CanError::NotConnected));

        manager.connect(CH, 500_000).unwrap();
        let (tx, rx) = mpsc::channel();
        manager.add_receive_callback(move |frame, _| {
            tx.send(frame.id()).unwrap();
            Continuation::Continue
        });
        manager.start_receiving().unwrap();
        manager.start_receiving().unwrap();
        assert_eq!(manager.receive_state(), ReceiveState::Running);

        mock.push_classic(classic(0x33, &[]), 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0x33);

        manager.stop_receiving().unwrap();
        assert_eq!(manager.receive_state(), ReceiveState::Idle);
        assert_eq!(manager.receive_callback_count(), 0);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_reconnect_cycle_starts_fresh() {
        let (mock, manager) = manager();
        manager.connect(CH, 500_000).unwrap();
        manager.add_receive_callback(|_, _| Continuation::Continue);
        manager.disconnect().unwrap();
        assert_eq!(manager.receive_callback_count(), 0);

        manager.connect_fd(CH, 500_000, 8_000_000).unwrap();
        let (tx, rx) = mpsc::channel();
        manager.add_receive_callback(move |frame, _| {
            tx.send(frame.len()).unwrap();
            Continuation::Continue
        });
        let frame = Frame::new(0x10, &[1; 33]).unwrap();
        mock.push_fd(encode_fd(&frame).unwrap(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 48);
    }

    #[test]
    fn test_lifecycle_refused_inside_callback() {
        let (mock, manager) = manager();
        let manager = Arc::new(manager);
        manager.connect(CH, 500_000).unwrap();

        let (tx, rx) = mpsc::channel();
        let inner = Arc::downgrade(&manager);
        manager.add_receive_callback(move |_, _| {
            if let Some(manager) = inner.upgrade() {
                tx.send(manager.disconnect()).unwrap();
            }
            Continuation::Unsubscribe
        });
        mock.push_classic(classic(0x1, &[]), 0);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(CanError::CalledFromReceiveThread)
        );
        assert!(manager.is_connected());
        manager.disconnect().unwrap();
    }

    #[test]
    fn test_fd_connect_refused_inside_callback() {
        let (mock, manager) = manager();
        let manager = Arc::new(manager);
        manager.connect(CH, 500_000).unwrap();

        let (tx, rx) = mpsc::channel();
        let inner = Arc::downgrade(&manager);
        manager.add_receive_callback(move |_, _| {
            if let Some(manager) = inner.upgrade() {
                // Receive thread check wins over rate validation
                tx.send(manager.connect_fd(CH, 125_000, 1_234_567)).unwrap();
                tx.send(manager.connect_fd(CH, 500_000, 2_000_000)).unwrap();
            }
            Continuation::Unsubscribe
        });
        mock.push_classic(classic(0x1, &[]), 0);

        for _ in 0..2 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                Err(CanError::CalledFromReceiveThread)
            );
        }
        assert_eq!(manager.bus_mode(), Some(BusMode::Classic));
        manager.disconnect().unwrap();
    }

    #[test]
    fn test_transmit_backoff_from_config() {
        let mock = MockTransport::new();
        let backoff = Duration::from_millis(40);
        let config = ManagerConfig::default()
            .with_auto_receive(false)
            .with_transmit_backoff(Some(backoff));
        let manager = CanManager::with_config(mock.clone(), config);
        assert_eq!(manager.config().transmit_backoff, Some(backoff));
        manager.connect(CH, 500_000).unwrap();

        let started = std::time::Instant::now();
        manager.send_classic(&Frame::new(0x10, &[1]).unwrap()).unwrap();
        assert!(started.elapsed() >= backoff);
        assert!(!manager.is_transmitting());
        manager.disconnect().unwrap();
    }

    #[test]
    fn test_dead_connection_stops_loop() {
        let (mock, manager) = manager();
        manager.connect(CH, 500_000).unwrap();
        manager.add_receive_callback(|_, _| Continuation::Continue);
        mock.push_error(crate::error::TransportError::Usb(rusb::Error::NoDevice));

        assert!(wait_until(|| manager.receive_state() == ReceiveState::Stopped));
        assert_eq!(manager.receive_callback_count(), 0);
        assert!(manager.is_connected());
        manager.disconnect().unwrap();
    }

    #[test]
    fn test_available_channels() {
        let (mock, manager) = manager();
        assert_eq!(
            manager.available_channels().unwrap(),
            vec![ChannelHandle(0x51), ChannelHandle(0x52)]
        );
        assert!(manager.is_fd_capable(CH).unwrap());
        assert_eq!(mock.calls()[0], Call::Enumerate);
    }

    #[test]
    fn test_drop_releases_channel() {
        let (mock, manager) = manager();
        manager.connect(CH, 500_000).unwrap();
        drop(manager);
        assert_eq!(mock.calls().last(), Some(&Call::Uninit(CH)));
    }
}
