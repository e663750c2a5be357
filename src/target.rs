//! Exchange engine: one UDP target, one socket, one packet in flight.
//!
//! An [`IpbusTarget`] owns the datagram socket for a single remote and
//! drives the request/response round-trip: send a control packet, await
//! the reply within the timeout, discard stale status replies, validate,
//! and report through the target's [`SignalHub`]. A per-target mutex
//! serialises concurrent callers, so packets go out in FIFO order and the
//! keepalive never overlaps an exchange.
//!
//! # Connectivity
//!
//! ```text
//! Disconnected ──reconnect()──► Probing ──status reply──► Online
//!      ▲                           │                        │
//!      └──────── timeout / empty / header mismatch ─────────┘
//!
//! any state ──socket write failure──► Error (keepalive stopped)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ipbus_client::{IpbusTarget, TargetConfig};
//!
//! # async fn run() -> ipbus_client::Result<()> {
//! let target = IpbusTarget::bind(TargetConfig::for_address("172.20.75.180")).await?;
//! target.reconnect().await?;
//! let value = target.read_register(0x1004).await;
//! println!("register 0x1004 = {value:#010X}");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::TargetConfig;
use crate::error::{ErrorKind, IpbusError, Result};
use crate::protocol::{
    first_word, is_status_reply, status_request, ControlPacket, StatusInfo, TransactionType,
    MAX_PACKET_WORDS, STATUS_REQUEST_HEADER, WORD_SIZE,
};
use crate::signal::{Signal, SignalHub};

/// Boxed future returned by a [`SyncHook`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller-supplied keepalive action, invoked while the target is online.
///
/// Typically refreshes a cache of frequently watched registers. Capture a
/// [`std::sync::Weak`] rather than an `Arc` of the target inside the hook
/// to avoid keeping it alive through its own keepalive task.
pub type SyncHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Connectivity state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// No working exchange path; `reconnect` starts a probe.
    Disconnected = 0,
    /// Status probe in flight.
    Probing = 1,
    /// The target answered a status probe; exchanges are allowed.
    Online = 2,
    /// Local socket failure; operator attention required.
    Error = 3,
}

/// One IPbus target: socket, connectivity state, signals, keepalive.
pub struct IpbusTarget {
    config: TargetConfig,
    remote: SocketAddr,
    socket: UdpSocket,
    /// Serialises exchanges and status probes on the shared socket.
    exchange_lock: Mutex<()>,
    state: AtomicU8,
    signals: SignalHub,
    sync_hook: StdMutex<Option<SyncHook>>,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
    /// Handed to the keepalive task so it never keeps the target alive.
    self_ref: Weak<IpbusTarget>,
}

impl IpbusTarget {
    /// Bind a local socket for the configured target.
    ///
    /// The requested local port falls back to an OS-assigned one when it
    /// is unavailable. The target starts [`ConnState::Disconnected`]; call
    /// [`IpbusTarget::reconnect`] to bring it online.
    pub async fn bind(config: TargetConfig) -> Result<Arc<Self>> {
        let remote = config.remote_addr()?;
        let socket = match UdpSocket::bind(("0.0.0.0", config.local_port)).await {
            Ok(socket) => socket,
            Err(_) if config.local_port != 0 => UdpSocket::bind(("0.0.0.0", 0)).await?,
            Err(e) => return Err(e.into()),
        };
        let local = socket.local_addr()?;
        debug!(%local, %remote, "socket bound");
        Ok(Arc::new_cyclic(|weak| Self {
            config,
            remote,
            socket,
            exchange_lock: Mutex::new(()),
            state: AtomicU8::new(ConnState::Disconnected as u8),
            signals: SignalHub::new(),
            sync_hook: StdMutex::new(None),
            keepalive: StdMutex::new(None),
            self_ref: weak.clone(),
        }))
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Disconnected,
            1 => ConnState::Probing,
            2 => ConnState::Online,
            _ => ConnState::Error,
        }
    }

    /// Whether the target currently accepts exchanges.
    pub fn is_online(&self) -> bool {
        self.state() == ConnState::Online
    }

    /// The signal hub of this target.
    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    /// The configuration this target was built from.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Install the keepalive sync hook.
    pub fn set_sync_hook<F>(&self, hook: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self.sync_hook.lock().expect("sync hook lock poisoned") = Some(Arc::new(hook));
    }

    /// Connect the socket to the remote, probe it, and arm the keepalive.
    ///
    /// The keepalive is armed even when the probe fails, so an unreachable
    /// target keeps being probed once per period until it answers. Only a
    /// fatal socket error ([`ConnState::Error`]) leaves it stopped.
    pub async fn reconnect(&self) -> Result<()> {
        self.set_state(ConnState::Probing);
        if let Err(e) = self.socket.connect(self.remote).await {
            self.set_state(ConnState::Disconnected);
            let message = format!("cannot reach {}: {e}", self.remote);
            self.signals.emit(Signal::NoResponse {
                message: message.clone(),
            });
            return Err(IpbusError::NoResponse(message));
        }
        let result = {
            let _guard = self.exchange_lock.lock().await;
            self.probe_locked().await
        };
        if self.state() != ConnState::Error {
            self.start_keepalive();
        }
        result
    }

    /// Send a status probe and wait for the reply.
    ///
    /// A reply whose first word echoes the status header brings the target
    /// online; a timeout or anything else marks it disconnected.
    pub async fn send_status(&self) -> Result<()> {
        let _guard = self.exchange_lock.lock().await;
        self.probe_locked().await
    }

    /// Send the packet and validate the reply.
    ///
    /// Fails without sending when the target is offline; succeeds without
    /// sending when the packet holds no transactions. On success the
    /// packet is reset for reuse. On any failure the packet keeps its
    /// buffers and transaction list so the caller can inspect them; call
    /// [`ControlPacket::reset`] before reusing it.
    ///
    /// With `process` false the reply is stored in the packet but not
    /// validated.
    pub async fn exchange(&self, packet: &mut ControlPacket<'_>, process: bool) -> Result<()> {
        let _guard = self.exchange_lock.lock().await;
        self.exchange_locked(packet, process).await
    }

    /// Read one word; `0xFFFFFFFF` stands in for any failure.
    pub async fn read_register(&self, address: u32) -> u32 {
        let mut data = [0xFFFF_FFFFu32; 1];
        let ok = {
            let mut packet = ControlPacket::new();
            packet
                .add_read(TransactionType::Read, address, 1, Some(&mut data))
                .is_ok()
                && self.exchange(&mut packet, true).await.is_ok()
        };
        if ok {
            data[0]
        } else {
            0xFFFF_FFFF
        }
    }

    /// Write one word.
    pub async fn write_register(&self, address: u32, value: u32) -> Result<()> {
        let mut packet = ControlPacket::new();
        packet.add_word_write(address, value)?;
        self.exchange(&mut packet, true).await
    }

    /// Set bit `n` of the register at `address`.
    pub async fn set_bit(&self, n: u8, address: u32) -> Result<()> {
        let bit = bit_mask(n)?;
        let mut packet = ControlPacket::new();
        packet.add_rmw_bits(address, 0xFFFF_FFFF, bit)?;
        self.exchange(&mut packet, true).await
    }

    /// Clear bit `n` of the register at `address`.
    pub async fn clear_bit(&self, n: u8, address: u32) -> Result<()> {
        let bit = bit_mask(n)?;
        let mut packet = ControlPacket::new();
        packet.add_rmw_bits(address, !bit, 0x0000_0000)?;
        self.exchange(&mut packet, true).await
    }

    /// Write an `nbits`-wide field at `shift` within the register at
    /// `address`, leaving the other bits untouched.
    pub async fn write_nbits(&self, address: u32, data: u32, nbits: u8, shift: u8) -> Result<()> {
        let mut packet = ControlPacket::new();
        packet.add_bit_change(address, data, nbits, shift)?;
        self.exchange(&mut packet, true).await
    }

    async fn exchange_locked(&self, packet: &mut ControlPacket<'_>, process: bool) -> Result<()> {
        if self.state() != ConnState::Online {
            return Err(IpbusError::TargetOffline);
        }
        if packet.is_empty() {
            // Nothing but the packet header; not worth a datagram.
            return Ok(());
        }

        let request = packet.request_bytes();
        self.send_all(&request).await?;

        let mut buf = [0u8; MAX_PACKET_WORDS * WORD_SIZE];
        let mut len = self.recv_bounded(&mut buf).await?;
        if is_status_reply(&buf[..len]) {
            // A keepalive reply from an earlier probe outlived its
            // timeout; the control response is still in flight.
            warn!(remote = %self.remote, "discarding stale status reply");
            len = self.recv_bounded(&mut buf).await?;
        }

        let datagram = &buf[..len];
        if datagram.is_empty() {
            let message = format!("empty response, no IPbus on {}", self.config.ip_address);
            self.set_state(ConnState::Disconnected);
            self.raise_error(&message, ErrorKind::Network);
            return Err(IpbusError::Network(message));
        }
        if let Err(e) = packet.load_response(datagram) {
            self.set_state(ConnState::Disconnected);
            self.raise_error(e.to_string(), ErrorKind::Network);
            return Err(e);
        }
        if process {
            if let Err(e) = packet.process_response(&self.signals) {
                // The validator already reported the offending
                // transaction; keep the packet for inspection.
                debug!("{}", packet.dump());
                self.stop_keepalive();
                return Err(e);
            }
        }
        packet.reset();
        Ok(())
    }

    async fn probe_locked(&self) -> Result<()> {
        self.set_state(ConnState::Probing);
        let probe = status_request();
        self.send_all(&probe).await?;

        let mut buf = [0u8; MAX_PACKET_WORDS * WORD_SIZE];
        let len = self.recv_bounded(&mut buf).await?;
        let reply = &buf[..len];
        if first_word(reply) == Some(STATUS_REQUEST_HEADER) {
            if let Some(info) = StatusInfo::parse(reply) {
                debug!(
                    mtu = info.mtu,
                    buffers = info.response_buffers,
                    next_id = info.next_packet_id,
                    "status reply"
                );
            }
            self.set_state(ConnState::Online);
            self.signals.emit(Signal::StatusOk);
            Ok(())
        } else {
            self.set_state(ConnState::Disconnected);
            let message = format!("malformed status reply from {}", self.config.ip_address);
            self.signals.emit(Signal::NoResponse {
                message: message.clone(),
            });
            Err(IpbusError::NoResponse(message))
        }
    }

    /// Write a whole datagram; anything less is a fatal network error.
    async fn send_all(&self, datagram: &[u8]) -> Result<()> {
        let written = match self.socket.send(datagram).await {
            Ok(written) => written,
            Err(e) => {
                self.set_state(ConnState::Error);
                self.raise_error(format!("socket write error: {e}"), ErrorKind::Network);
                return Err(e.into());
            }
        };
        if written != datagram.len() {
            self.set_state(ConnState::Error);
            let err = IpbusError::ShortWrite {
                written,
                expected: datagram.len(),
            };
            self.raise_error(err.to_string(), ErrorKind::Network);
            return Err(err);
        }
        Ok(())
    }

    /// Await one datagram within the configured timeout.
    async fn recv_bounded(&self, buf: &mut [u8]) -> Result<usize> {
        match time::timeout(self.config.timeout(), self.socket.recv(buf)).await {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(e)) => {
                self.set_state(ConnState::Disconnected);
                self.raise_error(format!("socket read error: {e}"), ErrorKind::Network);
                Err(e.into())
            }
            Err(_elapsed) => {
                self.set_state(ConnState::Disconnected);
                let message = format!("no response from {}", self.config.ip_address);
                self.signals.emit(Signal::NoResponse {
                    message: message.clone(),
                });
                Err(IpbusError::NoResponse(message))
            }
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Emit an error signal and stop the keepalive so the operator can
    /// inspect the target without new traffic overwriting its state.
    fn raise_error(&self, message: impl Into<String>, kind: ErrorKind) {
        let message = message.into();
        error!(%kind, "{message}");
        self.signals.emit(Signal::Error { message, kind });
        self.stop_keepalive();
    }

    /// Spawn the keepalive task unless one is already running.
    ///
    /// Each tick runs the sync hook while online and a status probe
    /// otherwise. The task holds only a weak reference, so dropping the
    /// target ends it.
    fn start_keepalive(&self) {
        let mut slot = self.keepalive.lock().expect("keepalive lock poisoned");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = self.self_ref.clone();
        let period = self.config.update_period();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(target) = weak.upgrade() else { break };
                if target.is_online() {
                    let hook = target
                        .sync_hook
                        .lock()
                        .expect("sync hook lock poisoned")
                        .clone();
                    if let Some(hook) = hook {
                        hook().await;
                    }
                } else {
                    let _ = target.send_status().await;
                }
            }
        }));
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self
            .keepalive
            .lock()
            .expect("keepalive lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for IpbusTarget {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

impl std::fmt::Debug for IpbusTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpbusTarget")
            .field("remote", &self.remote)
            .field("local_addr", &self.socket.local_addr().ok())
            .field("state", &self.state())
            .finish()
    }
}

fn bit_mask(n: u8) -> Result<u32> {
    1u32.checked_shl(u32::from(n))
        .ok_or_else(|| IpbusError::Logic(format!("bit index {n} out of range")))
}
