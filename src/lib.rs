//! # ipbus-client
//!
//! Client for the IPbus v2.0 control protocol: batched 32-bit register
//! access to FPGA front-end boards over UDP.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): header codec, control packet builder and
//!   response validator, status probe
//! - **Exchange engine** ([`target`]): socket ownership, timeouts, the
//!   online/offline state machine, keepalive
//! - **Signals** ([`signal`]): typed notifications for a GUI or logger
//!
//! ## Example
//!
//! ```no_run
//! use ipbus_client::{ControlPacket, IpbusTarget, TargetConfig, TransactionType};
//!
//! #[tokio::main]
//! async fn main() -> ipbus_client::Result<()> {
//!     let target = IpbusTarget::bind(TargetConfig::for_address("172.20.75.180")).await?;
//!     target.reconnect().await?;
//!
//!     // Batch a write and a read into one datagram.
//!     let mut readback = [0u32; 1];
//!     let mut packet = ControlPacket::new();
//!     packet.add_word_write(0x1000, 0x1122_3344)?;
//!     packet.add_read(TransactionType::Read, 0x1000, 1, Some(&mut readback))?;
//!     target.exchange(&mut packet, true).await?;
//!     drop(packet);
//!
//!     println!("register 0x1000 = {:#010X}", readback[0]);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod signal;
pub mod target;

pub use config::TargetConfig;
pub use error::{ErrorKind, IpbusError, Result};
pub use protocol::{ControlPacket, PacketHeader, PacketType, TransactionHeader, TransactionType};
pub use signal::{Signal, SignalHub};
pub use target::{ConnState, IpbusTarget, SyncHook};
