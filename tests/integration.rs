//! Integration tests driving a real loopback UDP target.
//!
//! The mock target speaks just enough IPbus to exercise the exchange
//! engine end-to-end: it answers status probes, applies transactions to a
//! register map, and can be told to drop control packets or to push a
//! stale status reply in front of the control response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use ipbus_client::protocol::{
    status_reply, StatusInfo, TransactionHeader, TransactionType, STATUS_REQUEST_HEADER,
};
use ipbus_client::{
    ConnState, ControlPacket, IpbusError, IpbusTarget, Signal, TargetConfig,
};

/// How the mock treats control packets. Status probes are always answered.
#[derive(Debug, Clone, Copy)]
enum ControlBehavior {
    /// Apply the transactions and reply.
    Answer,
    /// Swallow control packets (reads/writes time out).
    Drop,
    /// Send a stale status reply first, then the real control response.
    StaleStatusFirst,
}

fn mock_status_info() -> StatusInfo {
    StatusInfo {
        mtu: 1500,
        response_buffers: 4,
        next_packet_id: 0,
    }
}

async fn spawn_target(behavior: ControlBehavior) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut registers: HashMap<u32, u32> = HashMap::new();
        let mut buf = [0u8; 2048];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let datagram = &buf[..len];

            if len == 64 && first_word(datagram) == Some(STATUS_REQUEST_HEADER) {
                let reply = status_reply(&mock_status_info());
                let _ = socket.send_to(&reply, peer).await;
                continue;
            }

            match behavior {
                ControlBehavior::Drop => continue,
                ControlBehavior::StaleStatusFirst => {
                    let stale = status_reply(&mock_status_info());
                    let _ = socket.send_to(&stale, peer).await;
                }
                ControlBehavior::Answer => {}
            }
            if let Some(reply) = build_control_reply(datagram, &mut registers) {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });

    addr
}

fn first_word(datagram: &[u8]) -> Option<u32> {
    let bytes = datagram.get(..4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn words_le(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Apply a control request to the register map and build the response.
fn build_control_reply(datagram: &[u8], registers: &mut HashMap<u32, u32>) -> Option<Vec<u8>> {
    if datagram.len() % 4 != 0 {
        return None;
    }
    let words: Vec<u32> = datagram
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    if *words.first()? != 0x200000F0 {
        return None;
    }

    let mut reply: Vec<u32> = vec![words[0]];
    let mut i = 1;
    while i < words.len() {
        let header = TransactionHeader::decode(words[i]);
        let kind = TransactionType::try_from(header.type_id).ok()?;
        let address = *words.get(i + 1)?;
        reply.push(words[i]); // echo the header, info code 0
        i += 2;

        match kind {
            TransactionType::Read
            | TransactionType::NonIncrementingRead
            | TransactionType::ConfigurationRead => {
                for offset in 0..u32::from(header.words) {
                    let a = match kind {
                        TransactionType::NonIncrementingRead => address,
                        _ => address + offset,
                    };
                    reply.push(*registers.get(&a).unwrap_or(&0));
                }
            }
            TransactionType::Write
            | TransactionType::NonIncrementingWrite
            | TransactionType::ConfigurationWrite => {
                for offset in 0..u32::from(header.words) {
                    let a = match kind {
                        TransactionType::NonIncrementingWrite => address,
                        _ => address + offset,
                    };
                    registers.insert(a, *words.get(i)?);
                    i += 1;
                }
            }
            TransactionType::RmwBits => {
                let and_mask = *words.get(i)?;
                let or_mask = *words.get(i + 1)?;
                i += 2;
                let old = *registers.get(&address).unwrap_or(&0);
                registers.insert(address, (old & and_mask) | or_mask);
                reply.push(old);
            }
            TransactionType::RmwSum => {
                let addend = *words.get(i)?;
                i += 1;
                let old = *registers.get(&address).unwrap_or(&0);
                registers.insert(address, old.wrapping_add(addend));
                reply.push(old);
            }
        }
    }
    Some(words_le(&reply))
}

fn config_for(addr: SocketAddr, update_period_ms: u16) -> TargetConfig {
    TargetConfig {
        ip_address: addr.ip().to_string(),
        remote_port: addr.port(),
        local_port: 0,
        update_period_ms,
        timeout_ms: 100,
    }
}

async fn online_target(behavior: ControlBehavior, update_period_ms: u16) -> Arc<IpbusTarget> {
    let addr = spawn_target(behavior).await;
    let target = IpbusTarget::bind(config_for(addr, update_period_ms)).await.unwrap();
    target.reconnect().await.unwrap();
    target
}

async fn next_signal(rx: &mut tokio::sync::broadcast::Receiver<Signal>) -> Signal {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("signal within a second")
        .expect("signal stream open")
}

#[tokio::test]
async fn test_reconnect_brings_target_online() {
    let addr = spawn_target(ControlBehavior::Answer).await;
    let target = IpbusTarget::bind(config_for(addr, 60000)).await.unwrap();
    let mut rx = target.signals().subscribe();

    assert_eq!(target.state(), ConnState::Disconnected);
    target.reconnect().await.unwrap();
    assert_eq!(target.state(), ConnState::Online);
    assert_eq!(next_signal(&mut rx).await, Signal::StatusOk);
}

#[tokio::test]
async fn test_write_then_read_register() {
    let target = online_target(ControlBehavior::Answer, 60000).await;

    target.write_register(0x100, 0xCAFE).await.unwrap();
    assert_eq!(target.read_register(0x100).await, 0xCAFE);
    // Unwritten registers read back as zero from the mock.
    assert_eq!(target.read_register(0x104).await, 0);
}

#[tokio::test]
async fn test_batched_exchange_delivers_reads_in_order() {
    let target = online_target(ControlBehavior::Answer, 60000).await;
    let mut rx = target.signals().subscribe();

    let mut readback = [0u32; 1];
    let mut packet = ControlPacket::new();
    packet.add_word_write(0x1000, 0x1122_3344).unwrap();
    packet
        .add_read(TransactionType::Read, 0x1000, 1, Some(&mut readback))
        .unwrap();
    target.exchange(&mut packet, true).await.unwrap();

    // The packet is reset only after a fully successful exchange.
    assert!(packet.is_empty());
    drop(packet);
    assert_eq!(readback, [0x1122_3344]);

    assert_eq!(next_signal(&mut rx).await, Signal::WriteSucceeded { words: 1 });
    assert_eq!(next_signal(&mut rx).await, Signal::ReadSucceeded { words: 1 });
}

#[tokio::test]
async fn test_block_read_is_address_incrementing() {
    let target = online_target(ControlBehavior::Answer, 60000).await;
    for offset in 0..4u32 {
        target
            .write_register(0x2000 + offset, 0xA0 + offset)
            .await
            .unwrap();
    }

    let mut block = [0u32; 4];
    let mut packet = ControlPacket::new();
    packet
        .add_read(TransactionType::Read, 0x2000, 4, Some(&mut block))
        .unwrap();
    target.exchange(&mut packet, true).await.unwrap();
    drop(packet);

    assert_eq!(block, [0xA0, 0xA1, 0xA2, 0xA3]);
}

#[tokio::test]
async fn test_bit_helpers_modify_registers() {
    let target = online_target(ControlBehavior::Answer, 60000).await;

    target.write_register(0x200, 0b100).await.unwrap();
    target.set_bit(0, 0x200).await.unwrap();
    assert_eq!(target.read_register(0x200).await, 0b101);

    target.clear_bit(2, 0x200).await.unwrap();
    assert_eq!(target.read_register(0x200).await, 0b001);

    target.write_nbits(0x200, 0x3, 2, 4).await.unwrap();
    assert_eq!(target.read_register(0x200).await, 0x31);
}

#[tokio::test]
async fn test_rmw_sum_applies_addend() {
    let target = online_target(ControlBehavior::Answer, 60000).await;
    target.write_register(0x300, 40).await.unwrap();

    let mut packet = ControlPacket::new();
    packet.add_rmw_sum(0x300, 2).unwrap();
    target.exchange(&mut packet, false).await.unwrap();
    // Successful exchanges reset the packet even when validation is
    // skipped.
    assert!(packet.is_empty());

    assert_eq!(target.read_register(0x300).await, 42);
}

#[tokio::test]
async fn test_stale_status_reply_is_discarded() {
    let target = online_target(ControlBehavior::StaleStatusFirst, 60000).await;

    target.write_register(0x400, 0xBEEF).await.unwrap();
    assert_eq!(target.read_register(0x400).await, 0xBEEF);
    assert!(target.is_online());
}

#[tokio::test]
async fn test_timeout_disconnects_and_keeps_packet() {
    let target = online_target(ControlBehavior::Drop, 60000).await;
    let mut rx = target.signals().subscribe();

    let mut packet = ControlPacket::new();
    packet.add_word_write(0x10, 1).unwrap();
    let err = target.exchange(&mut packet, true).await.unwrap_err();

    assert!(matches!(err, IpbusError::NoResponse(_)));
    assert_eq!(target.state(), ConnState::Disconnected);
    assert!(matches!(
        next_signal(&mut rx).await,
        Signal::NoResponse { .. }
    ));
    // The failed packet keeps its transactions for inspection.
    assert_eq!(packet.transaction_count(), 1);
    assert_eq!(packet.request_size(), 4);
}

#[tokio::test]
async fn test_read_register_times_out_to_sentinel() {
    let target = online_target(ControlBehavior::Drop, 60000).await;
    assert_eq!(target.read_register(0x1000).await, 0xFFFF_FFFF);
}

#[tokio::test]
async fn test_empty_packet_exchange_is_a_noop() {
    let target = online_target(ControlBehavior::Drop, 60000).await;

    // No transactions: succeeds without touching the wire, even though
    // the mock would drop anything sent.
    let mut packet = ControlPacket::new();
    target.exchange(&mut packet, true).await.unwrap();
    assert!(target.is_online());
}

#[tokio::test]
async fn test_keepalive_invokes_sync_hook_while_online() {
    let addr = spawn_target(ControlBehavior::Answer).await;
    let target = IpbusTarget::bind(config_for(addr, 50)).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    target.set_sync_hook(move || {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });

    target.reconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_keepalive_reprobes_after_disconnect() {
    let target = online_target(ControlBehavior::Drop, 50).await;

    // A dropped control packet takes the target offline...
    let mut packet = ControlPacket::new();
    packet.add_word_write(0x10, 1).unwrap();
    assert!(target.exchange(&mut packet, true).await.is_err());
    assert_eq!(target.state(), ConnState::Disconnected);

    // ...and the keepalive probes it back online (status still answers).
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(target.is_online());
}
