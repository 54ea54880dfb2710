/// 服务端集成测试 - 真实的回环 TCP 连接
///
/// 测试目标：
/// 1. 握手后注册 channel，收发消息
/// 2. 重复 ID 被拒绝并收到 Close 帧
/// 3. 握手超时与断开回调
/// 4. Shutdown 关闭所有 channel，超过截止时间时返回超时

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use ximtrans::{ChannelState, OpCode, ServiceInstance, TransportError};

fn gateway() -> ServiceInstance {
    ServiceInstance::new("gate01", "gateway", "tcp", "127.0.0.1", 0)
}

#[tokio::test]
async fn test_login_echo_and_server_push() -> Result<(), Box<dyn std::error::Error>> {
    let ts = start_server(gateway(), Arc::new(EchoListener)).await?;
    let mut conn = login(ts.addr, "u1").await?;

    assert!(eventually(|| ts.server.channels().contains("u1")).await);
    let channel = ts.server.channels().get("u1").unwrap();
    assert_eq!(channel.meta().get("login").map(String::as_str), Some("password"));
    assert!(eventually(|| channel.state() == ChannelState::Active).await);

    conn.write_frame(OpCode::Binary, "hello").await?;
    conn.flush().await?;
    let frame = read_frame(&mut conn).await?;
    assert_eq!(frame.opcode, OpCode::Binary);
    assert_eq!(frame.payload, Bytes::from_static(b"hello"));

    ts.server.push("u1", Bytes::from_static(b"from server")).await?;
    let frame = read_frame(&mut conn).await?;
    assert_eq!(frame.payload, Bytes::from_static(b"from server"));
    Ok(())
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() -> Result<(), Box<dyn std::error::Error>> {
    let ts = start_server(gateway(), Arc::new(EchoListener)).await?;
    let mut conn = login(ts.addr, "u2").await?;
    assert!(eventually(|| ts.server.channels().contains("u2")).await);

    conn.write_frame(OpCode::Ping, Bytes::new()).await?;
    conn.flush().await?;
    let frame = read_frame(&mut conn).await?;
    assert_eq!(frame.opcode, OpCode::Pong);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_id_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let ts = start_server(gateway(), Arc::new(EchoListener)).await?;
    let _first = login(ts.addr, "dup").await?;
    assert!(eventually(|| ts.server.channels().contains("dup")).await);
    let original = ts.server.channels().get("dup").unwrap();

    let mut second = login(ts.addr, "dup").await?;
    let frame = read_frame(&mut second).await?;
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(frame.payload, Bytes::from_static(b"channel ID dup is duplicate"));

    // 先注册的连接不受影响
    let current = ts.server.channels().get("dup").unwrap();
    assert!(Arc::ptr_eq(&original, &current));
    assert_eq!(ts.server.channels().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_handshake_failure_closes_with_reason() -> Result<(), Box<dyn std::error::Error>> {
    let ts = start_server(gateway(), Arc::new(EchoListener)).await?;
    let mut conn = login(ts.addr, "").await?;

    let frame = read_frame(&mut conn).await?;
    assert_eq!(frame.opcode, OpCode::Close);
    let reason = String::from_utf8(frame.payload.to_vec())?;
    assert!(reason.contains("id is empty"), "reason: {}", reason);
    assert!(ts.server.channels().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_login_timeout_closes_with_reason() -> Result<(), Box<dyn std::error::Error>> {
    let options = ximtrans::ServerOptions::new().login_wait(Duration::from_millis(100));
    let ts = start_server_with(gateway(), Arc::new(EchoListener), options).await?;
    // 建连后不发送登录帧
    let mut conn = dial(ts.addr).await?;

    let frame = read_frame(&mut conn).await?;
    assert_eq!(frame.opcode, OpCode::Close);
    let reason = String::from_utf8(frame.payload.to_vec())?;
    assert_eq!(reason, "Operation 'login' timeout after 100ms");
    assert!(ts.server.channels().is_empty());
    // 没有注册过的连接不会触发断开回调
    assert!(ts.disconnects.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_disconnect_is_reported_once() -> Result<(), Box<dyn std::error::Error>> {
    let ts = start_server(gateway(), Arc::new(EchoListener)).await?;
    let mut conn = login(ts.addr, "u3").await?;
    assert!(eventually(|| ts.server.channels().contains("u3")).await);

    conn.close_with("bye").await?;
    let id = tokio::time::timeout(Duration::from_secs(2), ts.disconnects.recv_async()).await??;
    assert_eq!(id, "u3");
    assert!(!ts.server.channels().contains("u3"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ts.disconnects.try_recv().is_err());

    let err = ts.server.push("u3", Bytes::from_static(b"late")).await.unwrap_err();
    assert!(matches!(err, TransportError::ChannelNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_read_timeout_drops_silent_peer() -> Result<(), Box<dyn std::error::Error>> {
    let options = ximtrans::ServerOptions::new().read_wait(Duration::from_millis(100));
    let ts = start_server_with(gateway(), Arc::new(EchoListener), options).await?;
    let _conn = login(ts.addr, "quiet").await?;

    let id = tokio::time::timeout(Duration::from_secs(2), ts.disconnects.recv_async()).await??;
    assert_eq!(id, "quiet");
    assert!(!ts.server.channels().contains("quiet"));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_channels() -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 测试服务关闭");
    let ts = start_server(gateway(), Arc::new(EchoListener)).await?;
    let mut a = login(ts.addr, "a").await?;
    let mut b = login(ts.addr, "b").await?;
    assert!(eventually(|| ts.server.channels().len() == 2).await);

    ts.server.shutdown(Duration::from_secs(1)).await?;
    for conn in [&mut a, &mut b] {
        let frame = read_frame(conn).await?;
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.payload, Bytes::from_static(b"server shutdown"));
    }

    // 不再接受新连接
    let refused = tokio::time::timeout(Duration::from_millis(500), async {
        match login(ts.addr, "c").await {
            Ok(mut conn) => conn.read_frame().await.map(|_| ()),
            Err(e) => Err(e),
        }
    })
    .await;
    assert!(!matches!(refused, Ok(Ok(()))));
    assert!(!ts.server.channels().contains("c"));
    println!("✅ 服务关闭测试通过");
    Ok(())
}

#[tokio::test]
async fn test_shutdown_deadline_leaves_blocked_channel() -> Result<(), Box<dyn std::error::Error>> {
    let options = ximtrans::ServerOptions::new()
        .outbound_queue(1)
        .read_wait(Duration::from_secs(10))
        .write_wait(Duration::from_secs(10));
    let ts = start_server_with(gateway(), Arc::new(EchoListener), options).await?;
    // 对端从不读取，socket 写满后写循环阻塞，出站队列随之占满
    let _slow = login(ts.addr, "slow").await?;
    assert!(eventually(|| ts.server.channels().contains("slow")).await);

    let server = ts.server.clone();
    let payload = Bytes::from(vec![0u8; 1 << 20]);
    let flood = tokio::spawn(async move {
        for _ in 0..64 {
            if server.push("slow", payload.clone()).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = ts.server.shutdown(Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout { ref operation, .. } if operation == "shutdown"));

    // 截止时间之后的 channel 保持原样
    let channel = ts.server.channels().get("slow").unwrap();
    assert_eq!(channel.state(), ChannelState::Active);
    assert!(ts.server.is_closed());
    flood.abort();
    Ok(())
}
