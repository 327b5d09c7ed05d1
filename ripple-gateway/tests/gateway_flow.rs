//! 网关端到端流程测试
//!
//! 用内存存储与内存路由表把连接引擎、分发器、消息核心与扇出接在一起，
//! 验证发送-回执-通知的完整链路。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ripple_gateway::{Connection, ConnectionManager, Dispatcher, RoutedGatewayPush};
use ripple_im_core::ConversationKind;
use ripple_im_core::protocol::{Frame, FrameKind};
use ripple_message::{Fanout, InMemoryMessageRepository, MessageApi, MessageService};
use ripple_presence::{InMemoryRouteRegistry, RouteRegistry};

const GATEWAY_ADDR: &str = "127.0.0.1:8900";

struct TestGateway {
    manager: Arc<ConnectionManager>,
    dispatcher: Dispatcher,
    registry: Arc<InMemoryRouteRegistry>,
    service: Arc<MessageService>,
}

fn gateway() -> TestGateway {
    let repo = Arc::new(InMemoryMessageRepository::new());
    let registry = Arc::new(InMemoryRouteRegistry::default());
    let manager = Arc::new(ConnectionManager::new());

    let push = Arc::new(
        RoutedGatewayPush::new(GATEWAY_ADDR, manager.clone(), Duration::from_secs(5)).unwrap(),
    );
    let fanout = Arc::new(Fanout::new(
        repo.clone(),
        registry.clone(),
        push,
        Duration::from_secs(5),
    ));
    let service = Arc::new(MessageService::new(repo).with_fanout(fanout));

    TestGateway {
        manager,
        dispatcher: Dispatcher::new(service.clone()),
        registry,
        service,
    }
}

impl TestGateway {
    async fn attach(&self, user_id: i64, device_id: &str) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (conn, outbound) = Connection::new(user_id, device_id, 100);
        self.manager.add(conn.clone()).await;
        self.registry
            .register_route(user_id, device_id, GATEWAY_ADDR)
            .await
            .unwrap();
        (conn, outbound)
    }
}

fn chat_frame(conv_id: i64, client_msg_id: &str) -> Frame {
    let mut frame = Frame::new(
        FrameKind::Chat,
        json!({
            "conv_id": conv_id,
            "conv_kind": "direct",
            "body": {"type": "text", "content": "hi"},
        }),
    );
    frame.msg_id = Some(client_msg_id.to_string());
    frame
}

#[tokio::test]
async fn test_send_acks_sender_and_notifies_recipient_devices() {
    let gw = gateway();
    let conv_id = gw
        .service
        .create_conversation(ConversationKind::Direct, "", 100, vec![100, 200])
        .await
        .unwrap();

    let (sender, mut sender_rx) = gw.attach(100, "d0").await;
    let (_recv1, mut recv1_rx) = gw.attach(200, "d1").await;
    let (_recv2, mut recv2_rx) = gw.attach(200, "d2").await;

    gw.dispatcher
        .handle_frame(&sender, chat_frame(conv_id, "c-1"))
        .await;

    // 发送方先拿到 ACK，不等扇出
    let ack = sender_rx.recv().await.unwrap();
    assert_eq!(ack.kind, FrameKind::Ack);
    assert_eq!(ack.payload["seq"], 1);

    // 接收方的两台设备各收到一份通知
    for rx in [&mut recv1_rx, &mut recv2_rx] {
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification should arrive")
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Notification);
        assert_eq!(frame.payload["conv_id"], conv_id);
        assert_eq!(frame.payload["seq"], 1);
        assert_eq!(frame.payload["sender_id"], 100);
    }

    // 发送方自己不收通知
    assert!(sender_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_pull_recovers_what_notifications_missed() {
    let gw = gateway();
    let conv_id = gw
        .service
        .create_conversation(ConversationKind::Direct, "", 100, vec![100, 200])
        .await
        .unwrap();

    // 接收方离线，扇出无处可推
    let (sender, mut sender_rx) = gw.attach(100, "d0").await;
    gw.dispatcher
        .handle_frame(&sender, chat_frame(conv_id, "c-1"))
        .await;
    let ack = sender_rx.recv().await.unwrap();
    assert_eq!(ack.kind, FrameKind::Ack);

    // 重连后按 last_known seq 拉取补齐
    let page = gw.service.pull(conv_id, 200, 0, 10).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].seq, 1);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_duplicate_attachment_keeps_exactly_one_connection() {
    let gw = gateway();

    let (first, _rx1) = gw.attach(100, "d1").await;
    let mut first_closed = first.close_signal();

    let (second, _rx2) = gw.attach(100, "d1").await;

    // 旧连接观察到关闭信号
    timeout(Duration::from_secs(1), first_closed.changed())
        .await
        .expect("predecessor should observe close signal")
        .unwrap();
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(gw.manager.total_connections().await, 1);

    // 被顶掉连接的清理不影响接替者及其路由
    assert!(!gw.manager.remove_if_attached(&first).await);
    assert_eq!(gw.manager.total_connections().await, 1);
    assert!(!gw.registry.get_routes(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_broadcast_to_user_counts_enqueued_devices() {
    let gw = gateway();
    let (_c1, mut rx1) = gw.attach(100, "d1").await;
    let (_c2, mut rx2) = gw.attach(100, "d2").await;

    let delivered = gw.manager.broadcast_to_user(100, &Frame::pong()).await;
    assert_eq!(delivered, 2);
    assert_eq!(rx1.recv().await.unwrap().kind, FrameKind::Pong);
    assert_eq!(rx2.recv().await.unwrap().kind, FrameKind::Pong);
}
