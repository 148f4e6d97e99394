//! End-to-end scenarios against a real broker, driven by the `RABBITMQ_URI`
//! environment variable. Without it the tests are no-ops so the suite stays
//! runnable everywhere.

use garenne::{
    message::DeliveryResult, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, ConsumerDelegate,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

fn broker_uri() -> Option<String> {
    std::env::var("RABBITMQ_URI").ok()
}

fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[derive(Clone)]
struct Acker {
    channel: Channel,
    expected_body: Vec<u8>,
    received: Arc<AtomicBool>,
}

#[garenne::async_trait]
impl ConsumerDelegate for Acker {
    async fn on_new_delivery(&self, delivery: DeliveryResult) {
        if let Ok(Some(delivery)) = delivery {
            assert_eq!(delivery.data, self.expected_body);
            self.channel
                .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                .await
                .expect("basic_ack");
            self.received.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn declare_publish_get_round_trip() {
    let uri = match broker_uri() {
        Some(uri) => uri,
        None => return,
    };
    tracing_subscriber::fmt::try_init().ok();

    async_global_executor::block_on(async move {
        let conn = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .expect("connect");
        let channel = conn.channel();

        let queue = channel
            .queue_declare(
                "garenne-e2e-get",
                QueueDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .expect("queue_declare");
        assert_eq!(queue.message_count(), 0);

        assert!(channel
            .basic_get(queue.name().as_str(), BasicGetOptions::default())
            .await
            .expect("basic_get")
            .is_none());

        channel
            .queue_bind(
                queue.name().as_str(),
                "amq.direct",
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .expect("queue_bind");

        // three messages so the remaining counts go 2, 1, 0
        for _ in 0..3 {
            channel
                .basic_publish(
                    "amq.direct",
                    "#",
                    BasicPublishOptions::default(),
                    b"hello".to_vec(),
                    BasicProperties::default(),
                )
                .await
                .expect("basic_publish");
        }

        for expected_remaining in [2, 1, 0] {
            let deadline = Instant::now() + Duration::from_secs(10);
            let message = loop {
                if let Some(message) = channel
                    .basic_get(queue.name().as_str(), BasicGetOptions::default())
                    .await
                    .expect("basic_get")
                {
                    break message;
                }
                assert!(Instant::now() < deadline, "message never arrived");
            };
            assert_eq!(message.delivery.data, b"hello");
            assert_eq!(message.message_count, expected_remaining);
            channel
                .basic_ack(message.delivery.delivery_tag, BasicAckOptions::default())
                .await
                .expect("basic_ack");
        }

        channel
            .queue_delete(queue.name().as_str(), QueueDeleteOptions::default())
            .await
            .expect("queue_delete");
        conn.close(200, "Normal Shutdown").await.expect("close");
    });
}

#[test]
fn consume_sees_a_late_publish() {
    let uri = match broker_uri() {
        Some(uri) => uri,
        None => return,
    };
    tracing_subscriber::fmt::try_init().ok();

    async_global_executor::block_on(async move {
        let conn = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .expect("connect");
        let channel = conn.channel();

        let queue = channel
            .queue_declare(
                "garenne-e2e-consume",
                QueueDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .expect("queue_declare");

        let received = Arc::new(AtomicBool::new(false));
        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .expect("basic_consume");
        consumer.set_delegate(Acker {
            channel: channel.clone(),
            expected_body: b"payload".to_vec(),
            received: received.clone(),
        });

        channel
            .basic_publish(
                "",
                queue.name().as_str(),
                BasicPublishOptions::default(),
                b"payload".to_vec(),
                BasicProperties::default(),
            )
            .await
            .expect("basic_publish");

        wait_for(&received);
        channel
            .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
            .await
            .expect("basic_cancel");
        conn.close(200, "Normal Shutdown").await.expect("close");
    });
}

#[test]
fn confirms_survive_a_soft_error() {
    let uri = match broker_uri() {
        Some(uri) => uri,
        None => return,
    };
    tracing_subscriber::fmt::try_init().ok();

    async_global_executor::block_on(async move {
        let conn = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .expect("connect");
        let channel = conn.channel();
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .expect("confirm_select");

        let confirm = channel
            .basic_publish(
                "",
                "garenne-e2e-confirm",
                BasicPublishOptions::default(),
                b"payload".to_vec(),
                BasicProperties::default(),
            )
            .await
            .expect("basic_publish");
        assert!(confirm.await.expect("confirmation").is_ack());

        // a passive declare of a missing queue kills the channel...
        let error = channel
            .queue_declare(
                "garenne-e2e-no-such-queue",
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .expect_err("passive declare of a missing queue");
        assert!(error.is_not_found());

        // ...and once it gets recycled, confirm mode is back on its own
        let deadline = Instant::now() + Duration::from_secs(10);
        while !(channel.status().connected() && channel.status().confirm()) {
            assert!(Instant::now() < deadline, "channel never recycled");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(channel.id() > 1);

        let confirm = channel
            .basic_publish(
                "",
                "garenne-e2e-confirm",
                BasicPublishOptions::default(),
                b"payload".to_vec(),
                BasicProperties::default(),
            )
            .await
            .expect("basic_publish after recycle");
        assert!(confirm.await.expect("confirmation").is_ack());

        conn.close(200, "Normal Shutdown").await.expect("close");
    });
}
