//! Integration tests for direct PUB/SUB.

use std::time::Duration;

use tokio::time::timeout;

use exgraf_bus::messages::events::{WorkerHealth, WorkerStatus};
use exgraf_bus::messages::topics;
use exgraf_bus::{Endpoint, EventPublisher, EventSubscriber, Message, ZmqPublisher, ZmqSubscriber};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

fn health(worker: &str) -> WorkerHealth {
    WorkerHealth {
        worker_id: worker.into(),
        status: WorkerStatus::Healthy,
        in_flight: 0,
    }
}

#[tokio::test]
async fn one_subscriber_hears_several_publishers() {
    let ep1 = Endpoint::tcp("127.0.0.1", 16100);
    let ep2 = Endpoint::tcp("127.0.0.1", 16101);

    let pub1 = ZmqPublisher::bind(&ep1).await.unwrap();
    let pub2 = ZmqPublisher::bind(&ep2).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let sub = ZmqSubscriber::new();
    sub.add_publisher(&ep1).await.unwrap();
    sub.add_publisher(&ep2).await.unwrap();
    sub.subscribe(topics::WORKER_HEALTH).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    pub1.publish(Message::new(topics::WORKER_HEALTH, &health("w1")).unwrap())
        .await
        .unwrap();
    pub2.publish(Message::new(topics::WORKER_HEALTH, &health("w2")).unwrap())
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let msg = timeout(TIMEOUT, sub.recv()).await.expect("timed out").unwrap();
        seen.push(msg.decode::<WorkerHealth>().unwrap().worker_id);
    }
    seen.sort();
    assert_eq!(seen, vec!["w1", "w2"]);
}

#[tokio::test]
async fn topic_filtering_drops_other_prefixes() {
    let endpoint = Endpoint::tcp("127.0.0.1", 16110);

    let publisher = ZmqPublisher::bind(&endpoint).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let subscriber = ZmqSubscriber::connect(&endpoint).await.unwrap();
    subscriber.subscribe(topics::RUN_PREFIX).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    publisher
        .publish(Message::new(topics::WORKER_HEALTH, &health("w1")).unwrap())
        .await
        .unwrap();
    let finished = Message::new(topics::RUN_FINISHED, &"done".to_string()).unwrap();
    let cid = finished.correlation_id;
    publisher.publish(finished).await.unwrap();

    let received = timeout(TIMEOUT, subscriber.recv()).await.expect("timed out").unwrap();
    assert_eq!(received.topic, topics::RUN_FINISHED);
    assert_eq!(received.correlation_id, cid);

    let nothing = timeout(Duration::from_millis(300), subscriber.recv()).await;
    assert!(nothing.is_err(), "heartbeat should have been filtered");
}
