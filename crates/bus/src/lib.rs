//! Messaging layer: MessagePack envelopes over ZeroMQ for the control
//! plane and length-prefixed TCP frames for bulk tensor transfer.

pub mod bulk;
pub mod error;
pub mod eventlog;
pub mod message;
pub mod messages;
pub mod pubsub;
pub mod reqrep;
pub mod traits;
pub mod transport;
pub mod worker;

pub use bulk::{BlobStore, BulkClient, BulkServer};
pub use error::BusError;
pub use eventlog::{EventFanout, FileEventLog};
pub use message::Message;
pub use messages::{dispatch, events, topics};
pub use pubsub::{ZmqPublisher, ZmqSubscriber};
pub use reqrep::{ReplyToken, ZmqRequestClient, ZmqRequestServer};
pub use traits::{EventPublisher, EventSubscriber, RequestHandler, RequestSender};
pub use transport::Endpoint;
pub use worker::{Worker, WorkerBuilder, WorkerRunner, WorkerRunnerConfig};
