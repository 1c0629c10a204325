//! Background loop resolving pending replies from the dispatcher's reply topic.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlation::CorrelationTable;
use crate::broker::{Broker, OffsetReset, Record, Subscription};
use crate::codec::{Acknowledgement, WireCodec};
use crate::error::BrokerError;
use crate::exchange::RetryPolicy;

pub(crate) struct AckListener {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) codec: WireCodec,
    pub(crate) reply_topic: String,
    pub(crate) correlations: CorrelationTable,
    pub(crate) retry: RetryPolicy,
    pub(crate) cancel: CancellationToken,
}

impl AckListener {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut attempt = 0u32;
        while !self.cancel.is_cancelled() {
            match self.listen(&mut attempt).await {
                Ok(()) => break,
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        reply_topic = %self.reply_topic,
                        error = %err,
                        attempt,
                        "ack listener failed, restarting after delay"
                    );
                    if !self.retry.allows(attempt) || !self.retry.wait(attempt, &self.cancel).await {
                        break;
                    }
                }
            }
        }

        match self.broker.delete_topic(&self.reply_topic).await {
            Ok(()) => debug!(reply_topic = %self.reply_topic, "reply topic deleted"),
            Err(err) => debug!(reply_topic = %self.reply_topic, error = %err, "reply topic cleanup failed"),
        }
        info!(reply_topic = %self.reply_topic, "ack listener stopped");
    }

    async fn listen(&self, attempt: &mut u32) -> Result<(), BrokerError> {
        self.broker.ensure_topic(&self.reply_topic).await?;
        // Earliest, so replies produced before we subscribed are not missed.
        let mut consumer = self
            .broker
            .subscribe(Subscription::new(
                &self.reply_topic,
                &self.reply_topic,
                OffsetReset::Earliest,
            ))
            .await?;
        *attempt = 0;
        debug!(reply_topic = %self.reply_topic, "ack listener subscribed");

        let result = async {
            while let Some(record) = consumer.consume(&self.cancel).await? {
                consumer.commit(&record).await?;
                self.resolve(record);
            }
            Ok::<(), BrokerError>(())
        }
        .await;

        if let Err(err) = consumer.unsubscribe().await {
            debug!(reply_topic = %self.reply_topic, error = %err, "unsubscribe failed");
        }
        result
    }

    fn resolve(&self, record: Record) {
        let Some(ack_key) = record.key.as_deref() else {
            debug!(reply_topic = %self.reply_topic, offset = record.offset, "acknowledgement without key dropped");
            return;
        };
        if !self.correlations.contains(ack_key) {
            debug!(ack_key = %ack_key, "unmatched acknowledgement dropped");
            return;
        }

        let outcome = self.codec.decode::<Acknowledgement>(&record.value);
        if !self.correlations.resolve(ack_key, outcome) {
            debug!(ack_key = %ack_key, "waiter gone before acknowledgement arrived");
        }
    }
}
