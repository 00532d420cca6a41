//! Stream subscriber — reconnecting single-topic consumer.
//!
//! Every payload is handed to the callback and awaited before the next one
//! is read, so a slow handler stalls ingestion instead of dropping messages.
//! Any connection-level failure is logged, followed by a fixed delay, then a
//! fresh connect + subscribe. The loop only ends through [`StopHandle::stop`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub mod mqtt;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("broker closed the connection")]
    Disconnected,
}

/// Opens subscribed sessions against the broker.
#[async_trait]
pub trait BrokerConnector: Send {
    /// Connect and subscribe from scratch.
    async fn connect(&mut self) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

/// One live, subscribed connection.
#[async_trait]
pub trait BrokerSession: Send {
    /// Wait for the next message payload on the subscribed topic.
    async fn next_payload(&mut self) -> Result<Vec<u8>, BrokerError>;

    /// Best-effort graceful disconnect.
    async fn close(&mut self) {}
}

/// Cooperative stop flag shared with whoever owns the pipeline.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the subscriber to exit once the current message is handled.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct StreamSubscriber<C> {
    connector: C,
    reconnect_delay: Duration,
    stop_rx: watch::Receiver<bool>,
}

impl<C: BrokerConnector> StreamSubscriber<C> {
    pub fn new(connector: C, reconnect_delay: Duration) -> (Self, StopHandle) {
        let (tx, stop_rx) = watch::channel(false);
        let subscriber = Self {
            connector,
            reconnect_delay,
            stop_rx,
        };
        (subscriber, StopHandle { tx: Arc::new(tx) })
    }

    /// Consume until stopped. Connection failures never escape.
    pub async fn run<F, Fut>(&mut self, mut on_message: F)
    where
        F: FnMut(Vec<u8>) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        info!("Stream subscriber started");
        let mut attempt: u64 = 0;

        while !*self.stop_rx.borrow() {
            attempt += 1;
            let connected = tokio::select! {
                biased;
                _ = stopped(&mut self.stop_rx) => break,
                res = self.connector.connect() => res,
            };

            match connected {
                Ok(mut session) => {
                    info!(attempt, "Broker session established");
                    match consume(&mut self.stop_rx, session.as_mut(), &mut on_message).await {
                        None => {
                            session.close().await;
                            break;
                        }
                        Some(err) => error!(error = %err, "Broker connection lost"),
                    }
                }
                Err(err) => error!(attempt, error = %err, "Broker connection failed"),
            }

            warn!(
                delay_secs = self.reconnect_delay.as_secs_f64(),
                "Reconnecting to broker after delay"
            );
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop_rx) => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Stream subscriber stopped");
    }
}

/// Returns `None` when stopped, the failure otherwise.
async fn consume<F, Fut>(
    stop_rx: &mut watch::Receiver<bool>,
    session: &mut dyn BrokerSession,
    on_message: &mut F,
) -> Option<BrokerError>
where
    F: FnMut(Vec<u8>) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = stopped(stop_rx) => return None,
            next = session.next_payload() => next,
        };
        match next {
            Ok(payload) => {
                debug!(bytes = payload.len(), "Message received");
                on_message(payload).await;
            }
            Err(err) => return Some(err),
        }
    }
}

/// Resolves once the flag is set. A dropped sender never resolves.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
