use crate::{
    connection::ConnectionManager,
    dispatcher::Dispatcher,
    error::{EventBusError, Result},
    registry::HandlerRegistry,
    transport::{self, DeliveryStream, QueueSpec},
};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{error, info, warn};

enum ConsumerState {
    Idle,
    Consuming {
        handle: JoinHandle<()>,
        shutdown: watch::Sender<bool>,
    },
    Stopped,
}

/// Consumes the process queue and feeds deliveries to the dispatcher, one at a time.
pub(crate) struct Consumer {
    worker: Arc<Worker>,
    state: Mutex<ConsumerState>,
}

impl Consumer {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<RwLock<HandlerRegistry>>,
        queue: QueueSpec,
        prefetch: u16,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                consumer_tag: format!("{}.consumer", queue.name),
                connection,
                dispatcher,
                registry,
                queue,
                prefetch,
                reconnect_delay,
            }),
            state: Mutex::new(ConsumerState::Idle),
        }
    }

    pub(crate) fn queue_name(&self) -> &str {
        &self.worker.queue.name
    }

    /// Starts consuming unless already started. Returns whether this call started it.
    pub(crate) async fn start(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        match &*state {
            ConsumerState::Consuming { .. } => return Ok(false),
            ConsumerState::Stopped => return Err(EventBusError::Closed),
            ConsumerState::Idle => {}
        }

        let deliveries = self.worker.establish().await?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.worker).run(deliveries, shutdown_rx));
        *state = ConsumerState::Consuming { handle, shutdown };
        Ok(true)
    }

    pub(crate) async fn is_consuming(&self) -> bool {
        matches!(&*self.state.lock().await, ConsumerState::Consuming { .. })
    }

    pub(crate) async fn is_stopped(&self) -> bool {
        matches!(&*self.state.lock().await, ConsumerState::Stopped)
    }

    /// Stops the loop after the in-flight delivery has been settled. Idempotent.
    pub(crate) async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let ConsumerState::Consuming { handle, shutdown } = std::mem::replace(&mut *state, ConsumerState::Stopped) {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                error!("Consumer task on queue '{}' ended abnormally: {}", self.worker.queue.name, err);
            }
            info!("Stopped consuming queue '{}'", self.worker.queue.name);
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let ConsumerState::Consuming { handle, .. } = self.state.get_mut() {
            handle.abort();
        }
    }
}

struct Worker {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RwLock<HandlerRegistry>>,
    queue: QueueSpec,
    consumer_tag: String,
    prefetch: u16,
    reconnect_delay: Duration,
}

impl Worker {
    /// Declares the queue, binds every subscribed kind and opens the consumer.
    async fn establish(&self) -> transport::Result<DeliveryStream> {
        self.connection.declare_queue(&self.queue).await?;
        let kinds = self.registry.read().await.subscribed_kinds();
        for kind in &kinds {
            self.connection.bind(&self.queue.name, kind).await?;
        }
        let deliveries = self
            .connection
            .consume(&self.queue.name, &self.consumer_tag, self.prefetch)
            .await?;
        info!(
            "Consuming queue '{}' (prefetch {}, {} kind(s) bound)",
            self.queue.name,
            self.prefetch,
            kinds.len()
        );
        Ok(deliveries)
    }

    async fn run(self: Arc<Self>, mut deliveries: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => return,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            self.dispatcher.handle_delivery(delivery).await;
                        }
                        Some(Err(err)) => {
                            error!("Consumer on queue '{}' failed: {}", self.queue.name, err);
                            break;
                        }
                        None => break,
                    },
                }
            }

            drop(deliveries);
            warn!(
                "Lost consumer on queue '{}', reconnecting in {:?}",
                self.queue.name, self.reconnect_delay
            );
            deliveries = match self.recover(&mut shutdown).await {
                Some(deliveries) => deliveries,
                None => return,
            };
        }
    }

    /// Retries [`Self::establish`] every `reconnect_delay` until it succeeds or shutdown is requested.
    async fn recover(&self, shutdown: &mut watch::Receiver<bool>) -> Option<DeliveryStream> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return None,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            match self.establish().await {
                Ok(deliveries) => {
                    info!("Recovered consumer on queue '{}'", self.queue.name);
                    return Some(deliveries);
                }
                Err(err) => warn!("Failed to recover consumer on queue '{}': {}", self.queue.name, err),
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
