#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::Duration,
};
use tsunagi::{
    EventBus, EventBusConfig, HandlerError, IntegrationEvent, IntegrationEventHandler, MemoryBroker, ServiceContainer,
};

pub const EXCHANGE: &str = "toystore_eventbus";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> EventBusConfig {
    EventBusConfig::builder()
        .host_id("test-host")
        .handler_timeout(Duration::from_millis(200))
        .reconnect_delay(Duration::from_millis(20))
        .build()
        .unwrap()
}

pub fn bus(broker: &MemoryBroker, container: &ServiceContainer) -> EventBus {
    bus_with(config(), broker, container)
}

pub fn bus_with(config: EventBusConfig, broker: &MemoryBroker, container: &ServiceContainer) -> EventBus {
    init_tracing();
    EventBus::new(config, Arc::new(broker.clone()), container.clone()).unwrap()
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// Remembers every event it handles.
pub struct Recorder<E> {
    events: Mutex<Vec<E>>,
}

impl<E> Default for Recorder<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> Recorder<E> {
    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl<E: IntegrationEvent> IntegrationEventHandler<E> for Recorder<E> {
    async fn handle(&self, event: E) -> Result<(), HandlerError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Counts its invocations and always fails.
pub struct Failing<E> {
    calls: Mutex<usize>,
    _event: PhantomData<fn() -> E>,
}

impl<E> Default for Failing<E> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(0),
            _event: PhantomData,
        }
    }
}

impl<E> Failing<E> {
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl<E: IntegrationEvent> IntegrationEventHandler<E> for Failing<E> {
    async fn handle(&self, _event: E) -> Result<(), HandlerError> {
        *self.calls.lock().unwrap() += 1;
        Err(HandlerError::failed("downstream service unavailable"))
    }
}

/// Never finishes within any reasonable handler timeout.
pub struct Stalled<E>(PhantomData<fn() -> E>);

impl<E> Default for Stalled<E> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<E: IntegrationEvent> IntegrationEventHandler<E> for Stalled<E> {
    async fn handle(&self, _event: E) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}
