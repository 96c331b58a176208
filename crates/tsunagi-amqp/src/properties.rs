use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use tsunagi::transport::{self, ExchangeSpec, OutgoingMessage, QueueSpec};

pub(crate) const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

const PERSISTENT: u8 = 2;

pub(crate) fn exchange_kind(spec: &ExchangeSpec) -> ExchangeKind {
    match spec.kind {
        transport::ExchangeKind::Direct => ExchangeKind::Direct,
    }
}

pub(crate) fn exchange_options(spec: &ExchangeSpec) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: spec.durable,
        auto_delete: spec.auto_delete,
        ..ExchangeDeclareOptions::default()
    }
}

pub(crate) fn queue_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: spec.durable,
        auto_delete: spec.auto_delete,
        exclusive: spec.exclusive,
        ..QueueDeclareOptions::default()
    }
}

pub(crate) fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        arguments.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    arguments
}

pub(crate) fn message_properties(message: &OutgoingMessage) -> BasicProperties {
    let mut properties = BasicProperties::default().with_content_type(ShortString::from(message.content_type.as_str()));
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }
    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(kind) = &message.message_type {
        properties = properties.with_kind(ShortString::from(kind.as_str()));
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(u64::try_from(timestamp.timestamp()).unwrap_or_default());
    }
    properties
}
