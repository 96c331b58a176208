//! Integration events exchanged by the storefront services.
//!
//! Catalog publishes product lifecycle facts, inventory publishes stock movements, ordering publishes
//! order facts and identity publishes registrations. Each type name doubles as its routing key.

use crate::integration_event::{EventHeader, IntegrationEvent};
use serde::{Deserialize, Serialize};

macro_rules! integration_event {
    ($event:ident) => {
        impl IntegrationEvent for $event {
            const NAME: &'static str = stringify!($event);

            fn header(&self) -> &EventHeader {
                &self.header
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCreatedEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub stock: u32,
    pub category_id: String,
}

impl ProductCreatedEvent {
    pub fn new(
        product_id: impl Into<String>,
        name: impl Into<String>,
        price: f64,
        stock: u32,
        category_id: impl Into<String>,
    ) -> Self {
        Self {
            header: EventHeader::new(),
            product_id: product_id.into(),
            name: name.into(),
            price,
            stock,
            category_id: category_id.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, header: EventHeader) -> Self {
        self.header = header;
        self
    }
}

integration_event!(ProductCreatedEvent);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdatedEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub category_id: String,
}

impl ProductUpdatedEvent {
    pub fn new(
        product_id: impl Into<String>,
        name: impl Into<String>,
        price: f64,
        category_id: impl Into<String>,
    ) -> Self {
        Self {
            header: EventHeader::new(),
            product_id: product_id.into(),
            name: name.into(),
            price,
            category_id: category_id.into(),
        }
    }
}

integration_event!(ProductUpdatedEvent);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDeletedEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub product_id: String,
}

impl ProductDeletedEvent {
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(),
            product_id: product_id.into(),
        }
    }
}

integration_event!(ProductDeletedEvent);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockUpdatedEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub product_id: String,
    pub previous_stock: u32,
    pub stock: u32,
}

impl StockUpdatedEvent {
    pub fn new(product_id: impl Into<String>, previous_stock: u32, stock: u32) -> Self {
        Self {
            header: EventHeader::new(),
            product_id: product_id.into(),
            previous_stock,
            stock,
        }
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.stock == 0
    }
}

integration_event!(StockUpdatedEvent);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl OrderLine {
    pub fn new(product_id: impl Into<String>, quantity: u32, unit_price: f64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price,
        }
    }

    pub fn subtotal(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderLine>,
    pub total: f64,
}

impl OrderCreatedEvent {
    /// `total` is the sum of the line subtotals.
    pub fn new(order_id: impl Into<String>, customer_id: impl Into<String>, items: Vec<OrderLine>) -> Self {
        let total = items.iter().map(OrderLine::subtotal).sum();
        Self {
            header: EventHeader::new(),
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            items,
            total,
        }
    }
}

integration_event!(OrderCreatedEvent);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChangedEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub order_id: String,
    pub status: OrderStatus,
}

impl OrderStatusChangedEvent {
    pub fn new(order_id: impl Into<String>, status: OrderStatus) -> Self {
        Self {
            header: EventHeader::new(),
            order_id: order_id.into(),
            status,
        }
    }
}

integration_event!(OrderStatusChangedEvent);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegisteredEvent {
    #[serde(flatten)]
    header: EventHeader,
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

impl UserRegisteredEvent {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(),
            user_id: user_id.into(),
            email: email.into(),
            display_name: display_name.into(),
        }
    }
}

integration_event!(UserRegisteredEvent);
