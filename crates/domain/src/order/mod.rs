//! Order entity, its lines, amounts, status machine and payment record.

mod aggregate;
mod payment;
mod state;
mod value_objects;

pub use aggregate::{NewOrder, Order};
pub use payment::{Payment, PaymentStatus};
pub use state::OrderStatus;
pub use value_objects::{OrderAmounts, OrderItem};
