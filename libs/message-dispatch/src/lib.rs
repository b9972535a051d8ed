//! # Message Dispatch
//!
//! The local front door of the runtime. Callers hand the dispatcher a
//! command or event; it evaluates delivery policies, stamps the envelope's
//! hop trail, enforces the configured size limit, then either executes a
//! local receptor on the policy-selected executor or enqueues an outbox row
//! for transport fan-out. Every dispatch returns a [`DeliveryReceipt`];
//! callers never see raw store or transport errors.

mod dispatcher;
mod receipt;
mod receptors;

pub use dispatcher::{Dispatcher, DispatcherBuilder, EventOptions};
pub use receipt::{DeliveryReceipt, DeliveryStatus};
pub use receptors::{Receptor, ReceptorContext, ReceptorRegistry, ReceptorRegistryBuilder};
