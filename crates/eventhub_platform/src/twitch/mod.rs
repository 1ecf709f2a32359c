#![forbid(unsafe_code)]

pub mod connector;
pub mod descriptor;
mod eventsub;
pub mod helix;
pub mod subscriptions;


pub use connector::{ConnectorConfig, EventSubConnector};
pub use descriptor::{DescriptorError, EventDescriptor};
pub use helix::{HelixClient, TokenUser};
pub use subscriptions::{Subscription, SubscriptionError, SubscriptionStatus, subscribe_all};
