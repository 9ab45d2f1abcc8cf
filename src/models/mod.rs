mod delivery;
mod schedule;
mod subscription;
mod user;

pub use delivery::{Delivery, DeliveryStatus, NewDelivery, ParseStatusError};
pub use schedule::Schedule;
pub use subscription::{DeliverySettings, NewSubscription, RunOutcome, Subscription, SubscriptionKind};
pub use user::{NewUser, SmtpConfig, User};
