mod client;
mod plan;

pub use client::{
    ApiErrorClass, EntryKind, RecordEnvelope, WorklogClient, WorklogError,
};
pub use plan::{AccountInfo, AccountUsage, Plan, SubscriptionLimits};
