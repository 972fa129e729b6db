//! Realtime change notifications and presence.

mod channel;
mod hub;
mod live;
mod phoenix;
mod presence;
mod subscription;

pub use channel::{
  apply_presence_diff, is_present, ChangeEvent, ChangeFilter, ChangeKind, Channel, ChannelConfig,
  ChannelControl, ChannelEvent, ChannelStatus, EventFilter, PresenceMap, PresenceMeta,
  RealtimeTransport,
};
pub use hub::{LocalClient, LocalHub};
pub use live::{LiveCollection, Query, QueryState};
pub use phoenix::{decode_event, join_payload, socket_url, PhoenixMessage, PhoenixTransport};
pub use presence::{PresenceRegistry, PresenceTicket, PresenceWatch};
pub use subscription::{Subscription, SubscriptionManager, SubscriptionState};
