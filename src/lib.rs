#![forbid(unsafe_code)]

pub mod cache;
pub mod chat;
pub mod clock;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod dedup;
pub mod error;
pub mod model;
pub mod optimistic;
pub mod presence;
pub mod session;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at the crate root.
pub use crate::cache::{ApplyOutcome, CacheChange, CacheSubscription, EntityCache, LoadOutcome};
pub use crate::chat::{ConversationSync, RoomGuard};
pub use crate::clock::WallClock;
pub use crate::config::{Config, LoggingConfig, ReconnectConfig, SyncTuning};
pub use crate::connection::{
    ChannelMessage, ConnectionState, ReconnectDecision, SessionIdentity,
};
pub use crate::model::{
    Appointment, AppointmentId, AppointmentStatus, ChatMessage, Company, CompanyId, Conversation,
    ConversationId, MessageId, PushEvent, RequestId, Ticket, TicketId, TicketStatus, User, UserId,
    UserRole, Visitor, VisitorId,
};
pub use crate::presence::{AlertSink, PresenceTracker, PresenceUser};
pub use crate::session::{
    BackendRequest, MutationOutcome, RouteOutcome, SessionChannels, SyncSession,
};
