//! Data model: identity atoms, synchronized entities, pushed events.

mod entities;
mod event;
mod ids;

pub use entities::{
    Appointment, AppointmentPatch, AppointmentStatus, ChatMessage, ChatMessagePatch, Company,
    CompanyPatch, Conversation, ConversationPatch, Entity, Keyed, Ticket, TicketPatch,
    TicketStatus, User, UserPatch, UserRole, Visitor, VisitorPatch,
};
pub use event::{EntityKind, EventAction, EventError, EventKey, PushEvent};
pub use ids::{
    AppointmentId, CompanyId, ConversationId, InvalidId, MessageId, RequestId, TicketId, UserId,
    VisitorId,
};
