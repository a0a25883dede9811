//! Synchronized domain entities and their partial-update patches.
//!
//! Entities are value-like: pushed updates replace or merge fields by key,
//! never by position. Each entity carries its own deterministic ordering
//! rule, applied by the cache on every structural mutation.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use super::ids::{
    AppointmentId, CompanyId, ConversationId, MessageId, TicketId, UserId, VisitorId,
};

/// Anything addressable by a unique entity key. Keys index both ordered
/// and hashed collections, so they carry `Ord` and `Hash` together.
pub trait Keyed {
    type Id: Ord + Hash + Clone + fmt::Display;

    fn id(&self) -> &Self::Id;
}

/// A synchronized entity: keyed, patchable, deterministically ordered.
pub trait Entity: Keyed + Clone {
    type Patch: Keyed<Id = Self::Id>;

    /// Merge the patch's present fields into `self`. All-or-nothing per key:
    /// a patch never leaves the entity half-written.
    fn apply_patch(&mut self, patch: &Self::Patch);

    /// The documented sort rule for this entity type.
    fn cmp_order(&self, other: &Self) -> Ordering;
}

macro_rules! keyed {
    ($name:ident, $id:ty) => {
        impl Keyed for $name {
            type Id = $id;

            fn id(&self) -> &Self::Id {
                &self.id
            }
        }
    };
}

macro_rules! merge {
    ($dst:expr, $patch:expr, [$($field:ident),+ $(,)?]) => {
        $(if let Some(value) = &$patch.$field {
            $dst.$field = value.clone();
        })+
    };
}

macro_rules! merge_opt {
    ($dst:expr, $patch:expr, [$($field:ident),+ $(,)?]) => {
        $(if $patch.$field.is_some() {
            $dst.$field = $patch.$field.clone();
        })+
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Operations,
    Staff,
}

impl UserRole {
    /// Audience for the new-ticket alert: the operations team plus admins.
    pub fn hears_ticket_alerts(self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Operations)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: UserRole,
    #[serde(default)]
    pub team: Option<String>,
}

keyed!(User, UserId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<UserRole>,
    #[serde(default)]
    pub team: Option<String>,
}

keyed!(UserPatch, UserId);

impl Entity for User {
    type Patch = UserPatch;

    fn apply_patch(&mut self, patch: &UserPatch) {
        merge!(self, patch, [name, role]);
        merge_opt!(self, patch, [team]);
    }

    fn cmp_order(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name).then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
}

keyed!(Company, CompanyId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyPatch {
    pub id: CompanyId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

keyed!(CompanyPatch, CompanyId);

impl Entity for Company {
    type Patch = CompanyPatch;

    fn apply_patch(&mut self, patch: &CompanyPatch) {
        merge!(self, patch, [name]);
        merge_opt!(self, patch, [unit]);
    }

    fn cmp_order(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name).then_with(|| self.id.cmp(&other.id))
    }
}

/// Wire status strings are the product's original Portuguese labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    #[serde(rename = "Aberto")]
    Open,
    #[serde(rename = "Em andamento")]
    InProgress,
    #[serde(rename = "Resolvido")]
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub status: TicketStatus,
    #[serde(default)]
    pub opened_by: Option<UserId>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

keyed!(Ticket, TicketId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPatch {
    pub id: TicketId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub updated_at_ms: Option<i64>,
}

keyed!(TicketPatch, TicketId);

impl Entity for Ticket {
    type Patch = TicketPatch;

    fn apply_patch(&mut self, patch: &TicketPatch) {
        merge!(self, patch, [title, status, updated_at_ms]);
    }

    /// Most recently active first.
    fn cmp_order(&self, other: &Self) -> Ordering {
        other
            .updated_at_ms
            .cmp(&self.updated_at_ms)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A visitor/incident record at the gate.
///
/// `company_name` is display-only: the canonical link is `company_id`. Event
/// payloads may carry either or both; when the event omits the name, the
/// locally cached company list fills it in as a fallback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visitor {
    pub id: VisitorId,
    pub name: String,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub company_name: Option<String>,
    pub arrived_at_ms: i64,
}

keyed!(Visitor, VisitorId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorPatch {
    pub id: VisitorId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub arrived_at_ms: Option<i64>,
}

keyed!(VisitorPatch, VisitorId);

impl Entity for Visitor {
    type Patch = VisitorPatch;

    fn apply_patch(&mut self, patch: &VisitorPatch) {
        merge!(self, patch, [name, arrived_at_ms]);
        merge_opt!(self, patch, [document, company_id, company_name]);
    }

    /// Most recent arrival first.
    fn cmp_order(&self, other: &Self) -> Ordering {
        other
            .arrived_at_ms
            .cmp(&self.arrived_at_ms)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Present,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub visitor_name: String,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub company_name: Option<String>,
    pub scheduled_for_ms: i64,
}

keyed!(Appointment, AppointmentId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentPatch {
    pub id: AppointmentId,
    #[serde(default)]
    pub visitor_name: Option<String>,
    #[serde(default)]
    pub status: Option<AppointmentStatus>,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub scheduled_for_ms: Option<i64>,
}

keyed!(AppointmentPatch, AppointmentId);

impl Entity for Appointment {
    type Patch = AppointmentPatch;

    fn apply_patch(&mut self, patch: &AppointmentPatch) {
        merge!(self, patch, [visitor_name, status, scheduled_for_ms]);
        merge_opt!(self, patch, [company_id, company_name]);
    }

    /// Soonest (most recently scheduled) first.
    fn cmp_order(&self, other: &Self) -> Ordering {
        other
            .scheduled_for_ms
            .cmp(&self.scheduled_for_ms)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub unread: u32,
    pub last_activity_ms: i64,
    #[serde(default)]
    pub last_message_preview: Option<String>,
}

keyed!(Conversation, ConversationId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPatch {
    pub id: ConversationId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub unread: Option<u32>,
    #[serde(default)]
    pub last_activity_ms: Option<i64>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
}

keyed!(ConversationPatch, ConversationId);

impl Entity for Conversation {
    type Patch = ConversationPatch;

    fn apply_patch(&mut self, patch: &ConversationPatch) {
        merge!(self, patch, [title, unread, last_activity_ms]);
        merge_opt!(self, patch, [last_message_preview]);
    }

    /// Most recently active first.
    fn cmp_order(&self, other: &Self) -> Ordering {
        other
            .last_activity_ms
            .cmp(&self.last_activity_ms)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub body: String,
    pub sent_at_ms: i64,
}

keyed!(ChatMessage, MessageId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePatch {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub body: Option<String>,
}

keyed!(ChatMessagePatch, MessageId);

impl Entity for ChatMessage {
    type Patch = ChatMessagePatch;

    fn apply_patch(&mut self, patch: &ChatMessagePatch) {
        merge!(self, patch, [body]);
    }

    /// Chronological.
    fn cmp_order(&self, other: &Self) -> Ordering {
        self.sent_at_ms
            .cmp(&other.sent_at_ms)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_status_uses_wire_labels() {
        let json = serde_json::to_string(&TicketStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"Em andamento\"");
        let back: TicketStatus = serde_json::from_str("\"Aberto\"").expect("parse");
        assert_eq!(back, TicketStatus::Open);
    }

    #[test]
    fn patch_merges_present_fields_only() {
        let mut ticket = Ticket {
            id: TicketId::new("7").unwrap(),
            title: "Portão travado".to_string(),
            status: TicketStatus::Open,
            opened_by: None,
            created_at_ms: 100,
            updated_at_ms: 100,
        };
        let patch = TicketPatch {
            id: ticket.id.clone(),
            title: None,
            status: Some(TicketStatus::InProgress),
            updated_at_ms: Some(200),
        };
        ticket.apply_patch(&patch);
        assert_eq!(ticket.title, "Portão travado");
        assert_eq!(ticket.status, TicketStatus::InProgress);
        assert_eq!(ticket.updated_at_ms, 200);
    }

    #[test]
    fn visitor_patch_keeps_company_name_when_absent() {
        let mut visitor = Visitor {
            id: VisitorId::new("v1").unwrap(),
            name: "Ana".to_string(),
            document: None,
            company_id: Some(CompanyId::new("c1").unwrap()),
            company_name: Some("Atlas Ltda".to_string()),
            arrived_at_ms: 10,
        };
        let patch = VisitorPatch {
            id: visitor.id.clone(),
            name: Some("Ana Souza".to_string()),
            document: None,
            company_id: None,
            company_name: None,
            arrived_at_ms: None,
        };
        visitor.apply_patch(&patch);
        assert_eq!(visitor.name, "Ana Souza");
        assert_eq!(visitor.company_name.as_deref(), Some("Atlas Ltda"));
    }

    #[test]
    fn entity_keys_index_hashed_collections() {
        use std::collections::HashMap;

        fn index_by_id<T: Keyed>(items: &[T]) -> HashMap<T::Id, usize> {
            items
                .iter()
                .enumerate()
                .map(|(position, item)| (item.id().clone(), position))
                .collect()
        }

        let companies = vec![
            Company {
                id: CompanyId::new("c1").unwrap(),
                name: "Atlas Ltda".to_string(),
                unit: None,
            },
            Company {
                id: CompanyId::new("c2").unwrap(),
                name: "Borges SA".to_string(),
                unit: None,
            },
        ];
        let index = index_by_id(&companies);
        assert_eq!(index[&CompanyId::new("c2").unwrap()], 1);
    }

    #[test]
    fn tickets_order_most_recent_first() {
        let mk = |id: &str, at: i64| Ticket {
            id: TicketId::new(id).unwrap(),
            title: String::new(),
            status: TicketStatus::Open,
            opened_by: None,
            created_at_ms: at,
            updated_at_ms: at,
        };
        let older = mk("a", 100);
        let newer = mk("b", 200);
        assert_eq!(newer.cmp_order(&older), Ordering::Less);
    }
}
