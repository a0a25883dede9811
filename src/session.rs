//! Session composition root.
//!
//! One `SyncSession` per authenticated session owns the connection manager,
//! the per-entity caches, the dedup table, the presence tracker and the chat
//! synchronizer. The application's composition root builds it and passes it
//! by reference to consumers; there is no ambient global. The engine is
//! sans-IO: outbound traffic leaves over channels, and the transport feeds
//! completions and pushed events back through the entry points below, so a
//! slow backend call never stalls event routing.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::{ApplyOutcome, EntityCache, LoadOutcome, LoadState, LoadTicket};
use crate::chat::{ConversationSync, RoomGuard};
use crate::clock::WallClock;
use crate::config::Config;
use crate::connection::{
    ChannelMessage, ConnectionManager, ConnectionState, ConnectionSubscription, ReconnectDecision,
    SessionIdentity,
};
use crate::debounce::Debouncer;
use crate::dedup::EventDeduplicator;
use crate::error::Error;
use crate::model::{
    Appointment, AppointmentId, AppointmentPatch, AppointmentStatus, ChatMessage, ChatMessagePatch,
    Company, CompanyId, CompanyPatch, Conversation, ConversationId, ConversationPatch, Entity,
    EntityKind, EventAction, EventError, MessageId, PushEvent, RequestId, Ticket, TicketId,
    TicketPatch, TicketStatus, User, UserId, UserPatch, Visitor, VisitorId, VisitorPatch,
};
use crate::optimistic::{MutationCoordinator, MutationError, Resolution};
use crate::presence::{AlertSink, PresenceTracker, PresenceUser};

/// REST-lane traffic. The transport drains this queue, performs the calls
/// and feeds results back through `complete_*`.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendRequest {
    Fetch {
        entity: EntityKind,
        generation: u64,
    },
    FetchMessages {
        conversation: ConversationId,
        generation: u64,
    },
    FetchRoster,
    CreateTicket {
        request_id: RequestId,
        ticket: Ticket,
    },
    UpdateTicket {
        request_id: RequestId,
        ticket: Ticket,
    },
    DeleteTicket {
        request_id: RequestId,
        id: TicketId,
    },
    CreateVisitor {
        request_id: RequestId,
        visitor: Visitor,
    },
    UpdateVisitor {
        request_id: RequestId,
        visitor: Visitor,
    },
    DeleteVisitor {
        request_id: RequestId,
        id: VisitorId,
    },
    UpdateAppointment {
        request_id: RequestId,
        appointment: Appointment,
    },
}

/// Result of one backend mutation call, echoing the request id.
#[derive(Clone, Debug)]
pub enum MutationOutcome {
    /// `entity` is the canonical server representation, when the endpoint
    /// returns one instead of a bare acknowledgement.
    Success { entity: Option<serde_json::Value> },
    Failure { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied,
    /// Suppressed by the dedup window.
    Duplicate,
    /// Decoded fine but changed nothing (duplicate create, unknown key).
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MutationTarget {
    Ticket,
    Visitor,
    Appointment,
}

/// Receiving ends the transport drains.
pub struct SessionChannels {
    pub channel: Receiver<ChannelMessage>,
    pub requests: Receiver<BackendRequest>,
}

pub struct SyncSession {
    connection: ConnectionManager,
    visitors: EntityCache<Visitor>,
    tickets: EntityCache<Ticket>,
    companies: EntityCache<Company>,
    users: EntityCache<User>,
    appointments: EntityCache<Appointment>,
    chat: ConversationSync,
    dedup: EventDeduplicator,
    presence: PresenceTracker,
    ticket_mutations: MutationCoordinator<Ticket>,
    visitor_mutations: MutationCoordinator<Visitor>,
    appointment_mutations: MutationCoordinator<Appointment>,
    mutation_targets: HashMap<RequestId, MutationTarget>,
    search: Debouncer<String>,
    alert: Arc<dyn AlertSink>,
    requests: Sender<BackendRequest>,
}

impl SyncSession {
    pub fn new(config: &Config, alert: Arc<dyn AlertSink>) -> (Self, SessionChannels) {
        let (connection, channel_rx) = ConnectionManager::new(config.reconnect.clone());
        let (requests, requests_rx) = crossbeam::channel::unbounded();
        let tuning = &config.sync;
        let session = Self {
            chat: ConversationSync::new(connection.outbound_sender()),
            connection,
            visitors: EntityCache::new("visitors"),
            tickets: EntityCache::new("tickets"),
            companies: EntityCache::new("companies"),
            users: EntityCache::new("users"),
            appointments: EntityCache::new("appointments"),
            dedup: EventDeduplicator::new(tuning.dedup_ttl_ms, tuning.dedup_capacity),
            presence: PresenceTracker::new(tuning.alert_cooldown_ms),
            ticket_mutations: MutationCoordinator::new(
                tuning.mutation_timeout_ms,
                tuning.mutation_grace_ms,
            ),
            visitor_mutations: MutationCoordinator::new(
                tuning.mutation_timeout_ms,
                tuning.mutation_grace_ms,
            ),
            appointment_mutations: MutationCoordinator::new(
                tuning.mutation_timeout_ms,
                tuning.mutation_grace_ms,
            ),
            mutation_targets: HashMap::new(),
            search: Debouncer::new(tuning.search_debounce_ms),
            alert,
            requests,
        };
        (
            session,
            SessionChannels {
                channel: channel_rx,
                requests: requests_rx,
            },
        )
    }

    // ---- connection lifecycle -------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn subscribe_connection(&mut self) -> ConnectionSubscription {
        self.connection.subscribe()
    }

    pub fn connect(&mut self, identity: SessionIdentity) {
        self.presence.set_local_session(Some(PresenceUser {
            id: identity.user_id.clone(),
            role: identity.role,
            team: identity.team.clone(),
        }));
        self.connection.connect(Some(identity));
    }

    /// The transport finished its handshake. Announces identity, requests a
    /// fresh roster, and on a reconnect refreshes every loaded cache and
    /// re-joins open rooms.
    pub fn handshake_complete(&mut self) -> Result<(), Error> {
        let handshake = self.connection.handshake_complete()?;
        self.presence.on_connected();
        self.emit(BackendRequest::FetchRoster);

        if handshake.reconnected {
            self.refresh_loaded_caches();
            self.chat.rejoin_open_rooms();
        }
        Ok(())
    }

    /// Unexpected channel closure. Presence goes dark immediately; the
    /// returned decision tells the transport when to dial again.
    pub fn channel_closed(&mut self, now: WallClock) -> ReconnectDecision {
        self.presence.on_disconnected();
        self.connection.channel_closed(now)
    }

    /// Move a due reconnect attempt into `Connecting`; the transport dials
    /// and calls `handshake_complete` on success or `channel_closed` again
    /// on failure.
    pub fn retry_if_due(&mut self, now: WallClock) -> bool {
        self.connection.begin_retry(now)
    }

    /// Logout: deterministic teardown of every per-session singleton.
    pub fn logout(&mut self) {
        self.connection.disconnect();
        self.dedup.clear();
        self.presence.on_disconnected();
        self.presence.set_local_session(None);
        self.visitors.clear();
        self.tickets.clear();
        self.companies.clear();
        self.users.clear();
        self.appointments.clear();
        self.chat.clear();
        self.mutation_targets.clear();
        self.search.cancel();
    }

    /// Cooperative maintenance: roll back timed-out mutations. Call
    /// periodically from the host loop.
    pub fn tick(&mut self, now: WallClock) {
        for (request_id, _) in self.ticket_mutations.expire(&mut self.tickets, now) {
            self.mutation_targets.remove(&request_id);
        }
        for (request_id, _) in self.visitor_mutations.expire(&mut self.visitors, now) {
            self.mutation_targets.remove(&request_id);
        }
        for (request_id, _) in self
            .appointment_mutations
            .expire(&mut self.appointments, now)
        {
            self.mutation_targets.remove(&request_id);
        }
    }

    // ---- bulk loads ------------------------------------------------------

    pub fn load_visitors(&mut self) -> Option<Vec<Visitor>> {
        load_listing(&mut self.visitors, EntityKind::Visitor, &self.requests)
    }

    pub fn load_tickets(&mut self) -> Option<Vec<Ticket>> {
        load_listing(&mut self.tickets, EntityKind::Ticket, &self.requests)
    }

    pub fn load_companies(&mut self) -> Option<Vec<Company>> {
        load_listing(&mut self.companies, EntityKind::Company, &self.requests)
    }

    pub fn load_users(&mut self) -> Option<Vec<User>> {
        load_listing(&mut self.users, EntityKind::User, &self.requests)
    }

    pub fn load_appointments(&mut self) -> Option<Vec<Appointment>> {
        load_listing(&mut self.appointments, EntityKind::Appointment, &self.requests)
    }

    pub fn load_conversations(&mut self) -> Option<Vec<Conversation>> {
        match self.chat.load_conversations() {
            LoadOutcome::Hit(rows) => Some(rows),
            LoadOutcome::InFlight => None,
            LoadOutcome::Fetch(ticket) => {
                self.emit(BackendRequest::Fetch {
                    entity: EntityKind::Conversation,
                    generation: ticket.generation,
                });
                None
            }
        }
    }

    pub fn load_messages(&mut self, conversation: &ConversationId) -> Option<Vec<ChatMessage>> {
        match self.chat.load_messages(conversation) {
            LoadOutcome::Hit(rows) => Some(rows),
            LoadOutcome::InFlight => None,
            LoadOutcome::Fetch(ticket) => {
                self.emit(BackendRequest::FetchMessages {
                    conversation: conversation.clone(),
                    generation: ticket.generation,
                });
                None
            }
        }
    }

    pub fn complete_visitor_load(&mut self, generation: u64, mut rows: Vec<Visitor>) -> bool {
        for visitor in &mut rows {
            fill_company_name(&visitor.company_id, &mut visitor.company_name, &self.companies);
        }
        self.visitors.complete_load(LoadTicket { generation }, rows)
    }

    /// Applying the first ticket listing also arms the new-ticket alert:
    /// initial population must never be mistaken for new activity.
    pub fn complete_ticket_load(&mut self, generation: u64, rows: Vec<Ticket>) -> bool {
        let applied = self.tickets.complete_load(LoadTicket { generation }, rows);
        if applied {
            self.presence.arm_alerts();
        }
        applied
    }

    pub fn complete_company_load(&mut self, generation: u64, rows: Vec<Company>) -> bool {
        self.companies.complete_load(LoadTicket { generation }, rows)
    }

    pub fn complete_user_load(&mut self, generation: u64, rows: Vec<User>) -> bool {
        self.users.complete_load(LoadTicket { generation }, rows)
    }

    pub fn complete_appointment_load(
        &mut self,
        generation: u64,
        mut rows: Vec<Appointment>,
    ) -> bool {
        for appointment in &mut rows {
            fill_company_name(
                &appointment.company_id,
                &mut appointment.company_name,
                &self.companies,
            );
        }
        self.appointments.complete_load(LoadTicket { generation }, rows)
    }

    pub fn complete_conversation_load(&mut self, generation: u64, rows: Vec<Conversation>) -> bool {
        self.chat
            .complete_conversation_load(LoadTicket { generation }, rows)
    }

    pub fn complete_message_load(
        &mut self,
        conversation: &ConversationId,
        generation: u64,
        rows: Vec<ChatMessage>,
    ) -> bool {
        self.chat
            .complete_message_load(conversation, LoadTicket { generation }, rows)
    }

    /// Explicit pull-to-refresh for the listings the UI shows.
    pub fn refresh_tickets(&mut self) {
        refresh_listing(&mut self.tickets, EntityKind::Ticket, &self.requests);
    }

    pub fn refresh_visitors(&mut self) {
        refresh_listing(&mut self.visitors, EntityKind::Visitor, &self.requests);
    }

    pub fn refresh_appointments(&mut self) {
        refresh_listing(&mut self.appointments, EntityKind::Appointment, &self.requests);
    }

    // ---- pushed events ---------------------------------------------------

    /// Route one pushed event: dedup, decode, apply to the owning cache(s),
    /// then the alert overlay for ticket creations. All-or-nothing per key.
    pub fn route_event(&mut self, event: &PushEvent, now: WallClock) -> Result<RouteOutcome, Error> {
        let key = event.event_key().map_err(Error::Event)?;
        if !self.dedup.should_process(&key, now) {
            return Ok(RouteOutcome::Duplicate);
        }

        let outcome = match (event.entity, event.action) {
            (EntityKind::Ticket, EventAction::Created) => {
                let ticket: Ticket = event.decode()?;
                let applied = self.tickets.apply_create(ticket);
                if applied.applied() {
                    self.presence.notify_new_ticket(now, self.alert.as_ref());
                }
                applied
            }
            (EntityKind::Ticket, EventAction::Updated) => {
                self.tickets.apply_update(&event.decode::<TicketPatch>()?)
            }
            (EntityKind::Ticket, EventAction::Deleted) => {
                let id = TicketId::new(event.decode_key()?).map_err(EventError::from)?;
                self.tickets.apply_delete(&id)
            }

            (EntityKind::Visitor, EventAction::Created) => {
                let mut visitor: Visitor = event.decode()?;
                fill_company_name(&visitor.company_id, &mut visitor.company_name, &self.companies);
                self.visitors.apply_create(visitor)
            }
            (EntityKind::Visitor, EventAction::Updated) => {
                let mut patch: VisitorPatch = event.decode()?;
                fill_company_name(&patch.company_id, &mut patch.company_name, &self.companies);
                self.visitors.apply_update(&patch)
            }
            (EntityKind::Visitor, EventAction::Deleted) => {
                let id = VisitorId::new(event.decode_key()?).map_err(EventError::from)?;
                self.visitors.apply_delete(&id)
            }

            (EntityKind::Company, EventAction::Created) => {
                self.companies.apply_create(event.decode()?)
            }
            (EntityKind::Company, EventAction::Updated) => {
                self.companies.apply_update(&event.decode::<CompanyPatch>()?)
            }
            (EntityKind::Company, EventAction::Deleted) => {
                let id = CompanyId::new(event.decode_key()?).map_err(EventError::from)?;
                self.companies.apply_delete(&id)
            }

            (EntityKind::User, EventAction::Created) => self.users.apply_create(event.decode()?),
            (EntityKind::User, EventAction::Updated) => {
                self.users.apply_update(&event.decode::<UserPatch>()?)
            }
            (EntityKind::User, EventAction::Deleted) => {
                let id = UserId::new(event.decode_key()?).map_err(EventError::from)?;
                self.users.apply_delete(&id)
            }

            (EntityKind::Appointment, EventAction::Created) => {
                let mut appointment: Appointment = event.decode()?;
                fill_company_name(
                    &appointment.company_id,
                    &mut appointment.company_name,
                    &self.companies,
                );
                self.appointments.apply_create(appointment)
            }
            (EntityKind::Appointment, EventAction::Updated) => {
                let mut patch: AppointmentPatch = event.decode()?;
                fill_company_name(&patch.company_id, &mut patch.company_name, &self.companies);
                self.appointments.apply_update(&patch)
            }
            (EntityKind::Appointment, EventAction::Deleted) => {
                let id = AppointmentId::new(event.decode_key()?).map_err(EventError::from)?;
                self.appointments.apply_delete(&id)
            }

            (EntityKind::Conversation, EventAction::Created) => {
                self.chat.conversations_mut().apply_create(event.decode()?)
            }
            (EntityKind::Conversation, EventAction::Updated) => self
                .chat
                .conversations_mut()
                .apply_update(&event.decode::<ConversationPatch>()?),
            (EntityKind::Conversation, EventAction::Deleted) => {
                let id = ConversationId::new(event.decode_key()?).map_err(EventError::from)?;
                self.chat.conversations_mut().apply_delete(&id)
            }

            (EntityKind::Message, EventAction::Created) => {
                self.chat.apply_message(event.decode()?)
            }
            (EntityKind::Message, EventAction::Updated) => {
                self.chat.apply_message_update(&event.decode::<ChatMessagePatch>()?)
            }
            (EntityKind::Message, EventAction::Deleted) => {
                let id = MessageId::new(event.decode_key()?).map_err(EventError::from)?;
                self.chat.apply_message_delete(&id)
            }
        };

        Ok(match outcome {
            ApplyOutcome::Applied => RouteOutcome::Applied,
            ApplyOutcome::Ignored => RouteOutcome::Ignored,
        })
    }

    // ---- presence --------------------------------------------------------

    pub fn presence_joined(&mut self, user: PresenceUser) {
        self.presence.apply_join(user);
    }

    pub fn presence_left(&mut self, id: &UserId) {
        self.presence.apply_leave(id);
    }

    pub fn complete_roster(&mut self, users: Vec<PresenceUser>) {
        self.presence.replace_roster(users);
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    // ---- user actions (optimistic) --------------------------------------

    pub fn create_ticket(&mut self, ticket: Ticket, now: WallClock) -> Result<RequestId, Error> {
        let request_id =
            self.ticket_mutations
                .begin_upsert(&mut self.tickets, ticket.clone(), now)?;
        self.mutation_targets.insert(request_id, MutationTarget::Ticket);
        self.emit(BackendRequest::CreateTicket { request_id, ticket });
        Ok(request_id)
    }

    pub fn set_ticket_status(
        &mut self,
        id: &TicketId,
        status: TicketStatus,
        now: WallClock,
    ) -> Result<RequestId, Error> {
        let existing = self.tickets.get(id).cloned().ok_or_else(|| {
            Error::from(MutationError::UnknownEntity { key: id.to_string() })
        })?;
        let mut proposed = existing;
        proposed.status = status;
        let request_id = self
            .ticket_mutations
            .begin_upsert(&mut self.tickets, proposed.clone(), now)?;
        self.mutation_targets.insert(request_id, MutationTarget::Ticket);
        self.emit(BackendRequest::UpdateTicket {
            request_id,
            ticket: proposed,
        });
        Ok(request_id)
    }

    pub fn delete_ticket(&mut self, id: &TicketId, now: WallClock) -> Result<RequestId, Error> {
        let request_id = self
            .ticket_mutations
            .begin_delete(&mut self.tickets, id.clone(), now)?;
        self.mutation_targets.insert(request_id, MutationTarget::Ticket);
        self.emit(BackendRequest::DeleteTicket {
            request_id,
            id: id.clone(),
        });
        Ok(request_id)
    }

    pub fn create_visitor(&mut self, mut visitor: Visitor, now: WallClock) -> Result<RequestId, Error> {
        fill_company_name(&visitor.company_id, &mut visitor.company_name, &self.companies);
        let request_id =
            self.visitor_mutations
                .begin_upsert(&mut self.visitors, visitor.clone(), now)?;
        self.mutation_targets.insert(request_id, MutationTarget::Visitor);
        self.emit(BackendRequest::CreateVisitor { request_id, visitor });
        Ok(request_id)
    }

    pub fn update_visitor(&mut self, visitor: Visitor, now: WallClock) -> Result<RequestId, Error> {
        let request_id =
            self.visitor_mutations
                .begin_upsert(&mut self.visitors, visitor.clone(), now)?;
        self.mutation_targets.insert(request_id, MutationTarget::Visitor);
        self.emit(BackendRequest::UpdateVisitor { request_id, visitor });
        Ok(request_id)
    }

    pub fn delete_visitor(&mut self, id: &VisitorId, now: WallClock) -> Result<RequestId, Error> {
        let request_id = self
            .visitor_mutations
            .begin_delete(&mut self.visitors, id.clone(), now)?;
        self.mutation_targets.insert(request_id, MutationTarget::Visitor);
        self.emit(BackendRequest::DeleteVisitor {
            request_id,
            id: id.clone(),
        });
        Ok(request_id)
    }

    pub fn confirm_appointment(
        &mut self,
        id: &AppointmentId,
        now: WallClock,
    ) -> Result<RequestId, Error> {
        self.set_appointment_status(id, AppointmentStatus::Confirmed, now)
    }

    pub fn mark_appointment_present(
        &mut self,
        id: &AppointmentId,
        now: WallClock,
    ) -> Result<RequestId, Error> {
        self.set_appointment_status(id, AppointmentStatus::Present, now)
    }

    pub fn set_appointment_status(
        &mut self,
        id: &AppointmentId,
        status: AppointmentStatus,
        now: WallClock,
    ) -> Result<RequestId, Error> {
        let existing = self.appointments.get(id).cloned().ok_or_else(|| {
            Error::from(MutationError::UnknownEntity { key: id.to_string() })
        })?;
        let mut proposed = existing;
        proposed.status = status;
        let request_id = self.appointment_mutations.begin_upsert(
            &mut self.appointments,
            proposed.clone(),
            now,
        )?;
        self.mutation_targets
            .insert(request_id, MutationTarget::Appointment);
        self.emit(BackendRequest::UpdateAppointment {
            request_id,
            appointment: proposed,
        });
        Ok(request_id)
    }

    /// Resolve one outstanding mutation. On failure the cache is already
    /// restored by the time the error is observable; the error is surfaced
    /// exactly once, here.
    pub fn complete_mutation(
        &mut self,
        request_id: RequestId,
        outcome: MutationOutcome,
        now: WallClock,
    ) -> Result<Resolution, Error> {
        let Some(target) = self.mutation_targets.remove(&request_id) else {
            debug!(%request_id, "completion for unknown request ignored");
            return Ok(Resolution::Unknown);
        };
        match outcome {
            MutationOutcome::Success { entity } => {
                let resolution = match target {
                    MutationTarget::Ticket => self.ticket_mutations.commit(
                        &mut self.tickets,
                        request_id,
                        entity.and_then(|v| decode_canonical("ticket", v)),
                        now,
                    ),
                    MutationTarget::Visitor => self.visitor_mutations.commit(
                        &mut self.visitors,
                        request_id,
                        entity.and_then(|v| decode_canonical("visitor", v)),
                        now,
                    ),
                    MutationTarget::Appointment => self.appointment_mutations.commit(
                        &mut self.appointments,
                        request_id,
                        entity.and_then(|v| decode_canonical("appointment", v)),
                        now,
                    ),
                };
                Ok(resolution)
            }
            MutationOutcome::Failure { reason } => {
                match target {
                    MutationTarget::Ticket => {
                        self.ticket_mutations.rollback(&mut self.tickets, request_id, now)
                    }
                    MutationTarget::Visitor => {
                        self.visitor_mutations
                            .rollback(&mut self.visitors, request_id, now)
                    }
                    MutationTarget::Appointment => self.appointment_mutations.rollback(
                        &mut self.appointments,
                        request_id,
                        now,
                    ),
                };
                Err(MutationError::RequestFailed { reason }.into())
            }
        }
    }

    // ---- chat ------------------------------------------------------------

    pub fn enter_room(&mut self, conversation: ConversationId) -> RoomGuard {
        self.chat.enter_room(conversation)
    }

    pub fn mark_read(&mut self, conversation: &ConversationId) {
        self.chat.mark_read(conversation);
    }

    pub fn chat(&self) -> &ConversationSync {
        &self.chat
    }

    // ---- reads and subscriptions ----------------------------------------

    pub fn visitors(&self) -> &EntityCache<Visitor> {
        &self.visitors
    }

    pub fn tickets(&self) -> &EntityCache<Ticket> {
        &self.tickets
    }

    pub fn companies(&self) -> &EntityCache<Company> {
        &self.companies
    }

    pub fn users(&self) -> &EntityCache<User> {
        &self.users
    }

    pub fn appointments(&self) -> &EntityCache<Appointment> {
        &self.appointments
    }

    pub fn subscribe_tickets(&mut self) -> crate::cache::CacheSubscription<TicketId> {
        self.tickets.subscribe()
    }

    pub fn subscribe_visitors(&mut self) -> crate::cache::CacheSubscription<VisitorId> {
        self.visitors.subscribe()
    }

    pub fn subscribe_conversations(
        &mut self,
    ) -> crate::cache::CacheSubscription<ConversationId> {
        self.chat.conversations_mut().subscribe()
    }

    // ---- search ----------------------------------------------------------

    pub fn schedule_search(&mut self, query: impl Into<String>, now: WallClock) {
        self.search.schedule(query.into(), now);
    }

    pub fn poll_search(&mut self, now: WallClock) -> Option<String> {
        self.search.poll(now)
    }

    // ---- internals -------------------------------------------------------

    fn refresh_loaded_caches(&mut self) {
        if self.visitors.load_state() == LoadState::Loaded {
            refresh_listing(&mut self.visitors, EntityKind::Visitor, &self.requests);
        }
        if self.tickets.load_state() == LoadState::Loaded {
            refresh_listing(&mut self.tickets, EntityKind::Ticket, &self.requests);
        }
        if self.companies.load_state() == LoadState::Loaded {
            refresh_listing(&mut self.companies, EntityKind::Company, &self.requests);
        }
        if self.users.load_state() == LoadState::Loaded {
            refresh_listing(&mut self.users, EntityKind::User, &self.requests);
        }
        if self.appointments.load_state() == LoadState::Loaded {
            refresh_listing(&mut self.appointments, EntityKind::Appointment, &self.requests);
        }
        let (list, rooms) = self.chat.refresh_if_loaded();
        if let Some(ticket) = list {
            self.emit(BackendRequest::Fetch {
                entity: EntityKind::Conversation,
                generation: ticket.generation,
            });
        }
        for (conversation, ticket) in rooms {
            self.emit(BackendRequest::FetchMessages {
                conversation,
                generation: ticket.generation,
            });
        }
    }

    fn emit(&self, request: BackendRequest) {
        emit_request(&self.requests, request);
    }
}

fn emit_request(requests: &Sender<BackendRequest>, request: BackendRequest) {
    if requests.send(request).is_err() {
        warn!("backend request lane closed");
    }
}

fn load_listing<T: Entity>(
    cache: &mut EntityCache<T>,
    kind: EntityKind,
    requests: &Sender<BackendRequest>,
) -> Option<Vec<T>> {
    match cache.load_once() {
        LoadOutcome::Hit(rows) => Some(rows),
        LoadOutcome::InFlight => None,
        LoadOutcome::Fetch(ticket) => {
            emit_request(
                requests,
                BackendRequest::Fetch {
                    entity: kind,
                    generation: ticket.generation,
                },
            );
            None
        }
    }
}

fn refresh_listing<T: Entity>(
    cache: &mut EntityCache<T>,
    kind: EntityKind,
    requests: &Sender<BackendRequest>,
) {
    let ticket = cache.force_refresh();
    emit_request(
        requests,
        BackendRequest::Fetch {
            entity: kind,
            generation: ticket.generation,
        },
    );
}

/// Partial-update precedence: event-provided display fields win; the cached
/// company list is only a fallback when the payload omits the name.
fn fill_company_name(
    company_id: &Option<CompanyId>,
    company_name: &mut Option<String>,
    companies: &EntityCache<Company>,
) {
    if company_name.is_some() {
        return;
    }
    if let Some(id) = company_id
        && let Some(company) = companies.get(id)
    {
        *company_name = Some(company.name.clone());
    }
}

fn decode_canonical<T: DeserializeOwned>(kind: &'static str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(entity) => Some(entity),
        Err(e) => {
            warn!(entity = kind, "malformed canonical entity in completion: {e}");
            None
        }
    }
}
