mod conflict;
mod error;
mod mutations;
mod queries;
mod resolve;
mod store;

pub use error::{EngineError, ErrorKind};
pub use resolve::resolve_schedule;
pub use store::{AvailabilityStore, SharedAvailability};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::directory::{UserDirectory, UserProfile};
use crate::journal::Journal;
use crate::model::*;
use crate::notify::{BookingNotice, NotifyHub};

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group
/// commit:
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then the non-append command
                            flush_and_respond(&mut journal, &mut batch);
                            handle_non_append(&mut journal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut journal, &mut batch);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_and_respond(
    journal: &mut Journal,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
        .record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(journal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub store: AvailabilityStore,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    directory: Arc<UserDirectory>,
}

/// Apply an expert-scoped event to an aggregate (no locking — the caller
/// holds the write guard). Infallible by design: a dangling target is a
/// no-op so that replaying a journal with a trimmed tail cannot panic.
fn apply_to_state(rs: &mut AvailabilityState, event: &Event) {
    match event {
        Event::WeeklySet { template, .. } => {
            rs.weekly = template.clone();
        }
        Event::BlockedDatesSet { dates, .. } => {
            rs.blocked = dates.clone();
        }
        Event::OverrideSet { date, slots, .. } => {
            rs.upsert_override(*date, slots.iter().map(Slot::from_spec).collect());
        }
        Event::OverrideRemoved { date, .. } => {
            if let Some(day) = rs.override_mut(*date) {
                day.is_active = false;
            }
        }
        Event::ClaimRequested { date, start, end, user_id, message, created_at, .. } => {
            if let Some(slot) = rs.slot_mut(*date, *start, *end) {
                slot.claims.push(BookingClaim {
                    user_id: *user_id,
                    status: ClaimStatus::Pending,
                    created_at: *created_at,
                });
                if message.is_some() {
                    slot.message = message.clone();
                }
            }
        }
        Event::ClaimCancelled { date, start, end, user_id, .. } => {
            if let Some(slot) = rs.slot_mut(*date, *start, *end) {
                slot.claims.retain(|c| c.user_id != *user_id);
            }
        }
        Event::ClaimDecided { date, start, end, user_id, decision, .. } => {
            if let Some(slot) = rs.slot_mut(*date, *start, *end) {
                match decision {
                    // Single winner: everyone else is forced to Rejected
                    Decision::Accept => {
                        for claim in &mut slot.claims {
                            claim.status = if claim.user_id == *user_id {
                                ClaimStatus::Accepted
                            } else {
                                ClaimStatus::Rejected
                            };
                        }
                    }
                    // No cascade on reject
                    Decision::Reject => {
                        if let Some(claim) = slot.claim_of_mut(*user_id) {
                            claim.status = ClaimStatus::Rejected;
                        }
                    }
                }
            }
        }
        Event::SlotMessageSet { date, start, end, message, .. } => {
            if let Some(slot) = rs.slot_mut(*date, *start, *end) {
                slot.message = message.clone();
            }
        }
        // Handled at the engine level, not per aggregate
        Event::UserRegistered { .. } => {}
    }
}

/// Extract the owning expert from an event (None for directory events).
fn event_expert_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::WeeklySet { expert_id, .. }
        | Event::BlockedDatesSet { expert_id, .. }
        | Event::OverrideSet { expert_id, .. }
        | Event::OverrideRemoved { expert_id, .. }
        | Event::ClaimRequested { expert_id, .. }
        | Event::ClaimCancelled { expert_id, .. }
        | Event::ClaimDecided { expert_id, .. }
        | Event::SlotMessageSet { expert_id, .. } => Some(*expert_id),
        Event::UserRegistered { .. } => None,
    }
}

impl Engine {
    pub fn new(journal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            store: AvailabilityStore::new(),
            journal_tx,
            notify,
            directory: Arc::new(UserDirectory::new()),
        };

        // Replay — we are the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never block here: this may run inside an
        // async context (lazy tenant creation).
        for event in &events {
            engine.apply_replayed(event);
        }

        Ok(engine)
    }

    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, email, role } => {
                self.directory.register(UserProfile {
                    id: *id,
                    name: name.clone(),
                    email: email.clone(),
                    role: *role,
                });
            }
            other => {
                if let Some(expert_id) = event_expert_id(other) {
                    let rs = self.store.get_or_create(expert_id);
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_to_state(&mut guard, other);
                }
            }
        }
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    /// Write an event to the journal via the background group-commit
    /// writer.
    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    /// Journal-append + apply + audit in one call. The aggregate is only
    /// mutated after the append succeeds, so a journal failure leaves it
    /// untouched.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut AvailabilityState,
        event: &Event,
        notice: Option<BookingNotice>,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_state(rs, event);
        if let Some(notice) = notice {
            self.notify.record(notice);
        }
        Ok(())
    }

    /// Rewrite the journal with the minimal event set that recreates the
    /// current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let mut users = self.directory.snapshot();
        users.sort_by_key(|p| p.id);
        for profile in users {
            events.push(Event::UserRegistered {
                id: profile.id,
                name: profile.name,
                email: profile.email,
                role: profile.role,
            });
        }

        let mut expert_ids = self.store.expert_ids();
        expert_ids.sort();
        for expert_id in expert_ids {
            let Some(rs) = self.store.get(&expert_id) else { continue };
            let guard = rs.read().await;

            // WeeklySet doubles as the aggregate-exists marker on replay.
            events.push(Event::WeeklySet {
                expert_id,
                template: guard.weekly.clone(),
            });
            if !guard.blocked.is_empty() {
                events.push(Event::BlockedDatesSet {
                    expert_id,
                    dates: guard.blocked.clone(),
                });
            }
            for day in &guard.overrides {
                events.push(Event::OverrideSet {
                    expert_id,
                    date: day.date,
                    slots: day
                        .slots
                        .iter()
                        .map(|s| SlotSpec {
                            start: s.start,
                            end: s.end,
                            message: s.message.clone(),
                        })
                        .collect(),
                });
                for slot in &day.slots {
                    for claim in &slot.claims {
                        events.push(Event::ClaimRequested {
                            expert_id,
                            date: day.date,
                            start: slot.start,
                            end: slot.end,
                            user_id: claim.user_id,
                            message: None,
                            created_at: claim.created_at,
                        });
                        let decision = match claim.status {
                            ClaimStatus::Pending => None,
                            ClaimStatus::Accepted => Some(Decision::Accept),
                            ClaimStatus::Rejected => Some(Decision::Reject),
                        };
                        if let Some(decision) = decision {
                            events.push(Event::ClaimDecided {
                                expert_id,
                                date: day.date,
                                start: slot.start,
                                end: slot.end,
                                user_id: claim.user_id,
                                decision,
                            });
                        }
                    }
                }
                if !day.is_active {
                    events.push(Event::OverrideRemoved { expert_id, date: day.date });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
