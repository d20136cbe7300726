use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{merge_overlapping, validate_interval, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::source::*;

/// What a ledger entry holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Appointment(Appointment),
    Block(Block),
}

impl Record {
    pub fn id(&self) -> Ulid {
        match self {
            Record::Appointment(a) => a.id,
            Record::Block(b) => b.id,
        }
    }

    /// Whether the record takes the staff member's time.
    pub fn occupies(&self) -> bool {
        match self {
            Record::Appointment(a) => a.is_active(),
            Record::Block(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub interval: TimeInterval,
    /// Ledger revision that wrote this entry.
    pub revision: Revision,
    pub record: Record,
}

/// All appointments and blocks of one staff member, sorted by start.
#[derive(Debug, Default)]
pub struct StaffLedger {
    revision: Revision,
    entries: Vec<LedgerEntry>,
}

pub type SharedLedger = Arc<RwLock<StaffLedger>>;

impl StaffLedger {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a write: bump the revision and insert in start order.
    fn commit(&mut self, interval: TimeInterval, record: Record) {
        self.revision += 1;
        let entry = LedgerEntry {
            interval,
            revision: self.revision,
            record,
        };
        let pos = self
            .entries
            .binary_search_by_key(&entry.interval.start, |e| e.interval.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    fn remove(&mut self, id: Ulid) -> Option<LedgerEntry> {
        let pos = self.entries.iter().position(|e| e.record.id() == id)?;
        self.revision += 1;
        Some(self.entries.remove(pos))
    }

    fn appointment(&self, id: Ulid) -> Option<Appointment> {
        self.entries.iter().find_map(|e| match &e.record {
            Record::Appointment(a) if a.id == id => Some(a.clone()),
            _ => None,
        })
    }

    fn block(&self, id: Ulid) -> Option<Block> {
        self.entries.iter().find_map(|e| match &e.record {
            Record::Block(b) if b.id == id => Some(b.clone()),
            _ => None,
        })
    }

    /// Return only entries whose interval overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeInterval) -> impl Iterator<Item = &LedgerEntry> {
        let right_bound = self.entries.partition_point(|e| e.interval.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.interval.end > query.start)
    }

    /// Busy time intersecting `interval` held by anything but `exclude`, merged.
    pub fn occupied(&self, interval: &TimeInterval, exclude: Option<Ulid>) -> Vec<TimeInterval> {
        self.written_since(0, interval, exclude)
    }

    /// Busy time intersecting `interval` written after `read_at`, merged.
    pub fn written_since(&self, read_at: Revision, interval: &TimeInterval, exclude: Option<Ulid>) -> Vec<TimeInterval> {
        let mut spans: Vec<TimeInterval> = self
            .overlapping(interval)
            .filter(|e| e.revision > read_at && e.record.occupies() && Some(e.record.id()) != exclude)
            .map(|e| e.interval)
            .collect();
        spans.sort();
        merge_overlapping(&spans)
    }
}

/// Move `appointment` out of `source` and into `target` (or back into
/// `source` when `target` is `None`). Returns the previous record.
fn replace_appointment(
    source: &mut StaffLedger,
    target: Option<&mut StaffLedger>,
    appointment: Appointment,
    interval: TimeInterval,
    read_at: Revision,
) -> Result<CommitOutcome<Appointment>, EngineError> {
    let id = appointment.id;
    let before = source.appointment(id).ok_or(EngineError::NotFound(id))?;
    let conflicts = {
        let view: &StaffLedger = target.as_deref().unwrap_or(&*source);
        if target.is_some() && view.len() >= MAX_ENTRIES_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many entries for staff member"));
        }
        if appointment.is_active() {
            view.written_since(read_at, &interval, Some(id))
        } else {
            Vec::new()
        }
    };
    if !conflicts.is_empty() {
        return Ok(CommitOutcome::Stale {
            staff_id: appointment.staff_id,
            conflicts,
        });
    }
    source.remove(id);
    match target {
        Some(t) => t.commit(interval, Record::Appointment(appointment)),
        None => source.commit(interval, Record::Appointment(appointment)),
    }
    Ok(CommitOutcome::Committed(before))
}

/// Reference storage collaborator: per-staff ledgers in memory.
///
/// Every commit holds the staff member's ledger write lock while it checks
/// for intersecting writes newer than the caller's revision, so two racing
/// bookings for the same slot cannot both land.
pub struct InMemoryStore {
    ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: appointment/block id → staff id
    entity_to_staff: DashMap<Ulid, Ulid>,
    schedules: DashMap<Ulid, StaffSchedule>,
    staff: DashMap<Ulid, StaffMember>,
    notify: Arc<NotifyHub>,
}

impl InMemoryStore {
    pub fn new(notify: Arc<NotifyHub>) -> Self {
        Self {
            ledgers: DashMap::new(),
            entity_to_staff: DashMap::new(),
            schedules: DashMap::new(),
            staff: DashMap::new(),
            notify,
        }
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    fn ledger(&self, staff_id: Ulid) -> SharedLedger {
        self.ledgers.entry(staff_id).or_default().value().clone()
    }

    fn staff_for(&self, id: &Ulid) -> Result<Ulid, EngineError> {
        self.entity_to_staff
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*id))
    }

    fn all_ledgers(&self) -> Vec<SharedLedger> {
        self.ledgers.iter().map(|e| e.value().clone()).collect()
    }

    /// Load existing records without publishing events.
    pub async fn seed(&self, snapshot: &Snapshot) -> Result<(), EngineError> {
        for s in &snapshot.schedules {
            s.validate()?;
            self.schedules.insert(s.id, s.clone());
        }
        for m in &snapshot.staff {
            self.upsert_staff(m.clone())?;
        }
        for a in &snapshot.appointments {
            let interval = a.interval()?;
            self.insert_record(a.staff_id, interval, Record::Appointment(a.clone()), Revision::MAX)
                .await?;
        }
        for b in &snapshot.blocks {
            check_reason(b)?;
            let interval = b.interval()?;
            self.insert_record(b.staff_id, interval, Record::Block(b.clone()), Revision::MAX)
                .await?;
        }
        info!(
            schedules = snapshot.schedules.len(),
            appointments = snapshot.appointments.len(),
            blocks = snapshot.blocks.len(),
            staff = snapshot.staff.len(),
            "store seeded"
        );
        Ok(())
    }

    pub fn upsert_staff(&self, member: StaffMember) -> Result<(), EngineError> {
        if member.display_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("display name too long"));
        }
        self.staff.insert(member.id, member);
        Ok(())
    }

    /// Insert or replace a schedule. Returns the replaced one.
    pub fn upsert_schedule(&self, schedule: StaffSchedule) -> Result<Option<StaffSchedule>, EngineError> {
        schedule.validate()?;
        let before = self.schedules.insert(schedule.id, schedule.clone());
        self.notify.publish(&Event::ScheduleUpserted {
            before: before.clone(),
            after: schedule,
        });
        Ok(before)
    }

    pub fn delete_schedule(&self, id: Ulid) -> Result<StaffSchedule, EngineError> {
        let (_, schedule) = self.schedules.remove(&id).ok_or(EngineError::NotFound(id))?;
        self.notify.publish(&Event::ScheduleDeleted {
            schedule: schedule.clone(),
        });
        Ok(schedule)
    }

    async fn insert_record(
        &self,
        staff_id: Ulid,
        interval: TimeInterval,
        record: Record,
        read_at: Revision,
    ) -> Result<CommitOutcome<()>, EngineError> {
        validate_interval(&interval)?;
        let id = record.id();
        let ledger = self.ledger(staff_id);
        let mut guard = ledger.write().await;
        if self.entity_to_staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.len() >= MAX_ENTRIES_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many entries for staff member"));
        }
        let conflicts = if record.occupies() {
            guard.written_since(read_at, &interval, None)
        } else {
            Vec::new()
        };
        if !conflicts.is_empty() {
            return Ok(stale(staff_id, conflicts));
        }
        // the same id may be racing in on another staff member's ledger
        match self.entity_to_staff.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(staff_id);
            }
        }
        guard.commit(interval, record);
        Ok(CommitOutcome::Committed(()))
    }

    /// A consistent copy of everything stored, for debugging and tests.
    pub async fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot {
            schedules: self.schedules.iter().map(|e| e.value().clone()).collect(),
            staff: self.staff.iter().map(|e| e.value().clone()).collect(),
            ..Default::default()
        };
        for ledger in self.all_ledgers() {
            let guard = ledger.read().await;
            for e in &guard.entries {
                match &e.record {
                    Record::Appointment(a) => snapshot.appointments.push(a.clone()),
                    Record::Block(b) => snapshot.blocks.push(b.clone()),
                }
            }
        }
        snapshot.schedules.sort_by_key(|s| s.id);
        snapshot.staff.sort_by_key(|m| m.id);
        snapshot.appointments.sort_by_key(|a| (a.start_time, a.id));
        snapshot.blocks.sort_by_key(|b| (b.start_time, b.id));
        snapshot
    }
}

fn check_reason(block: &Block) -> Result<(), EngineError> {
    if block.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("block reason too long"));
    }
    Ok(())
}

fn stale<T>(staff_id: Ulid, conflicts: Vec<TimeInterval>) -> CommitOutcome<T> {
    metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "stale").increment(1);
    warn!(%staff_id, conflicts = conflicts.len(), "stale commit refused");
    CommitOutcome::Stale { staff_id, conflicts }
}

fn committed() {
    metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "committed").increment(1);
}

#[async_trait]
impl RosterSource for InMemoryStore {
    async fn list_schedules(&self, location_id: Option<Ulid>) -> Result<Vec<StaffSchedule>, EngineError> {
        let mut out: Vec<StaffSchedule> = self
            .schedules
            .iter()
            .filter(|e| location_id.is_none_or(|l| e.location_id == l))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }
}

#[async_trait]
impl IdentitySource for InMemoryStore {
    async fn list_staff(&self) -> Result<Vec<StaffMember>, EngineError> {
        let mut out: Vec<StaffMember> = self.staff.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|m| m.id);
        Ok(out)
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn list_appointments(
        &self,
        location_id: Option<Ulid>,
        range: TimeInterval,
    ) -> Result<Vec<Appointment>, EngineError> {
        let mut out = Vec::new();
        for ledger in self.all_ledgers() {
            let guard = ledger.read().await;
            for e in guard.overlapping(&range) {
                if let Record::Appointment(a) = &e.record
                    && location_id.is_none_or(|l| a.location_id == l)
                {
                    out.push(a.clone());
                }
            }
        }
        out.sort_by_key(|a| (a.start_time, a.id));
        Ok(out)
    }

    async fn revision(&self, staff_id: Ulid) -> Result<Revision, EngineError> {
        let Some(ledger) = self.ledgers.get(&staff_id).map(|e| e.value().clone()) else {
            return Ok(0);
        };
        let guard = ledger.read().await;
        Ok(guard.revision())
    }

    async fn create_appointment(
        &self,
        appointment: Appointment,
        read_at: Revision,
    ) -> Result<CommitOutcome<Appointment>, EngineError> {
        let interval = appointment.interval()?;
        let outcome = self
            .insert_record(
                appointment.staff_id,
                interval,
                Record::Appointment(appointment.clone()),
                read_at,
            )
            .await?;
        if outcome.is_committed() {
            committed();
            debug!(id = %appointment.id, staff_id = %appointment.staff_id, "appointment created");
            self.notify.publish(&Event::AppointmentCreated {
                appointment: appointment.clone(),
            });
        }
        Ok(outcome.map(|()| appointment))
    }

    async fn update_appointment(
        &self,
        appointment: Appointment,
        read_at: Revision,
    ) -> Result<CommitOutcome<Appointment>, EngineError> {
        let interval = appointment.interval()?;
        validate_interval(&interval)?;
        let id = appointment.id;
        let old_staff = self.staff_for(&id)?;
        let new_staff = appointment.staff_id;

        let outcome = if old_staff == new_staff {
            let ledger = self.ledger(new_staff);
            let mut guard = ledger.write().await;
            replace_appointment(&mut guard, None, appointment.clone(), interval, read_at)?
        } else {
            let old_ledger = self.ledger(old_staff);
            let new_ledger = self.ledger(new_staff);
            // lock in id order so two crossing moves cannot deadlock
            let (mut old_guard, mut new_guard) = if old_staff < new_staff {
                let o = old_ledger.write().await;
                let n = new_ledger.write().await;
                (o, n)
            } else {
                let n = new_ledger.write().await;
                let o = old_ledger.write().await;
                (o, n)
            };
            let outcome = replace_appointment(
                &mut old_guard,
                Some(&mut *new_guard),
                appointment.clone(),
                interval,
                read_at,
            )?;
            if outcome.is_committed() {
                self.entity_to_staff.insert(id, new_staff);
            }
            outcome
        };

        match outcome {
            CommitOutcome::Committed(before) => {
                committed();
                debug!(%id, staff_id = %new_staff, "appointment updated");
                self.notify.publish(&Event::AppointmentUpdated {
                    before,
                    after: appointment.clone(),
                });
                Ok(CommitOutcome::Committed(appointment))
            }
            CommitOutcome::Stale { staff_id, conflicts } => Ok(stale(staff_id, conflicts)),
        }
    }

    /// Status changes keep the slot. Cancelling always commits; reactivating
    /// is refused while anything else occupies the slot.
    async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<CommitOutcome<Appointment>, EngineError> {
        let staff_id = self.staff_for(&id)?;
        let ledger = self.ledger(staff_id);
        let mut guard = ledger.write().await;
        let before = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        let after = Appointment {
            status,
            ..before.clone()
        };
        let interval = after.interval()?;
        if !before.is_active() && after.is_active() {
            let taken = guard.occupied(&interval, Some(id));
            if !taken.is_empty() {
                return Ok(stale(staff_id, taken));
            }
        }
        guard.remove(id);
        guard.commit(interval, Record::Appointment(after.clone()));
        drop(guard);

        committed();
        debug!(%id, ?status, "appointment status changed");
        self.notify.publish(&Event::AppointmentUpdated {
            before,
            after: after.clone(),
        });
        Ok(CommitOutcome::Committed(after))
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let staff_id = self.staff_for(&id)?;
        let ledger = self.ledger(staff_id);
        let mut guard = ledger.write().await;
        let appointment = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        guard.remove(id);
        drop(guard);
        self.entity_to_staff.remove(&id);

        debug!(%id, "appointment deleted");
        self.notify.publish(&Event::AppointmentDeleted {
            appointment: appointment.clone(),
        });
        Ok(appointment)
    }
}

#[async_trait]
impl BlockStore for InMemoryStore {
    async fn list_blocks(&self, location_id: Option<Ulid>, range: TimeInterval) -> Result<Vec<Block>, EngineError> {
        let mut out = Vec::new();
        for ledger in self.all_ledgers() {
            let guard = ledger.read().await;
            for e in guard.overlapping(&range) {
                if let Record::Block(b) = &e.record
                    && location_id.is_none_or(|l| b.location_id == l)
                {
                    out.push(b.clone());
                }
            }
        }
        out.sort_by_key(|b| (b.start_time, b.id));
        Ok(out)
    }

    async fn create_block(&self, block: Block, read_at: Revision) -> Result<CommitOutcome<Block>, EngineError> {
        check_reason(&block)?;
        let interval = block.interval()?;
        let outcome = self
            .insert_record(block.staff_id, interval, Record::Block(block.clone()), read_at)
            .await?;
        if outcome.is_committed() {
            committed();
            debug!(id = %block.id, staff_id = %block.staff_id, "block created");
            self.notify.publish(&Event::BlockCreated { block: block.clone() });
        }
        Ok(outcome.map(|()| block))
    }

    async fn delete_block(&self, id: Ulid) -> Result<Block, EngineError> {
        let staff_id = self.staff_for(&id)?;
        let ledger = self.ledger(staff_id);
        let mut guard = ledger.write().await;
        let block = guard.block(id).ok_or(EngineError::NotFound(id))?;
        guard.remove(id);
        drop(guard);
        self.entity_to_staff.remove(&id);

        debug!(%id, "block deleted");
        self.notify.publish(&Event::BlockDeleted { block: block.clone() });
        Ok(block)
    }
}
