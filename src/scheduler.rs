use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::{dates_touched, day_bounds};
use crate::engine::*;
use crate::limits::*;
use crate::model::*;
use crate::source::*;

/// Extra rules for one booking write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingOptions {
    pub room: Option<RoomRule>,
    /// Manager override of the working-hours check.
    pub override_schedule: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome<T> {
    Booked(T),
    Rejected(Rejection),
    /// Every attempt lost to a concurrent intersecting write.
    Stale {
        staff_id: Ulid,
        attempts: u32,
        conflicts: Vec<TimeInterval>,
    },
}

impl<T> BookingOutcome<T> {
    pub fn is_booked(&self) -> bool {
        matches!(self, BookingOutcome::Booked(_))
    }

    /// Rejections stay values; running out of retries becomes
    /// `EngineError::StaleWrite`.
    pub fn into_result(self) -> Result<Result<T, Rejection>, EngineError> {
        match self {
            BookingOutcome::Booked(v) => Ok(Ok(v)),
            BookingOutcome::Rejected(r) => Ok(Err(r)),
            BookingOutcome::Stale { staff_id, attempts, .. } => Err(EngineError::StaleWrite { staff_id, attempts }),
        }
    }
}

/// Async front of the engine: fetches what a call needs through the storage
/// traits, runs the pure engine on it, and commits writes with
/// compare-and-set.
pub struct Scheduler {
    roster: Arc<dyn RosterSource>,
    bookings: Arc<dyn BookingStore>,
    blocks: Arc<dyn BlockStore>,
    identity: Arc<dyn IdentitySource>,
    tz: Tz,
    layout: LayoutConfig,
}

impl Scheduler {
    pub fn new<S>(store: Arc<S>, tz: Tz) -> Self
    where
        S: RosterSource + BookingStore + BlockStore + IdentitySource + 'static,
    {
        Self {
            roster: store.clone(),
            bookings: store.clone(),
            blocks: store.clone(),
            identity: store,
            tz,
            layout: LayoutConfig::default(),
        }
    }

    pub fn from_parts(
        roster: Arc<dyn RosterSource>,
        bookings: Arc<dyn BookingStore>,
        blocks: Arc<dyn BlockStore>,
        identity: Arc<dyn IdentitySource>,
        tz: Tz,
    ) -> Self {
        Self {
            roster,
            bookings,
            blocks,
            identity,
            tz,
            layout: LayoutConfig::default(),
        }
    }

    pub fn with_layout(mut self, layout: LayoutConfig) -> Self {
        self.layout = layout;
        self
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Everything intersecting `window`, every location. Busy time elsewhere
    /// and blocked schedules anywhere still count against a staff member.
    async fn fetch(&self, window: TimeInterval) -> Result<Snapshot, EngineError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let (schedules, appointments, blocks, staff) = futures::try_join!(
            self.roster.list_schedules(None),
            self.bookings.list_appointments(None, window),
            self.blocks.list_blocks(None, window),
            self.identity.list_staff(),
        )?;
        debug!(
            schedules = schedules.len(),
            appointments = appointments.len(),
            blocks = blocks.len(),
            "snapshot fetched"
        );
        Ok(Snapshot {
            schedules,
            appointments,
            blocks,
            staff,
        })
    }

    fn window_for(&self, interval: &TimeInterval) -> Result<TimeInterval, EngineError> {
        validate_interval(interval)?;
        let dates = dates_touched(interval, self.tz)?;
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Err(EngineError::InvalidInterval {
                start: interval.start,
                end: interval.end,
            });
        };
        TimeInterval::try_new(day_bounds(*first, self.tz)?.start, day_bounds(*last, self.tz)?.end)
    }

    fn engine<'a>(&self, snapshot: &'a Snapshot) -> Engine<'a> {
        Engine::new(snapshot, self.tz).with_layout(self.layout)
    }

    /// Full recompute of one location calendar.
    pub async fn load_day(&self, location_id: Ulid, date: NaiveDate) -> Result<DayView, EngineError> {
        let snapshot = self.fetch(day_bounds(date, self.tz)?).await?;
        self.engine(&snapshot).day_view(location_id, date)
    }

    pub async fn availability(
        &self,
        staff_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
    ) -> Result<Availability, EngineError> {
        let snapshot = self.fetch(day_bounds(date, self.tz)?).await?;
        self.engine(&snapshot).compute_availability(staff_id, location_id, date)
    }

    pub async fn bookable_slots(
        &self,
        staff_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
        step_ms: Ms,
        duration_ms: Ms,
    ) -> Result<Vec<TimeInterval>, EngineError> {
        let snapshot = self.fetch(day_bounds(date, self.tz)?).await?;
        self.engine(&snapshot)
            .bookable_slots(staff_id, location_id, date, step_ms, duration_ms)
    }

    pub async fn available_dates(
        &self,
        staff_id: Ulid,
        location_id: Ulid,
        from: NaiveDate,
        days: u32,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        let schedules = self.roster.list_schedules(Some(location_id)).await?;
        available_dates(&schedules, staff_id, location_id, from, days)
    }

    /// Recompute a stale view. `Ok(None)` when the view was not stale or a
    /// write landed during the recompute; the view then stays stale.
    pub async fn refresh(
        &self,
        coordinator: &RefreshCoordinator,
        key: ViewKey,
    ) -> Result<Option<DayView>, EngineError> {
        let Some(ticket) = coordinator.begin_refresh(&key) else {
            return Ok(None);
        };
        let view = match self.load_day(key.location_id, key.date).await {
            Ok(view) => view,
            Err(e) => {
                coordinator.abort_refresh(ticket);
                return Err(e);
            }
        };
        let mut shown = view.roster.clone();
        shown.extend(view.layout.iter().map(|b| b.staff_id));
        shown.sort();
        shown.dedup();
        Ok(coordinator.complete_refresh(ticket, shown).then_some(view))
    }

    pub async fn book_appointment(
        &self,
        appointment: Appointment,
        options: BookingOptions,
    ) -> Result<BookingOutcome<Appointment>, EngineError> {
        let request = request_for(
            appointment.staff_id,
            appointment.location_id,
            appointment.interval()?,
            None,
            options,
        );
        let bookings = &self.bookings;
        self.commit_with_retry(request, move |read_at| {
            bookings.create_appointment(appointment.clone(), read_at)
        })
        .await
    }

    /// Move or edit an existing appointment. Its current slot does not count
    /// against the new one.
    pub async fn reschedule_appointment(
        &self,
        appointment: Appointment,
        options: BookingOptions,
    ) -> Result<BookingOutcome<Appointment>, EngineError> {
        let request = request_for(
            appointment.staff_id,
            appointment.location_id,
            appointment.interval()?,
            Some(appointment.id),
            options,
        );
        let bookings = &self.bookings;
        self.commit_with_retry(request, move |read_at| {
            bookings.update_appointment(appointment.clone(), read_at)
        })
        .await
    }

    pub async fn place_block(
        &self,
        block: Block,
        options: BookingOptions,
    ) -> Result<BookingOutcome<Block>, EngineError> {
        let request = request_for(block.staff_id, block.location_id, block.interval()?, None, options);
        let blocks = &self.blocks;
        self.commit_with_retry(request, move |read_at| blocks.create_block(block.clone(), read_at))
            .await
    }

    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        match self
            .bookings
            .set_appointment_status(id, AppointmentStatus::Cancelled)
            .await?
        {
            CommitOutcome::Committed(a) => Ok(a),
            CommitOutcome::Stale { staff_id, .. } => Err(EngineError::StaleWrite { staff_id, attempts: 1 }),
        }
    }

    /// Bring a cancelled appointment back. Refused while its slot is taken.
    pub async fn restore_appointment(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<CommitOutcome<Appointment>, EngineError> {
        if status == AppointmentStatus::Cancelled {
            return Err(EngineError::LimitExceeded("restore needs an active status"));
        }
        self.bookings.set_appointment_status(id, status).await
    }

    /// read revision -> fetch -> validate -> commit, repeated while the
    /// commit comes back stale.
    async fn commit_with_retry<T, F, Fut>(
        &self,
        request: BookingRequest,
        mut commit: F,
    ) -> Result<BookingOutcome<T>, EngineError>
    where
        F: FnMut(Revision) -> Fut,
        Fut: Future<Output = Result<CommitOutcome<T>, EngineError>>,
    {
        let window = self.window_for(&request.interval)?;
        let mut conflicts = Vec::new();

        for attempt in 1..=MAX_COMMIT_RETRIES {
            let read_at = self.bookings.revision(request.staff_id).await?;
            let snapshot = self.fetch(window).await?;
            match self.engine(&snapshot).validate_booking(&request)? {
                Validation::Accepted => {}
                Validation::Rejected(rejection) => {
                    warn!(
                        staff_id = %request.staff_id,
                        reason = rejection.reason.as_str(),
                        "booking rejected"
                    );
                    return Ok(BookingOutcome::Rejected(rejection));
                }
            }

            match commit(read_at).await? {
                CommitOutcome::Committed(value) => {
                    info!(
                        staff_id = %request.staff_id,
                        start = request.interval.start,
                        end = request.interval.end,
                        attempt,
                        "booking committed"
                    );
                    return Ok(BookingOutcome::Booked(value));
                }
                CommitOutcome::Stale { conflicts: c, .. } => {
                    warn!(staff_id = %request.staff_id, attempt, "commit went stale, retrying");
                    conflicts = c;
                }
            }
        }

        Ok(BookingOutcome::Stale {
            staff_id: request.staff_id,
            attempts: MAX_COMMIT_RETRIES,
            conflicts,
        })
    }
}

fn request_for(
    staff_id: Ulid,
    location_id: Ulid,
    interval: TimeInterval,
    exclude: Option<Ulid>,
    options: BookingOptions,
) -> BookingRequest {
    BookingRequest {
        staff_id,
        location_id,
        interval,
        exclude,
        room: options.room,
        override_schedule: options.override_schedule,
    }
}
