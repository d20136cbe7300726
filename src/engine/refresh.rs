use chrono::NaiveDate;
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::dates_touched;
use crate::model::*;

use super::EngineError;

/// One displayed calendar: a location on a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ViewKey {
    pub location_id: Ulid,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    Fresh,
    Stale,
    Refreshing,
}

/// Proof that a refresh started at a given generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    pub key: ViewKey,
    generation: u64,
}

struct View {
    state: ViewState,
    generation: u64,
    /// Staff shown at the last completed refresh.
    staff_ids: Vec<Ulid>,
}

impl View {
    /// A running refresh keeps its claim; the bumped generation sends it back
    /// to `Stale` when it completes.
    fn invalidate(&mut self) {
        self.generation += 1;
        if self.state != ViewState::Refreshing {
            self.state = ViewState::Stale;
        }
    }
}

/// Tracks `Fresh -> Stale -> Refreshing -> Fresh` for every watched view.
///
/// A write that lands while a refresh is running bumps the generation, so the
/// refresh completes into `Stale` and the view is recomputed again.
pub struct RefreshCoordinator {
    tz: Tz,
    views: DashMap<ViewKey, View>,
}

impl RefreshCoordinator {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            views: DashMap::new(),
        }
    }

    /// Start tracking a view. New views need a first refresh.
    pub fn watch(&self, key: ViewKey) {
        self.views.entry(key).or_insert_with(|| View {
            state: ViewState::Stale,
            generation: 0,
            staff_ids: Vec::new(),
        });
        self.publish_gauge();
    }

    pub fn unwatch(&self, key: &ViewKey) {
        self.views.remove(key);
        self.publish_gauge();
    }

    pub fn state(&self, key: &ViewKey) -> Option<ViewState> {
        self.views.get(key).map(|v| v.state)
    }

    /// Views waiting for a refresh, sorted.
    pub fn stale_views(&self) -> Vec<ViewKey> {
        let mut keys: Vec<ViewKey> = self
            .views
            .iter()
            .filter(|v| v.state == ViewState::Stale)
            .map(|v| *v.key())
            .collect();
        keys.sort();
        keys
    }

    /// Mark every view the write may have changed. Returns how many.
    pub fn on_event(&self, event: &Event) -> usize {
        let mut marked = 0;
        for mut entry in self.views.iter_mut() {
            let key = *entry.key();
            if affects(event, &key, &entry.staff_ids, self.tz) {
                entry.value_mut().invalidate();
                marked += 1;
            }
        }
        if marked > 0 {
            debug!(marked, "views marked stale");
            self.publish_gauge();
        }
        marked
    }

    /// Used when events may have been missed.
    pub fn mark_all_stale(&self) {
        for mut entry in self.views.iter_mut() {
            entry.value_mut().invalidate();
        }
        self.publish_gauge();
    }

    /// `Stale -> Refreshing`. `None` when the view is unknown, already fresh,
    /// or another refresh holds it.
    pub fn begin_refresh(&self, key: &ViewKey) -> Option<RefreshTicket> {
        let mut view = self.views.get_mut(key)?;
        if view.state != ViewState::Stale {
            return None;
        }
        view.state = ViewState::Refreshing;
        let ticket = RefreshTicket {
            key: *key,
            generation: view.generation,
        };
        drop(view);
        self.publish_gauge();
        Some(ticket)
    }

    /// `Refreshing -> Fresh`, unless a write arrived after the ticket was
    /// issued. Returns whether the view is now fresh.
    pub fn complete_refresh(&self, ticket: RefreshTicket, staff_ids: Vec<Ulid>) -> bool {
        let Some(mut view) = self.views.get_mut(&ticket.key) else {
            return false;
        };
        // keep the staff list either way; it is the best knowledge of who
        // the view shows
        view.staff_ids = staff_ids;
        let fresh = view.state == ViewState::Refreshing && view.generation == ticket.generation;
        if fresh {
            view.state = ViewState::Fresh;
        } else {
            view.state = ViewState::Stale;
        }
        drop(view);

        if fresh {
            metrics::counter!(crate::observability::RECOMPUTES_TOTAL).increment(1);
            info!(location_id = %ticket.key.location_id, date = %ticket.key.date, "view refreshed");
        } else {
            debug!(location_id = %ticket.key.location_id, date = %ticket.key.date, "view changed during refresh");
        }
        self.publish_gauge();
        fresh
    }

    /// Give a ticket back after a failed recompute.
    pub fn abort_refresh(&self, ticket: RefreshTicket) {
        if let Some(mut view) = self.views.get_mut(&ticket.key)
            && view.state == ViewState::Refreshing
        {
            view.state = ViewState::Stale;
        }
        self.publish_gauge();
    }

    /// Consume a write stream until it closes.
    pub async fn run(&self, mut rx: broadcast::Receiver<Event>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    self.on_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "refresh coordinator lagged, marking every view stale");
                    self.mark_all_stale();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn publish_gauge(&self) {
        let stale = self
            .views
            .iter()
            .filter(|v| v.state == ViewState::Stale)
            .count();
        metrics::gauge!(crate::observability::VIEWS_STALE).set(stale as f64);
    }
}

fn interval_on(interval: Result<TimeInterval, EngineError>, date: NaiveDate, tz: Tz) -> bool {
    // a record we cannot place is treated as touching every date
    match interval.and_then(|i| dates_touched(&i, tz)) {
        Ok(dates) => dates.contains(&date),
        Err(_) => true,
    }
}

fn affects(event: &Event, key: &ViewKey, shown: &[Ulid], tz: Tz) -> bool {
    let on_date = match event {
        Event::AppointmentCreated { appointment } | Event::AppointmentDeleted { appointment } => {
            interval_on(appointment.interval(), key.date, tz)
        }
        Event::AppointmentUpdated { before, after } => {
            interval_on(before.interval(), key.date, tz) || interval_on(after.interval(), key.date, tz)
        }
        Event::BlockCreated { block } | Event::BlockDeleted { block } => {
            interval_on(block.interval(), key.date, tz)
        }
        Event::ScheduleUpserted { before, after } => {
            after.is_active_on(key.date) || before.as_ref().is_some_and(|s| s.is_active_on(key.date))
        }
        Event::ScheduleDeleted { schedule } => schedule.is_active_on(key.date),
    };
    if !on_date {
        return false;
    }

    let blocked_schedule = match event {
        Event::ScheduleUpserted { before, after } => {
            after.blocked || before.as_ref().is_some_and(|s| s.blocked)
        }
        Event::ScheduleDeleted { schedule } => schedule.blocked,
        _ => false,
    };
    blocked_schedule
        || event.location_ids().contains(&key.location_id)
        || event.staff_ids().iter().any(|s| shown.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_wall_clock, WallTime};
    use chrono::Weekday;
    use chrono_tz::UTC;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
    }

    fn at(date: NaiveDate, time: &str) -> Ms {
        from_wall_clock(date, time.parse::<WallTime>().unwrap(), UTC).unwrap()
    }

    fn appointment(staff_id: Ulid, location_id: Ulid, date: NaiveDate) -> Appointment {
        Appointment {
            id: Ulid::new(),
            staff_id,
            location_id,
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            start_time: at(date, "10:00"),
            end_time: at(date, "11:00"),
            status: AppointmentStatus::Booked,
            booking_method: BookingMethod::Online,
            room_id: None,
            created_at: 0,
        }
    }

    fn fresh_view(c: &RefreshCoordinator, key: ViewKey, staff: Vec<Ulid>) {
        c.watch(key);
        let ticket = c.begin_refresh(&key).unwrap();
        assert!(c.complete_refresh(ticket, staff));
        assert_eq!(c.state(&key), Some(ViewState::Fresh));
    }

    #[test]
    fn lifecycle() {
        let c = RefreshCoordinator::new(UTC);
        let key = ViewKey { location_id: Ulid::new(), date: monday() };
        c.watch(key);
        assert_eq!(c.state(&key), Some(ViewState::Stale));
        assert_eq!(c.stale_views(), vec![key]);

        let ticket = c.begin_refresh(&key).unwrap();
        assert_eq!(c.state(&key), Some(ViewState::Refreshing));
        assert!(c.begin_refresh(&key).is_none());

        assert!(c.complete_refresh(ticket, vec![]));
        assert_eq!(c.state(&key), Some(ViewState::Fresh));
        assert!(c.begin_refresh(&key).is_none());
    }

    #[test]
    fn write_at_view_location_and_date_marks_stale() {
        let c = RefreshCoordinator::new(UTC);
        let loc = Ulid::new();
        let key = ViewKey { location_id: loc, date: monday() };
        fresh_view(&c, key, vec![]);

        let other_day = appointment(Ulid::new(), loc, monday().succ_opt().unwrap());
        assert_eq!(c.on_event(&Event::AppointmentCreated { appointment: other_day }), 0);
        assert_eq!(c.state(&key), Some(ViewState::Fresh));

        let same_day = appointment(Ulid::new(), loc, monday());
        assert_eq!(c.on_event(&Event::AppointmentCreated { appointment: same_day }), 1);
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[test]
    fn shown_staff_busy_elsewhere_marks_stale() {
        let c = RefreshCoordinator::new(UTC);
        let staff = Ulid::new();
        let key = ViewKey { location_id: Ulid::new(), date: monday() };
        fresh_view(&c, key, vec![staff]);

        let elsewhere = appointment(staff, Ulid::new(), monday());
        c.on_event(&Event::AppointmentCreated { appointment: elsewhere });
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[test]
    fn unrelated_write_leaves_view_fresh() {
        let c = RefreshCoordinator::new(UTC);
        let key = ViewKey { location_id: Ulid::new(), date: monday() };
        fresh_view(&c, key, vec![Ulid::new()]);

        let unrelated = appointment(Ulid::new(), Ulid::new(), monday());
        c.on_event(&Event::AppointmentCreated { appointment: unrelated });
        assert_eq!(c.state(&key), Some(ViewState::Fresh));
    }

    #[test]
    fn move_away_from_view_marks_stale() {
        let c = RefreshCoordinator::new(UTC);
        let loc = Ulid::new();
        let key = ViewKey { location_id: loc, date: monday() };
        fresh_view(&c, key, vec![]);

        let before = appointment(Ulid::new(), loc, monday());
        let mut after = before.clone();
        after.location_id = Ulid::new();
        after.start_time += 7 * 86_400_000;
        after.end_time += 7 * 86_400_000;
        c.on_event(&Event::AppointmentUpdated { before, after });
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[test]
    fn schedule_change_matches_by_weekday() {
        let c = RefreshCoordinator::new(UTC);
        let loc = Ulid::new();
        let key = ViewKey { location_id: loc, date: monday() };
        fresh_view(&c, key, vec![]);

        let mut schedule = StaffSchedule {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            location_id: loc,
            weekday: Weekday::Tue,
            start_time: "09:00".parse().unwrap(),
            end_time: "17:00".parse().unwrap(),
            valid_from: monday(),
            valid_to: None,
            blocked: false,
        };
        c.on_event(&Event::ScheduleUpserted { before: None, after: schedule.clone() });
        assert_eq!(c.state(&key), Some(ViewState::Fresh));

        schedule.weekday = Weekday::Mon;
        c.on_event(&Event::ScheduleUpserted { before: None, after: schedule });
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[test]
    fn blocked_schedule_reaches_every_location() {
        let c = RefreshCoordinator::new(UTC);
        let key = ViewKey { location_id: Ulid::new(), date: monday() };
        fresh_view(&c, key, vec![]);

        let schedule = StaffSchedule {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            location_id: Ulid::new(),
            weekday: Weekday::Mon,
            start_time: "12:00".parse().unwrap(),
            end_time: "13:00".parse().unwrap(),
            valid_from: monday(),
            valid_to: None,
            blocked: true,
        };
        c.on_event(&Event::ScheduleDeleted { schedule });
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[test]
    fn write_during_refresh_forces_another_pass() {
        let c = RefreshCoordinator::new(UTC);
        let loc = Ulid::new();
        let key = ViewKey { location_id: loc, date: monday() };
        c.watch(key);

        let ticket = c.begin_refresh(&key).unwrap();
        c.on_event(&Event::AppointmentCreated {
            appointment: appointment(Ulid::new(), loc, monday()),
        });
        // the running refresh keeps the view; no second one may start
        assert_eq!(c.state(&key), Some(ViewState::Refreshing));
        assert!(c.begin_refresh(&key).is_none());
        c.mark_all_stale();
        assert!(c.begin_refresh(&key).is_none());

        assert!(!c.complete_refresh(ticket, vec![]));
        assert_eq!(c.state(&key), Some(ViewState::Stale));

        let retry = c.begin_refresh(&key).unwrap();
        assert!(c.complete_refresh(retry, vec![]));
    }

    #[test]
    fn aborted_refresh_returns_to_stale() {
        let c = RefreshCoordinator::new(UTC);
        let key = ViewKey { location_id: Ulid::new(), date: monday() };
        c.watch(key);
        let ticket = c.begin_refresh(&key).unwrap();
        c.abort_refresh(ticket);
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[tokio::test]
    async fn run_consumes_until_closed() {
        let c = RefreshCoordinator::new(UTC);
        let loc = Ulid::new();
        let key = ViewKey { location_id: loc, date: monday() };
        fresh_view(&c, key, vec![]);

        let (tx, rx) = broadcast::channel(4);
        tx.send(Event::AppointmentCreated {
            appointment: appointment(Ulid::new(), loc, monday()),
        })
        .unwrap();
        drop(tx);
        c.run(rx).await;
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }

    #[tokio::test]
    async fn lagged_receiver_marks_everything_stale() {
        let c = RefreshCoordinator::new(UTC);
        let key = ViewKey { location_id: Ulid::new(), date: monday() };
        fresh_view(&c, key, vec![]);

        let (tx, rx) = broadcast::channel(1);
        for _ in 0..3 {
            // unrelated writes; only the lag should matter
            tx.send(Event::AppointmentCreated {
                appointment: appointment(Ulid::new(), Ulid::new(), monday()),
            })
            .unwrap();
        }
        drop(tx);
        c.run(rx).await;
        assert_eq!(c.state(&key), Some(ViewState::Stale));
    }
}
