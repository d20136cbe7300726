use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Weekday};
use chrono_tz::America::Chicago;
use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotwise::clock::{from_wall_clock, WallTime};
use slotwise::engine::{RefreshCoordinator, ViewKey, ViewState};
use slotwise::model::*;
use slotwise::notify::NotifyHub;
use slotwise::scheduler::{BookingOptions, BookingOutcome, Scheduler};
use slotwise::source::*;
use slotwise::store::InMemoryStore;

// ── Test infrastructure ──────────────────────────────────────

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
}

fn at(time: &str) -> Ms {
    from_wall_clock(monday(), time.parse::<WallTime>().unwrap(), Chicago).unwrap()
}

fn appointment(staff_id: Ulid, location_id: Ulid, start: &str, end: &str) -> Appointment {
    Appointment {
        id: Ulid::new(),
        staff_id,
        location_id,
        client_id: Ulid::new(),
        service_id: Ulid::new(),
        start_time: at(start),
        end_time: at(end),
        status: AppointmentStatus::Booked,
        booking_method: BookingMethod::Online,
        room_id: None,
        created_at: 0,
    }
}

struct Env {
    store: Arc<InMemoryStore>,
    scheduler: Arc<Scheduler>,
    location: Ulid,
    alice: Ulid,
    bob: Ulid,
}

async fn start() -> Env {
    let store = Arc::new(InMemoryStore::new(Arc::new(NotifyHub::new())));
    let location = Ulid::new();
    let alice = Ulid::new();
    let bob = Ulid::new();
    let shift = |staff_id| StaffSchedule {
        id: Ulid::new(),
        staff_id,
        location_id: location,
        weekday: Weekday::Mon,
        start_time: "09:00".parse().unwrap(),
        end_time: "17:00".parse().unwrap(),
        valid_from: monday(),
        valid_to: None,
        blocked: false,
    };
    let snapshot = Snapshot {
        schedules: vec![shift(alice), shift(bob)],
        staff: vec![
            StaffMember { id: alice, display_name: "Alice".into() },
            StaffMember { id: bob, display_name: "Bob".into() },
        ],
        ..Default::default()
    };
    assert_ok!(store.seed(&snapshot).await);
    let scheduler = Arc::new(Scheduler::new(store.clone(), Chicago));
    Env {
        store,
        scheduler,
        location,
        alice,
        bob,
    }
}

/// Wait until the coordinator has seen the write.
async fn wait_for(coordinator: &RefreshCoordinator, key: &ViewKey, state: ViewState) {
    for _ in 0..100 {
        if coordinator.state(key) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("view never became {state:?}");
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn write_marks_watched_view_stale_and_refresh_sees_it() {
    let env = start().await;
    let coordinator = Arc::new(RefreshCoordinator::new(Chicago));
    let key = ViewKey {
        location_id: env.location,
        date: monday(),
    };
    coordinator.watch(key);

    let rx = env.store.notify().subscribe_all();
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(rx).await })
    };

    let first = assert_ok!(env.scheduler.refresh(&coordinator, key).await).unwrap();
    assert!(first.layout.is_empty());
    assert_eq!(first.roster.len(), 2);
    assert_eq!(coordinator.state(&key), Some(ViewState::Fresh));

    let booked = assert_ok!(
        env.scheduler
            .book_appointment(appointment(env.bob, env.location, "09:00", "10:00"), BookingOptions::default())
            .await
    );
    assert!(booked.is_booked());
    wait_for(&coordinator, &key, ViewState::Stale).await;

    let second = assert_ok!(env.scheduler.refresh(&coordinator, key).await).unwrap();
    assert_eq!(second.layout.len(), 1);
    assert_eq!(second.layout[0].staff_id, env.bob);
    // only staff with bookings get a column
    assert_eq!(second.layout[0].column_count, 1);

    let another = appointment(env.alice, env.location, "09:00", "10:00");
    assert_ok!(env.scheduler.book_appointment(another, BookingOptions::default()).await);
    wait_for(&coordinator, &key, ViewState::Stale).await;
    let third = assert_ok!(env.scheduler.refresh(&coordinator, key).await).unwrap();
    assert_eq!(third.layout.len(), 2);
    assert_eq!(third.layout[0].staff_id, env.alice);
    assert_eq!(third.layout[1].staff_id, env.bob);

    runner.abort();
}

#[tokio::test]
async fn other_day_writes_leave_view_fresh() {
    let env = start().await;
    let coordinator = RefreshCoordinator::new(Chicago);
    let key = ViewKey {
        location_id: env.location,
        date: monday(),
    };
    coordinator.watch(key);
    assert_ok!(env.scheduler.refresh(&coordinator, key).await);

    let mut next_week = appointment(env.alice, env.location, "09:00", "10:00");
    next_week.start_time += 7 * 86_400_000;
    next_week.end_time += 7 * 86_400_000;
    let mut rx = env.store.notify().subscribe_all();
    assert_ok!(env.scheduler.book_appointment(next_week, BookingOptions::default()).await);

    let event = assert_ok!(rx.recv().await);
    coordinator.on_event(&event);
    assert_eq!(coordinator.state(&key), Some(ViewState::Fresh));
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot_admit_exactly_one() {
    let env = start().await;

    let attempts = (0..8).map(|_| {
        let scheduler = env.scheduler.clone();
        let candidate = appointment(env.alice, env.location, "11:00", "12:00");
        tokio::spawn(async move { scheduler.book_appointment(candidate, BookingOptions::default()).await })
    });
    let results = join_all(attempts).await;

    let mut booked = 0;
    for joined in results {
        let outcome = assert_ok!(assert_ok!(joined));
        match outcome {
            BookingOutcome::Booked(_) => booked += 1,
            BookingOutcome::Rejected(_) | BookingOutcome::Stale { .. } => {}
        }
    }
    assert_eq!(booked, 1);

    let range = TimeInterval::new(at("00:00"), at("23:59"));
    let stored = assert_ok!(env.store.list_appointments(Some(env.location), range).await);
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn stale_commit_is_reported_not_applied() {
    let env = start().await;
    let read_at = assert_ok!(env.store.revision(env.alice).await);

    let winner = appointment(env.alice, env.location, "13:00", "14:00");
    let outcome = assert_ok!(env.store.create_appointment(winner, read_at).await);
    assert!(outcome.is_committed());

    let loser = appointment(env.alice, env.location, "13:30", "14:30");
    let outcome = assert_ok!(env.store.create_appointment(loser.clone(), read_at).await);
    assert_eq!(
        outcome,
        CommitOutcome::Stale {
            staff_id: env.alice,
            conflicts: vec![TimeInterval::new(at("13:00"), at("14:00"))],
        }
    );
    assert_err!(env.store.delete_appointment(loser.id).await);
}

#[tokio::test]
async fn location_channel_only_sees_its_location() {
    let env = start().await;
    let mut here = env.store.notify().subscribe(env.location);
    let elsewhere = Ulid::new();

    let off_site = BookingOptions {
        override_schedule: true,
        ..Default::default()
    };
    assert_ok!(
        env.scheduler
            .book_appointment(appointment(env.bob, elsewhere, "09:00", "10:00"), off_site)
            .await
    );
    let local = appointment(env.bob, env.location, "10:00", "11:00");
    assert_ok!(env.scheduler.book_appointment(local.clone(), BookingOptions::default()).await);

    let event = assert_ok!(here.recv().await);
    assert_eq!(event, Event::AppointmentCreated { appointment: local });
}
