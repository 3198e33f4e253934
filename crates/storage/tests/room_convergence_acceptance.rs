use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use coordinator::{
    CoordinatorError, RoomCodeSource, RoomCoordinator, RoomEvent, RoomWatcher, SharedStore, Stage,
};
use shared::{
    domain::{Phase, PlaceId, RoomCode, SelectedPlace, UserId},
    geo::{AreaPolygon, LatLon},
};
use storage::Storage;

struct ScriptedCodes(Mutex<Vec<&'static str>>);

impl ScriptedCodes {
    fn new(mut codes: Vec<&'static str>) -> Self {
        codes.reverse();
        Self(Mutex::new(codes))
    }
}

impl RoomCodeSource for ScriptedCodes {
    fn next_code(&self) -> RoomCode {
        let next = self.0.lock().unwrap().pop().expect("scripted code");
        RoomCode::parse(next).expect("valid code")
    }
}

async fn coordinator() -> (Arc<Storage>, RoomCoordinator) {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.expect("db"));
    let coordinator = RoomCoordinator::new(storage.clone());
    (storage, coordinator)
}

fn place(id: &str, lat: f64, lon: f64) -> SelectedPlace {
    SelectedPlace {
        id: PlaceId::new(id),
        name: Some(format!("{id} cafe")),
        lat,
        lon,
    }
}

fn small_area() -> AreaPolygon {
    AreaPolygon::new(vec![
        LatLon::new(48.850, 2.340),
        LatLon::new(48.850, 2.350),
        LatLon::new(48.860, 2.350),
        LatLon::new(48.860, 2.340),
    ])
    .expect("area")
}

async fn expect_event(watcher: &mut RoomWatcher) -> RoomEvent {
    tokio::time::timeout(Duration::from_secs(5), watcher.next_event())
        .await
        .expect("event in time")
        .expect("watcher alive")
}

#[tokio::test]
async fn join_is_idempotent_and_fourth_member_is_rejected() {
    let (storage, coordinator) = coordinator().await;
    let owner = storage.login("ana").await.expect("ana");
    let bea = storage.login("bea").await.expect("bea");
    let cyd = storage.login("cyd").await.expect("cyd");
    let dan = storage.login("dan").await.expect("dan");

    let room = coordinator.create_room(owner).await.expect("create");
    coordinator.join_room(&room.code, bea).await.expect("bea joins");
    coordinator
        .join_room(&room.code, bea)
        .await
        .expect("bea joins again");
    coordinator.join_room(&room.code, cyd).await.expect("cyd joins");

    let err = coordinator
        .join_room(&room.code, dan)
        .await
        .expect_err("room full");
    assert!(matches!(err, CoordinatorError::RoomFull { .. }));

    let participants = storage
        .list_participants(&room.code)
        .await
        .expect("participants");
    let ids: Vec<_> = participants.iter().map(|p| p.user_id).collect();
    assert_eq!(ids, vec![owner, bea, cyd]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_never_exceed_capacity() {
    let (storage, coordinator) = coordinator().await;
    for _ in 0..10 {
        let owner = UserId::new_random();
        let code = coordinator.create_room(owner).await.expect("create").code;

        let joins: Vec<_> = (0..5)
            .map(|_| {
                let coordinator = coordinator.clone();
                let code = code.clone();
                tokio::spawn(async move { coordinator.join_room(&code, UserId::new_random()).await })
            })
            .collect();
        let mut joined = 0;
        let mut rejected = 0;
        for join in joins {
            match join.await.expect("join task") {
                Ok(_) => joined += 1,
                Err(CoordinatorError::RoomFull { capacity }) => {
                    assert_eq!(capacity, 3);
                    rejected += 1;
                }
                Err(err) => panic!("unexpected join error: {err}"),
            }
        }

        assert_eq!(joined, 2);
        assert_eq!(rejected, 3);
        assert_eq!(storage.count_participants(&code).await.expect("count"), 3);
    }
}

#[tokio::test]
async fn code_collision_retries_without_overwriting() {
    let (storage, base) = coordinator().await;
    let coordinator =
        base.with_code_source(Arc::new(ScriptedCodes::new(vec!["KEEP22", "KEEP22", "FRESH2"])));
    let first_owner = UserId::new_random();
    let second_owner = UserId::new_random();

    let first = coordinator.create_room(first_owner).await.expect("first");
    let second = coordinator.create_room(second_owner).await.expect("second");

    assert_eq!(first.code.as_str(), "KEEP22");
    assert_eq!(second.code.as_str(), "FRESH2");
    let kept = storage
        .load_room(&first.code)
        .await
        .expect("load")
        .expect("room");
    assert_eq!(kept.owner_id, first_owner);
}

#[tokio::test]
async fn concurrent_begin_planning_transitions_once() {
    let (_storage, coordinator) = coordinator().await;
    let owner = UserId::new_random();
    let code = coordinator.create_room(owner).await.expect("create").code;

    let (a, b) = tokio::join!(
        coordinator.begin_planning(&code, owner),
        coordinator.begin_planning(&code, owner)
    );
    let transitions = [a.expect("first"), b.expect("second")]
        .into_iter()
        .filter(|changed| *changed)
        .count();
    assert_eq!(transitions, 1);
    assert_eq!(
        coordinator.snapshot(&code).await.expect("snapshot").room.phase,
        Phase::AreaSelection
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn laggard_fill_never_replaces_a_concurrent_own_submission() {
    let (storage, coordinator) = coordinator().await;
    for _ in 0..10 {
        let users = [UserId::new_random(), UserId::new_random(), UserId::new_random()];
        let code = coordinator.create_room(users[0]).await.expect("create").code;
        for user in &users[1..] {
            coordinator.join_room(&code, *user).await.expect("join");
        }

        let picks = [place("a1", 48.851, 2.341), place("b1", 48.852, 2.342)];
        let submissions: Vec<_> = picks
            .iter()
            .zip(users)
            .map(|(pick, user)| {
                let coordinator = coordinator.clone();
                let code = code.clone();
                let pick = pick.clone();
                tokio::spawn(async move { coordinator.submit_selection(&code, user, &[pick]).await })
            })
            .collect();
        for submission in submissions {
            submission.await.expect("submit task").expect("submit");
        }

        let selections = storage.list_selections(&code).await.expect("selections");
        assert_eq!(selections.len(), 3);
        let places_of = |user: UserId| {
            selections
                .iter()
                .find(|s| s.user_id == user)
                .map(|s| s.places.clone())
                .expect("selection row")
        };
        assert_eq!(places_of(users[0]), vec![picks[0].clone()]);
        assert_eq!(places_of(users[1]), vec![picks[1].clone()]);
        let filled = places_of(users[2]);
        assert!(filled == vec![picks[0].clone()] || filled == vec![picks[1].clone()]);

        let readiness = coordinator.compute_readiness(&code).await.expect("readiness");
        assert!(readiness.all_ready);
    }
}

#[tokio::test]
async fn laggards_become_ready_after_one_submission() {
    let (_storage, coordinator) = coordinator().await;
    let users = [UserId::new_random(), UserId::new_random(), UserId::new_random()];
    let code = coordinator.create_room(users[0]).await.expect("create").code;
    for user in &users[1..] {
        coordinator.join_room(&code, *user).await.expect("join");
    }

    let before = coordinator.compute_readiness(&code).await.expect("readiness");
    assert!(!before.all_ready);

    coordinator
        .submit_selection(&code, users[0], &[place("louvre", 48.861, 2.336)])
        .await
        .expect("submit");
    let after = coordinator.compute_readiness(&code).await.expect("readiness");
    assert_eq!((after.ready_count, after.total_count), (3, 3));
    assert!(after.all_ready);
}

#[tokio::test]
async fn unanimous_winner_follows_vote_changes() {
    let (_storage, coordinator) = coordinator().await;
    let users = [UserId::new_random(), UserId::new_random(), UserId::new_random()];
    let code = coordinator.create_room(users[0]).await.expect("create").code;
    for user in &users[1..] {
        coordinator.join_room(&code, *user).await.expect("join");
    }
    coordinator
        .submit_selection(
            &code,
            users[0],
            &[place("p1", 48.85, 2.34), place("p2", 48.86, 2.35)],
        )
        .await
        .expect("submit");

    let p1 = PlaceId::new("p1");
    let p2 = PlaceId::new("p2");
    coordinator.cast_vote(&code, users[0], &p1).await.expect("vote a");
    coordinator.cast_vote(&code, users[1], &p1).await.expect("vote b");
    coordinator.cast_vote(&code, users[2], &p2).await.expect("vote c");
    assert_eq!(coordinator.resolve_winner(&code).await.expect("winner"), None);

    coordinator.cast_vote(&code, users[2], &p1).await.expect("change c");
    assert_eq!(
        coordinator.resolve_winner(&code).await.expect("winner"),
        Some(p1)
    );
}

#[tokio::test]
async fn debounced_drag_writes_only_the_final_polygon() {
    let (storage, coordinator) = coordinator().await;
    let owner = UserId::new_random();
    let code = coordinator.create_room(owner).await.expect("create").code;
    let mut changes = storage.changes();

    let editor = coordinator.area_editor(code.clone(), owner);
    let mut ring = small_area().points().to_vec();
    for step in 0..5 {
        ring[2] = LatLon::new(48.860 - step as f64 * 0.001, 2.350);
        editor
            .set_area_polygon(AreaPolygon::new(ring.clone()).expect("ring"))
            .expect("within limit");
    }
    editor.finish().await;

    let room = storage.load_room(&code).await.expect("load").expect("room");
    assert_eq!(room.area, Some(AreaPolygon::new(ring).expect("ring")));

    let mut room_writes = 0;
    while let Ok(signal) = changes.try_recv() {
        if signal.table == shared::protocol::StoreTable::Rooms {
            room_writes += 1;
        }
    }
    assert_eq!(room_writes, 1);
}

#[tokio::test]
async fn clients_converge_through_change_signals() {
    let (storage, coordinator) = coordinator().await;
    let ana = storage.login("ana").await.expect("ana");
    let bea = storage.login("bea").await.expect("bea");
    let code = coordinator.create_room(ana).await.expect("create").code;
    coordinator.join_room(&code, bea).await.expect("join");

    let mut ana_view = RoomWatcher::spawn(coordinator.clone(), code.clone());
    let mut bea_view = RoomWatcher::spawn(coordinator.clone(), code.clone());
    for view in [&mut ana_view, &mut bea_view] {
        assert_eq!(expect_event(view).await, RoomEvent::StageChanged(Stage::Lobby));
    }

    coordinator.begin_planning(&code, ana).await.expect("begin");
    coordinator
        .write_area_polygon(&code, ana, &small_area())
        .await
        .expect("area");
    coordinator.confirm_area(&code, ana).await.expect("confirm");
    coordinator
        .submit_selection(&code, bea, &[place("p1", 48.855, 2.345)])
        .await
        .expect("select");

    for view in [&mut ana_view, &mut bea_view] {
        let mut stage = expect_event(view).await;
        while stage != RoomEvent::StageChanged(Stage::Vote) {
            stage = expect_event(view).await;
        }
    }

    let p1 = PlaceId::new("p1");
    coordinator.cast_vote(&code, ana, &p1).await.expect("ana votes");
    coordinator.cast_vote(&code, bea, &p1).await.expect("bea votes");
    for view in [&mut ana_view, &mut bea_view] {
        assert_eq!(
            expect_event(view).await,
            RoomEvent::StageChanged(Stage::Decided(p1.clone()))
        );
    }

    let room = storage.load_room(&code).await.expect("load").expect("room");
    assert_eq!(room.phase, Phase::Resolved);

    ana_view.shutdown().await;
    bea_view.shutdown().await;
}
