//! Change log properties under concurrent writers on a file-backed database.

use chrono::Utc;
use marksync_core::config::StorageConfig;
use marksync_core::{Address, ChangeId, ChangeKind, KindClasses, ProjectName, UserName};
use marksync_store::Store;
use tempfile::TempDir;

async fn open(tmp: &TempDir) -> Store {
    Store::open(
        &tmp.path().join("marksync.db"),
        &StorageConfig::default(),
        KindClasses::default(),
    )
    .await
    .expect("open store")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_leave_one_live_record_per_class() {
    let tmp = TempDir::new().expect("tmp");
    let store = open(&tmp).await;
    let project = store
        .create_project(&ProjectName::from("firmware"))
        .await
        .expect("create");

    let mut tasks = Vec::new();
    for writer in 0..8u64 {
        let store = store.clone();
        let project = project.clone();
        tasks.push(tokio::spawn(async move {
            let user = UserName(format!("user{writer}"));
            for round in 0..10u64 {
                let kind = if (writer + round) % 2 == 0 {
                    ChangeKind::CommentRegular
                } else {
                    ChangeKind::CommentRepeatable
                };
                store
                    .append(
                        &project,
                        &user,
                        kind,
                        Address(0x0040_1000),
                        &format!("w{writer}r{round}"),
                        Utc::now(),
                    )
                    .await
                    .expect("append");
                store
                    .append(
                        &project,
                        &user,
                        ChangeKind::Name,
                        Address(0x0040_1000),
                        &format!("n{writer}*r{round}"),
                        Utc::now(),
                    )
                    .await
                    .expect("append name");
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    let live = store.live_records(&project).await.expect("list");
    let comments = live
        .iter()
        .filter(|r| matches!(r.kind, ChangeKind::CommentRegular | ChangeKind::CommentRepeatable))
        .count();
    let names = live.iter().filter(|r| r.kind == ChangeKind::Name).count();
    assert_eq!(comments, 1, "live: {live:?}");
    assert_eq!(names, 1, "live: {live:?}");

    // 8 writers x 10 rounds x 2 appends; the newest id always survives.
    assert_eq!(live.iter().map(|r| r.id.get()).max(), Some(160));
}

#[tokio::test]
async fn list_since_is_strictly_increasing_and_resumable() {
    let tmp = TempDir::new().expect("tmp");
    let store = open(&tmp).await;
    let project = store
        .create_project(&ProjectName::from("firmware"))
        .await
        .expect("create");
    let user = UserName::from("alice");

    for addr in 0..8u64 {
        store
            .append(&project, &user, ChangeKind::Name, Address(addr), "a*b", Utc::now())
            .await
            .expect("append");
    }

    let all = store.list_since(&project, ChangeId::ZERO).await.expect("list");
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));

    store.set_cursor(&project, &user, ChangeId(5)).await.expect("cursor");
    let cursor = store.cursor(&project, &user).await.expect("cursor").expect("set");
    let rest: Vec<u64> = store
        .list_since(&project, cursor)
        .await
        .expect("list")
        .iter()
        .map(|r| r.id.get())
        .collect();
    assert_eq!(rest, [6, 7, 8]);
}

#[tokio::test]
async fn data_survives_reopen() {
    let tmp = TempDir::new().expect("tmp");
    {
        let store = open(&tmp).await;
        let project = store
            .create_project(&ProjectName::from("firmware"))
            .await
            .expect("create");
        store
            .append(
                &project,
                &UserName::from("alice"),
                ChangeKind::CommentRegular,
                Address(0x10),
                "persisted",
                Utc::now(),
            )
            .await
            .expect("append");
        store.close().await;
    }

    let store = open(&tmp).await;
    let project = store
        .find_project(&ProjectName::from("firmware"))
        .await
        .expect("find")
        .expect("exists");
    let live = store.live_records(&project).await.expect("list");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].payload, "persisted");
}
