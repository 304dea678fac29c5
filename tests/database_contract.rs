//! Storage contract, run against every linked backend through the router

use std::cell::RefCell;
use std::collections::HashSet;
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, TimeZone, Utc};
use recstore::data::{
    Feedback, FeedbackFilter, FeedbackInsert, FeedbackKey, Item, ItemFilter, ItemPatch, User,
    UserPatch,
};
use recstore::{open_database, Backend, Database, StorageConfig, StorageError};
use tempfile::TempDir;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Run `check` against a fresh SQLite file and a fresh in-memory store
fn each_backend(check: impl Fn(&Backend)) {
    let temp = TempDir::new().unwrap();
    let sqlite = format!("sqlite://{}", temp.path().join("data.db").display());
    for descriptor in [sqlite.as_str(), "memory://"] {
        let db = open_database(descriptor, "", &StorageConfig::default()).unwrap();
        db.init().unwrap();
        check(&db);
        db.close().unwrap();
    }
}

fn ids<T>(rows: &[T], id: impl Fn(&T) -> &str) -> Vec<String> {
    rows.iter().map(|r| id(r).to_string()).collect()
}

#[test]
fn test_missing_ids_not_found_and_delete_idempotent() {
    each_backend(|db| {
        let err = db.get_user("ghost").unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", db.backend_name());
        assert_eq!(err.to_string(), "ghost: user not found");
        assert!(db.get_item("ghost").unwrap_err().is_not_found());

        db.delete_user("ghost").unwrap();
        db.delete_item("ghost").unwrap();
        assert_eq!(db.delete_user_item_feedback("ghost", "ghost", &[]).unwrap(), 0);
    });
}

#[test]
fn test_empty_ids_are_invalid() {
    each_backend(|db| {
        assert!(matches!(db.get_user(""), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(
            db.batch_insert_items(&[Item::new("", ts(0))]),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(db.get_users("", 0), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(
            db.get_user_stream(0),
            Err(StorageError::InvalidArgument(_))
        ));
    });
}

#[test]
fn test_insert_then_get_round_trip() {
    each_backend(|db| {
        let user = User {
            user_id: "u1".into(),
            labels: vec!["a".into(), "b".into()],
            subscribe: vec!["news".into()],
            comment: "first".into(),
        };
        let mut item = Item::new("i1", ts(1_660_459_054));
        item.categories = vec!["books".into()];
        item.labels = vec!["x".into()];
        item.comment = "an item".into();

        db.batch_insert_users(std::slice::from_ref(&user)).unwrap();
        db.batch_insert_items(std::slice::from_ref(&item)).unwrap();
        assert_eq!(db.get_user("u1").unwrap(), user);
        assert_eq!(db.get_item("i1").unwrap(), item);

        // upsert replaces
        let mut replaced = item.clone();
        replaced.comment = "replaced".into();
        db.batch_insert_items(std::slice::from_ref(&replaced)).unwrap();
        assert_eq!(db.get_item("i1").unwrap(), replaced);
    });
}

#[test]
fn test_sets_deduplicated_on_write() {
    each_backend(|db| {
        let user = User {
            user_id: "u".into(),
            labels: vec!["a".into(), "b".into(), "a".into()],
            ..Default::default()
        };
        db.batch_insert_users(&[user]).unwrap();
        assert_eq!(db.get_user("u").unwrap().labels, vec!["a", "b"]);
    });
}

#[test]
fn test_patch_touches_only_present_fields() {
    each_backend(|db| {
        let mut item = Item::new("i", ts(100));
        item.categories = vec!["c1".into()];
        item.labels = vec!["l1".into()];
        item.comment = "keep".into();
        db.batch_insert_items(std::slice::from_ref(&item)).unwrap();

        db.modify_item(
            "i",
            &ItemPatch {
                is_hidden: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        let patched = db.get_item("i").unwrap();
        assert!(patched.is_hidden);
        assert_eq!(patched.categories, item.categories);
        assert_eq!(patched.labels, item.labels);
        assert_eq!(patched.timestamp, item.timestamp);
        assert_eq!(patched.comment, item.comment);

        db.batch_insert_users(&[User::new("u")]).unwrap();
        db.modify_user(
            "u",
            &UserPatch {
                comment: Some("hello".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(db.get_user("u").unwrap().comment, "hello");

        assert!(db
            .modify_user("ghost", &UserPatch::default())
            .unwrap_err()
            .is_not_found());
    });
}

#[test]
fn test_paging_concatenates_to_full_collection() {
    each_backend(|db| {
        let users: Vec<User> = (0..23).map(|i| User::new(format!("user{i:02}"))).collect();
        db.batch_insert_users(&users).unwrap();

        let mut seen = Vec::new();
        let mut cursor = String::new();
        loop {
            let (next, page) = db.get_users(&cursor, 5).unwrap();
            assert!(page.len() <= 5);
            seen.extend(ids(&page, |u| &u.user_id));
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        let expected: Vec<String> = users.iter().map(|u| u.user_id.clone()).collect();
        assert_eq!(seen, expected);

        // an exact multiple of the page size still terminates
        let (next, page) = db.get_users("", 23).unwrap();
        assert_eq!(page.len(), 23);
        assert!(next.is_empty());

        assert!(matches!(
            db.get_users("not a cursor!", 5),
            Err(StorageError::InvalidArgument(_))
        ));
    });
}

#[test]
fn test_item_listing_filters() {
    each_backend(|db| {
        let mut hidden = Item::new("1", ts(500));
        hidden.is_hidden = true;
        let old = Item::new("2", ts(10));
        let fresh = Item::new("3", ts(600));
        db.batch_insert_items(&[hidden, old, fresh]).unwrap();

        let (_, page) = db.get_items("", 10, &ItemFilter::default()).unwrap();
        assert_eq!(ids(&page, |i| &i.item_id), vec!["2", "3"]);

        let filter = ItemFilter {
            time_limit: Some(ts(100)),
            include_hidden: true,
        };
        let (_, page) = db.get_items("", 10, &filter).unwrap();
        assert_eq!(ids(&page, |i| &i.item_id), vec!["1", "3"]);

        let found = db
            .batch_get_items(&["3".into(), "missing".into(), "1".into()])
            .unwrap();
        assert_eq!(ids(&found, |i| &i.item_id), vec!["1", "3"]);
    });
}

#[test]
fn test_feedback_insert_flags() {
    each_backend(|db| {
        let f = Feedback::new(FeedbackKey::new("like", "u", "i"), ts(10));

        // neither user nor item exists: skipped
        db.batch_insert_feedback(&[f.clone()], FeedbackInsert::default())
            .unwrap();
        assert!(db.get_user_feedback("u", true, &[]).unwrap().is_empty());

        // created on demand
        db.batch_insert_feedback(&[f.clone()], FeedbackInsert::upsert())
            .unwrap();
        assert_eq!(db.get_user("u").unwrap(), User::new("u"));
        assert_eq!(db.get_item("i").unwrap().item_id, "i");

        // existing key without overwrite: whole batch rejected
        let other = Feedback::new(FeedbackKey::new("like", "u", "j"), ts(20));
        let mut again = f.clone();
        again.timestamp = ts(30);
        let no_overwrite = FeedbackInsert {
            overwrite: false,
            ..FeedbackInsert::upsert()
        };
        let err = db
            .batch_insert_feedback(&[other, again.clone()], no_overwrite)
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(db.get_user_feedback("u", true, &[]).unwrap(), vec![f.clone()]);

        // with overwrite the timestamp is replaced
        db.batch_insert_feedback(&[again.clone()], FeedbackInsert::upsert())
            .unwrap();
        assert_eq!(db.get_user_feedback("u", true, &[]).unwrap(), vec![again]);
    });
}

#[test]
fn test_feedback_queries() {
    each_backend(|db| {
        let future = Utc::now() + Duration::days(30);
        let feedback = vec![
            Feedback::new(FeedbackKey::new("like", "u1", "i1"), ts(100)),
            Feedback::new(FeedbackKey::new("read", "u1", "i1"), ts(200)),
            Feedback::new(FeedbackKey::new("read", "u1", "i2"), ts(300)),
            Feedback::new(FeedbackKey::new("read", "u2", "i1"), ts(400)),
            Feedback::new(FeedbackKey::new("like", "u1", "i3"), future),
        ];
        db.batch_insert_feedback(&feedback, FeedbackInsert::upsert())
            .unwrap();

        let latest_first = db.get_user_feedback("u1", false, &[]).unwrap();
        let items: Vec<_> = latest_first.iter().map(|f| f.item_id()).collect();
        assert_eq!(items, vec!["i2", "i1", "i1"]);
        assert_eq!(db.get_user_feedback("u1", true, &[]).unwrap().len(), 4);

        let likes = db.get_user_feedback("u1", true, &["like".into()]).unwrap();
        assert_eq!(likes.len(), 2);

        let item_feedback = db.get_item_feedback("i1", &["read".into()]).unwrap();
        let users: Vec<_> = item_feedback.iter().map(|f| f.key.user_id.as_str()).collect();
        assert_eq!(users, vec!["u2", "u1"]);

        assert_eq!(db.get_user_item_feedback("u1", "i1", &[]).unwrap().len(), 2);
        assert_eq!(
            db.delete_user_item_feedback("u1", "i1", &["read".into()]).unwrap(),
            1
        );
        let remaining = db.get_user_item_feedback("u1", "i1", &[]).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key.feedback_type, "like");

        // deleting a user keeps its feedback
        db.delete_user("u2").unwrap();
        assert_eq!(db.get_item_feedback("i1", &[]).unwrap().len(), 2);
    });
}

#[test]
fn test_feedback_listing_pages_by_key() {
    each_backend(|db| {
        let mut feedback = Vec::new();
        for u in 0..4 {
            for i in 0..3 {
                for t in ["like", "read"] {
                    feedback.push(Feedback::new(
                        FeedbackKey::new(t, format!("u{u}"), format!("i{i}")),
                        ts(100),
                    ));
                }
            }
        }
        feedback.push(Feedback::new(
            FeedbackKey::new("like", "u9", "i9"),
            Utc::now() + Duration::days(1),
        ));
        db.batch_insert_feedback(&feedback, FeedbackInsert::upsert())
            .unwrap();

        let mut keys = Vec::new();
        let mut cursor = String::new();
        loop {
            let (next, page) = db.get_feedback(&cursor, 7, &FeedbackFilter::default()).unwrap();
            keys.extend(page.into_iter().map(|f| f.key));
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        assert_eq!(keys.len(), 24);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 24);
        assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "{}: feedback not in (type, user, item) order",
            db.backend_name()
        );

        let (_, likes) = db
            .get_feedback("", 100, &FeedbackFilter::with_types(["like"]))
            .unwrap();
        assert_eq!(likes.len(), 12);
    });
}

#[test]
fn test_feedback_order_agrees_across_backends() {
    let listings = RefCell::new(Vec::new());
    each_backend(|db| {
        let feedback: Vec<Feedback> = [
            ("like", "u y"),
            ("a b", "u"),
            ("like", "u"),
            ("a", "u"),
            ("a!", "u"),
        ]
        .into_iter()
        .map(|(t, u)| Feedback::new(FeedbackKey::new(t, u, "i"), ts(100)))
        .collect();
        db.batch_insert_feedback(&feedback, FeedbackInsert::upsert())
            .unwrap();

        let mut keys = Vec::new();
        let mut cursor = String::new();
        loop {
            let (next, page) = db.get_feedback(&cursor, 2, &FeedbackFilter::default()).unwrap();
            keys.extend(page.into_iter().map(|f| (f.key.feedback_type, f.key.user_id)));
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        listings.borrow_mut().push(keys);
    });

    // a part sorts before any longer part it prefixes
    let expected: Vec<(String, String)> = [
        ("a", "u"),
        ("a b", "u"),
        ("a!", "u"),
        ("like", "u"),
        ("like", "u y"),
    ]
    .into_iter()
    .map(|(t, u)| (t.to_string(), u.to_string()))
    .collect();
    let listings = listings.into_inner();
    assert_eq!(listings.len(), 2);
    for keys in listings {
        assert_eq!(keys, expected);
    }
}

#[test]
fn test_paging_forward_only_under_inserts() {
    each_backend(|db| {
        let users: Vec<User> = (0..10).map(|i| User::new(format!("m{i}"))).collect();
        db.batch_insert_users(&users).unwrap();

        let mut seen = Vec::new();
        let mut cursor = String::new();
        let mut round = 0;
        loop {
            let (next, page) = db.get_users(&cursor, 3).unwrap();
            seen.extend(ids(&page, |u| &u.user_id));
            if next.is_empty() {
                break;
            }
            // one row after the cursor and one before it
            db.batch_insert_users(&[
                User::new(format!("z{round}")),
                User::new(format!("a{round}")),
            ])
            .unwrap();
            round += 1;
            cursor = next;
        }

        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len(), "duplicates in {seen:?}");
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        for user in &users {
            assert!(seen.contains(&user.user_id), "{} missing", user.user_id);
        }
        assert!(seen.iter().any(|id| id.starts_with('z')));
        assert!(!seen.iter().any(|id| id.starts_with('a')));
    });
}

#[test]
fn test_sqlite_lock_wait_is_deadline() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("locked.db");
    let mut config = StorageConfig::default();
    config.timeouts.operation_ms = 100;

    let db = open_database(&format!("sqlite://{}", path.display()), "", &config).unwrap();
    db.init().unwrap();

    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let started = Instant::now();
    let err = db.batch_insert_users(&[User::new("u")]).unwrap_err();
    assert!(matches!(err, StorageError::DeadlineExceeded(_)), "{err}");
    assert!(started.elapsed() >= StdDuration::from_millis(100));

    blocker.execute_batch("ROLLBACK").unwrap();
    db.batch_insert_users(&[User::new("u")]).unwrap();
    assert_eq!(db.get_user("u").unwrap().user_id, "u");
}

#[test]
fn test_streams_deliver_everything() {
    each_backend(|db| {
        let items: Vec<Item> = (0..10).map(|i| Item::new(format!("{i}"), ts(i))).collect();
        db.batch_insert_items(&items).unwrap();
        db.batch_insert_users(&[User::new("a"), User::new("b"), User::new("c")])
            .unwrap();

        let streamed = db
            .get_item_stream(3, ItemFilter::default())
            .unwrap()
            .collect_all()
            .unwrap();
        assert_eq!(streamed.len(), 10);

        let batches: Vec<Vec<User>> = db
            .get_user_stream(2)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);

        assert!(db
            .get_feedback_stream(5, FeedbackFilter::default())
            .unwrap()
            .collect_all()
            .unwrap()
            .is_empty());
    });
}

#[test]
fn test_purge_clears_everything() {
    each_backend(|db| {
        db.batch_insert_feedback(
            &[Feedback::new(FeedbackKey::new("like", "u", "i"), ts(1))],
            FeedbackInsert::upsert(),
        )
        .unwrap();
        db.optimize().unwrap();
        db.purge().unwrap();
        assert!(db.get_users("", 10).unwrap().1.is_empty());
        assert!(db.get_items("", 10, &ItemFilter::default()).unwrap().1.is_empty());
        assert!(db.get_user_feedback("u", true, &[]).unwrap().is_empty());
    });
}

#[test]
fn test_batches_visible_all_or_nothing() {
    each_backend(|db| {
        let reader = db.clone();
        let users: Vec<User> = (0..200).map(|i| User::new(format!("{i:03}"))).collect();

        thread::scope(|scope| {
            let observer = scope.spawn(|| {
                for _ in 0..50 {
                    let (_, page) = reader.get_users("", 1000).unwrap();
                    assert!(page.is_empty() || page.len() == 200, "saw {}", page.len());
                }
            });
            db.batch_insert_users(&users).unwrap();
            observer.join().unwrap();
        });
    });
}

#[test]
fn test_closed_backend_unavailable() {
    let db = open_database("memory://", "", &StorageConfig::default()).unwrap();
    db.close().unwrap();
    assert!(matches!(
        db.get_user("u"),
        Err(StorageError::BackendUnavailable(_))
    ));
}
