//! End-to-end scenarios across the codec, key derivation and merge engine.

use chrono::Duration;
use keywarden_core::error::Error;
use keywarden_core::format::{open_file, save_file};
use keywarden_core::keys::{CompositeKey, FileKey, PasswordKey, UserKey};
use keywarden_core::model::entry::{Entry, KEY_PASSWORD, KEY_TITLE};
use keywarden_core::model::group::Group;
use keywarden_core::model::protected::{ProtectedBinary, ProtectedString};
use keywarden_core::model::times;
use keywarden_core::model::Database;
use keywarden_core::rand_pool::RandomPool;
use keywarden_core::status::NullStatusLogger;
use keywarden_core::sync::{merge_in, MergeMethod};
use std::io::Write as _;
use tempfile::tempdir;

fn password_key(password: &str) -> CompositeKey {
    let mut key = CompositeKey::new();
    key.add_user_key(UserKey::Password(PasswordKey::new(password)));
    key
}

fn populated_db() -> Database {
    let mut db = Database::new("Home");
    db.settings.transform_rounds = 32;
    db.meta.default_user_name = "pat".into();

    let mut banking = Group::new("Banking");
    let mut card = Entry::new();
    card.fields.set(KEY_TITLE, ProtectedString::plain("Card"));
    card.fields
        .set(KEY_PASSWORD, ProtectedString::protected("1234-pin"));
    card.set_binary("scan.png", ProtectedBinary::protected(&[0u8, 159, 146, 150]));
    card.tags = vec!["finance".into()];
    banking.entries.push(card);

    let mut email = Entry::new();
    email.fields.set(KEY_TITLE, ProtectedString::plain("Mail"));
    email
        .fields
        .set(KEY_PASSWORD, ProtectedString::protected("first version"));
    email.create_backup();
    email
        .fields
        .set(KEY_PASSWORD, ProtectedString::protected("second version"));
    db.root.entries.push(email);
    db.root.groups.push(banking);
    db
}

#[test]
fn container_round_trip_preserves_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("home.kwdb");
    let db = populated_db();
    let key = password_key("open sesame");

    save_file(&db, &key, &RandomPool::new(), &path, &NullStatusLogger).unwrap();
    let back = open_file(&path, &key, &NullStatusLogger).unwrap();
    assert_eq!(back, db);
}

#[test]
fn sample_scenario_rounds_two() {
    // One group, one entry {Title: Sample, Password: x}, password "p",
    // two transform rounds.
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.kwdb");

    let mut db = Database::new("Root");
    db.settings.transform_rounds = 2;
    let mut entry = Entry::new();
    entry.fields.set(KEY_TITLE, ProtectedString::plain("Sample"));
    entry
        .fields
        .set(KEY_PASSWORD, ProtectedString::protected("x"));
    db.root.entries.push(entry);

    save_file(
        &db,
        &password_key("p"),
        &RandomPool::new(),
        &path,
        &NullStatusLogger,
    )
    .unwrap();

    let back = open_file(&path, &password_key("p"), &NullStatusLogger).unwrap();
    let recovered = &back.root.entries[0];
    assert_eq!(*recovered.fields.get(KEY_TITLE).unwrap().read(), "Sample");
    assert_eq!(*recovered.fields.get(KEY_PASSWORD).unwrap().read(), "x");

    let err = open_file(&path, &password_key("wrong"), &NullStatusLogger).unwrap_err();
    assert!(matches!(err, Error::InvalidCompositeKey));
}

#[test]
fn password_plus_key_file_composite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("two-factor.kwdb");
    let key_path = dir.path().join("secret.key");
    let mut f = std::fs::File::create(&key_path).unwrap();
    f.write_all(&[0x5cu8; 32]).unwrap();
    drop(f);

    let make_key = |password: &str| {
        let mut key = CompositeKey::new();
        key.add_user_key(UserKey::Password(PasswordKey::new(password)));
        key.add_user_key(UserKey::KeyFile(FileKey::open(&key_path).unwrap()));
        key
    };

    let db = populated_db();
    save_file(
        &db,
        &make_key("pw"),
        &RandomPool::new(),
        &path,
        &NullStatusLogger,
    )
    .unwrap();

    assert_eq!(
        open_file(&path, &make_key("pw"), &NullStatusLogger).unwrap(),
        db
    );
    // Password alone is an incomplete composite key.
    let err = open_file(&path, &password_key("pw"), &NullStatusLogger).unwrap_err();
    assert!(matches!(err, Error::InvalidCompositeKey));
}

#[test]
fn divergent_replicas_synchronize_through_files() {
    let dir = tempdir().unwrap();
    let pool = RandomPool::new();
    let key = password_key("sync");
    let base = populated_db();
    let entry_uuid = base.root.entries[0].uuid;

    // Replica A changes the mail password at t1, replica B at t2 > t1.
    let t = times::now();
    let mut a = base.clone();
    {
        let e = a.find_entry_mut(entry_uuid).unwrap();
        e.create_backup();
        e.fields
            .set(KEY_PASSWORD, ProtectedString::protected("a-password"));
        e.times.last_modification = t + Duration::seconds(10);
    }
    let mut b = base.clone();
    {
        let e = b.find_entry_mut(entry_uuid).unwrap();
        e.create_backup();
        e.fields
            .set(KEY_PASSWORD, ProtectedString::protected("b-password"));
        e.times.last_modification = t + Duration::seconds(20);
    }

    // B's copy travels through a file, as a freshly reloaded disk copy would.
    let b_path = dir.path().join("replica-b.kwdb");
    save_file(&b, &key, &pool, &b_path, &NullStatusLogger).unwrap();
    let b_loaded = open_file(&b_path, &key, &NullStatusLogger).unwrap();

    let stats = merge_in(&mut a, &b_loaded, MergeMethod::Synchronize, &NullStatusLogger);
    assert!(stats.completed);

    let e = a.find_entry(entry_uuid).unwrap();
    assert_eq!(*e.fields.get(KEY_PASSWORD).unwrap().read(), "b-password");
    assert!(e
        .history
        .iter()
        .any(|h| *h.fields.get(KEY_PASSWORD).unwrap().read() == *"a-password"));
    // History snapshots stay one level deep through merge and reload.
    assert!(e.history.iter().all(|h| h.history.is_empty()));
}

#[test]
fn tombstones_survive_the_container_and_propagate() {
    let dir = tempdir().unwrap();
    let pool = RandomPool::new();
    let key = password_key("tomb");

    let base = populated_db();
    let card_uuid = base.root.groups[0].entries[0].uuid;

    let mut deleter = base.clone();
    deleter.meta.recycle_bin_enabled = false;
    assert!(deleter.delete_entry(card_uuid));

    let path = dir.path().join("deleter.kwdb");
    save_file(&deleter, &key, &pool, &path, &NullStatusLogger).unwrap();
    let deleter_loaded = open_file(&path, &key, &NullStatusLogger).unwrap();
    assert!(deleter_loaded.tombstone_for(card_uuid).is_some());

    let mut keeper = base.clone();
    merge_in(
        &mut keeper,
        &deleter_loaded,
        MergeMethod::Synchronize,
        &NullStatusLogger,
    );
    assert!(keeper.find_entry(card_uuid).is_none());
    assert!(keeper.tombstone_for(card_uuid).is_some());
}

#[test]
fn merge_is_idempotent_across_a_save_cycle() {
    let dir = tempdir().unwrap();
    let pool = RandomPool::new();
    let key = password_key("idem");
    let db = populated_db();

    let path = dir.path().join("self.kwdb");
    save_file(&db, &key, &pool, &path, &NullStatusLogger).unwrap();
    let reloaded = open_file(&path, &key, &NullStatusLogger).unwrap();

    let mut merged = db.clone();
    let stats = merge_in(
        &mut merged,
        &reloaded,
        MergeMethod::Synchronize,
        &NullStatusLogger,
    );
    assert!(stats.completed);
    assert_eq!(merged, db);
}
