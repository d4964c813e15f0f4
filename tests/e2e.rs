//! End-to-end scenarios against the virtual DMAPI backend, one per
//! concrete case: migrate-then-read, daemon-restart mid-recall,
//! concurrent migration, destroy before any read, the anti-thrash
//! restart window, and the empty-file refusal.

use hacksm::config::Config;
use hacksm::daemon;
use hacksm::dmapi::virtual_session::{VirtualFs, VirtualSession};
use hacksm::dmapi::{DmSession, EventType, Right};
use hacksm::ls::Listing;
use hacksm::migrate::{self, Outcome};
use hacksm::store::Store;

fn fast_cfg() -> Config {
    Config { wait_time_ms: 0, ..Config::default() }
}

/// Scenario 1: migrate "A", list it, then have the daemon recall it on
/// a trapped read — content round-trips and the store empties out.
#[test]
fn migrate_list_and_recall_round_trips_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(dir.path()).unwrap();
    let path = dir.path().join("A");
    std::fs::write(&path, b"hello").unwrap();

    let fs = VirtualFs::new();
    let m_sess = VirtualSession::new(fs.clone(), "hacksm_migrate");
    assert_eq!(migrate::migrate(&m_sess, &store, &fast_cfg(), &path).unwrap(), Outcome::Migrated);

    // A separate session, as `hacksm_ls` would be in its own process,
    // agrees with the migrator through the persisted attribute.
    let ls_sess = VirtualSession::new(fs.clone(), "hacksm_ls");
    match hacksm::ls::ls(&ls_sess, &path).unwrap() {
        Listing::Managed { size, state, .. } => {
            assert_eq!(size, 5);
            assert_eq!(state, 1);
        }
        other => panic!("expected a managed listing, got {:?}", other),
    }

    let d_sess = VirtualSession::new(fs.clone(), "hacksmd");
    let mount = fs.simulate_mount();
    daemon::dispatch_one(&d_sess, &store, &fast_cfg(), mount, false).unwrap();

    let token = fs.simulate_user_access(&path, EventType::Read).unwrap();
    assert!(token.is_some());
    for msg in d_sess.get_events(false).unwrap() {
        daemon::dispatch_one(&d_sess, &store, &fast_cfg(), msg, false).unwrap();
    }

    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    assert!(matches!(hacksm::ls::ls(&ls_sess, &path).unwrap(), Listing::Plain { .. }));
    let meta = std::fs::metadata(&path).unwrap();
    assert!(!store.exists(std::os::unix::fs::MetadataExt::dev(&meta), std::os::unix::fs::MetadataExt::ino(&meta)));
}

/// Scenario 2: a daemon killed after marking RECALL but before
/// finishing (and before unlinking the store object) must still let a
/// later recall attempt resume cleanly, with correct content and no
/// leftover attribute or store object.
#[test]
fn recall_resumes_correctly_after_a_simulated_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(dir.path()).unwrap();
    let path = dir.path().join("B");
    let content: Vec<u8> = (0..128 * 1024).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &content).unwrap();

    let fs = VirtualFs::new();
    let m_sess = VirtualSession::new(fs.clone(), "hacksm_migrate");
    assert_eq!(migrate::migrate(&m_sess, &store, &fast_cfg(), &path).unwrap(), Outcome::Migrated);

    // First daemon instance marks RECALL, then "dies" without ever
    // calling respond_event or finishing the copy back.
    let d1 = VirtualSession::new(fs.clone(), "hacksmd");
    let handle = d1.path_to_handle(&path).unwrap();
    let token = d1.create_userevent().unwrap();
    d1.request_right(&handle, &token, Right::Exclusive).unwrap();
    let raw = d1.get_dmattr(&handle, &token, hacksm::attr::HSM_ATTRNAME).unwrap().unwrap();
    let mut attr = hacksm::attr::HsmAttr::decode(&raw).unwrap();
    attr.state = hacksm::attr::HsmState::Recall;
    d1.set_dmattr(&handle, &token, hacksm::attr::HSM_ATTRNAME, &attr.encode()).unwrap();
    drop(token);

    // A second daemon instance starts fresh and still recalls
    // successfully against the persisted attribute and store object.
    let d2 = VirtualSession::new(fs.clone(), "hacksmd");
    let handle2 = d2.path_to_handle(&path).unwrap();
    let mut token2 = d2.create_userevent().unwrap();
    hacksm::daemon::recall::handle_recall(&d2, &store, &fast_cfg(), &handle2, &mut token2, true).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), content);
    assert!(d2.get_dmattr(&handle2, &token2, hacksm::attr::HSM_ATTRNAME).unwrap().is_none());
    let meta = std::fs::metadata(&path).unwrap();
    assert!(!store.exists(std::os::unix::fs::MetadataExt::dev(&meta), std::os::unix::fs::MetadataExt::ino(&meta)));
}

/// Scenario 3: two concurrent `migrate` invocations on the same file —
/// exactly one performs the copy, the other observes an already
/// migrated attribute and skips.
#[test]
fn concurrent_migrate_invocations_agree_on_a_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(dir.path()).unwrap();
    let path = dir.path().join("B");
    std::fs::write(&path, vec![7u8; 4096]).unwrap();

    let fs = VirtualFs::new();
    let first = VirtualSession::new(fs.clone(), "hacksm_migrate");
    let second = VirtualSession::new(fs.clone(), "hacksm_migrate");

    let r1 = migrate::migrate(&first, &store, &fast_cfg(), &path).unwrap();
    let r2 = migrate::migrate(&second, &store, &fast_cfg(), &path).unwrap();

    let outcomes = [r1, r2];
    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Migrated).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| matches!(o, Outcome::Skipped(_))).count(), 1);
}

/// Scenario 4: a destroy event reaching the daemon before any read
/// must still clean up the store object and the attribute (real DMAPI
/// traps the unlink, so the attribute is still readable when the event
/// fires — the file itself is removed only once the handler is done).
#[test]
fn destroy_before_any_read_cleans_up_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(dir.path()).unwrap();
    let path = dir.path().join("C");
    std::fs::write(&path, b"gone soon").unwrap();

    let fs = VirtualFs::new();
    let m_sess = VirtualSession::new(fs.clone(), "hacksm_migrate");
    migrate::migrate(&m_sess, &store, &fast_cfg(), &path).unwrap();
    let meta = std::fs::metadata(&path).unwrap();
    let (dev, ino) = (std::os::unix::fs::MetadataExt::dev(&meta), std::os::unix::fs::MetadataExt::ino(&meta));
    assert!(store.exists(dev, ino));

    let d_sess = VirtualSession::new(fs.clone(), "hacksmd");
    let mount = fs.simulate_mount();
    daemon::dispatch_one(&d_sess, &store, &fast_cfg(), mount, false).unwrap();

    let key = hacksm::dmapi::virtual_session::FileKey { device: dev, inode: ino };
    fs.simulate_destroy(&path, key).unwrap();
    for msg in d_sess.get_events(false).unwrap() {
        daemon::dispatch_one(&d_sess, &store, &fast_cfg(), msg, false).unwrap();
    }

    assert!(!store.exists(dev, ino));
}

/// Scenario 5: a migrator crashed between setting the region and
/// punching the hole leaves a `START` attribute. Restarting within the
/// anti-thrash window must skip; restarting after it must resume and
/// complete the migration.
#[test]
fn anti_thrash_window_gates_resuming_a_partial_migration() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(dir.path()).unwrap();
    let path = dir.path().join("D");
    std::fs::write(&path, b"partial").unwrap();

    let fs = VirtualFs::new();
    let sess = VirtualSession::new(fs.clone(), "hacksm_migrate");
    let handle = sess.path_to_handle(&path).unwrap();
    let token = sess.create_userevent().unwrap();

    let meta = std::fs::metadata(&path).unwrap();
    let attr = hacksm::attr::HsmAttr {
        migrate_time: std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(),
        size: meta.len(),
        device: std::os::unix::fs::MetadataExt::dev(&meta),
        inode: std::os::unix::fs::MetadataExt::ino(&meta),
        state: hacksm::attr::HsmState::Start,
    };
    sess.set_dmattr(&handle, &token, hacksm::attr::HSM_ATTRNAME, &attr.encode()).unwrap();
    // The crashed migrator left a partial store object behind.
    let mut h = store.open(attr.device, attr.inode, false).unwrap();
    h.write_all(b"partial").unwrap();
    h.close().unwrap();

    let retry_sess = VirtualSession::new(fs.clone(), "hacksm_migrate");
    let recent = migrate::migrate(&retry_sess, &store, &fast_cfg(), &path).unwrap();
    assert!(matches!(recent, Outcome::Skipped(ref msg) if msg.contains("recent")));

    // Back-date the attribute past the anti-thrash window and retry.
    let mut aged = attr;
    aged.migrate_time -= 120;
    sess.set_dmattr(&handle, &token, hacksm::attr::HSM_ATTRNAME, &aged.encode()).unwrap();

    let resumed = migrate::migrate(&retry_sess, &store, &fast_cfg(), &path).unwrap();
    assert_eq!(resumed, Outcome::Migrated);
}

/// Scenario 6: an empty file is never migrated.
#[test]
fn empty_file_is_never_migrated() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(dir.path()).unwrap();
    let path = dir.path().join("E");
    std::fs::write(&path, b"").unwrap();

    let fs = VirtualFs::new();
    let sess = VirtualSession::new(fs, "hacksm_migrate");
    let outcome = migrate::migrate(&sess, &store, &fast_cfg(), &path).unwrap();
    assert!(matches!(outcome, Outcome::Skipped(_)));

    let meta = std::fs::metadata(&path).unwrap();
    assert!(!store.exists(std::os::unix::fs::MetadataExt::dev(&meta), std::os::unix::fs::MetadataExt::ino(&meta)));
}
