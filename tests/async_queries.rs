//! Background query evaluation and cross-thread result hand-off.

mod common;

use common::{pump_until, test_config};
use ripple::{Connection, Predicate, Query};
use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

fn counter() -> (Rc<Cell<u32>>, impl FnMut() + 'static) {
    let count = Rc::new(Cell::new(0));
    let inner = count.clone();
    (count, move || inner.set(inner.get() + 1))
}

#[test]
fn find_async_loads_exactly_once_without_commits() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    let results = conn.find_async(Query::table("Dog")).unwrap();
    assert!(!results.is_loaded());
    assert!(!results.is_valid());
    assert_eq!(results.len(), 0);

    // Listener registered against the pending placeholder, before any
    // data arrives.
    let (fired, callback) = counter();
    results.add_change_listener(callback).unwrap();

    pump_until(&conn, || fired.get() == 1);
    assert!(results.is_loaded());
    assert!(results.is_valid());
    assert_eq!(results.len(), 2);

    // No further notifications without further commits.
    conn.drain_events().unwrap();
    assert_eq!(fired.get(), 1);
}

#[test]
fn find_first_async_loads_matching_object() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    let dog = conn.create_object("Dog").unwrap();
    dog.set("name", "Akamaru").unwrap();
    conn.commit_write().unwrap();

    let found = conn
        .find_first_async(Query::table("Dog").filter(Predicate::eq("name", "Akamaru")))
        .unwrap();
    assert!(!found.is_loaded());
    assert!(!found.is_valid());
    assert_eq!(found.get("name"), None);

    let (fired, callback) = counter();
    found.add_change_listener(callback).unwrap();

    pump_until(&conn, || fired.get() == 1);
    assert!(found.is_loaded());
    assert!(found.is_valid());
    assert_eq!(found.get("name").unwrap().as_str(), Some("Akamaru"));
    assert_eq!(found.id(), dog.id());

    // Once loaded, the handle behaves like a synchronous one.
    conn.begin_write().unwrap();
    dog.set("age", 17i64).unwrap();
    conn.commit_write().unwrap();
    assert_eq!(fired.get(), 2);
    assert_eq!(found.get("age").unwrap().as_int(), Some(17));
}

#[test]
fn find_first_async_without_match_loads_invalid() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    let ghost = conn.find_first_async(Query::table("Ghost")).unwrap();
    let (fired, callback) = counter();
    ghost.add_change_listener(callback).unwrap();

    pump_until(&conn, || fired.get() == 1);
    assert!(ghost.is_loaded());
    assert!(!ghost.is_valid());
    assert_eq!(ghost.id(), None);
    assert_eq!(ghost.get("anything"), None);

    // The invalid handle never fires again.
    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();
    conn.drain_events().unwrap();
    assert_eq!(fired.get(), 1);
}

#[test]
fn loaded_async_results_track_later_commits() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    let results = conn.find_async(Query::table("Dog")).unwrap();
    let (fired, callback) = counter();
    results.add_change_listener(callback).unwrap();
    pump_until(&conn, || fired.get() == 1);
    assert_eq!(results.len(), 1);

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    assert_eq!(fired.get(), 2);
    assert_eq!(results.len(), 2);
}

#[test]
fn async_delivery_stays_consistent_with_pinned_version() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    let results = conn.find_async(Query::table("Dog")).unwrap();
    let (fired, callback) = counter();
    results.add_change_listener(callback).unwrap();

    // A remote commit races the background evaluation. Whatever order the
    // wake and the completion are processed in, the delivered result is
    // consistent with the connection's pinned version at that moment and
    // the final state reflects both dogs.
    let worker_config = config.clone();
    thread::spawn(move || {
        let conn = Connection::open(&worker_config).unwrap();
        conn.begin_write().unwrap();
        conn.create_object("Dog").unwrap();
        conn.commit_write().unwrap();
    })
    .join()
    .unwrap();

    pump_until(&conn, || results.is_loaded());
    conn.drain_events().unwrap();
    pump_until(&conn, || results.len() == 2);
    assert!(fired.get() >= 1);
}

#[test]
fn dropped_pending_handle_is_silently_discarded() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    let (fired, callback) = counter();
    let results = conn.find_async(Query::table("Dog")).unwrap();
    results.add_change_listener(callback).unwrap();
    drop(results);

    // Give the worker time to post the completion, then process it; the
    // dead placeholder is skipped without effect.
    thread::sleep(Duration::from_millis(100));
    conn.drain_events().unwrap();
    assert_eq!(fired.get(), 0);
}

#[test]
fn closing_supersedes_inflight_queries() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    let results = conn.find_async(Query::table("Dog")).unwrap();
    conn.close();

    // The completion either fails to send or is never pumped; no error
    // surfaces anywhere and the handle just stays unloaded.
    thread::sleep(Duration::from_millis(100));
    assert!(!results.is_loaded());
    assert_eq!(results.len(), 0);
}

#[test]
fn pending_entities_ignore_version_advances() {
    let (_dir, config) = test_config();
    let conn = Connection::open(&config).unwrap();

    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    let results = conn.find_async(Query::table("Dog")).unwrap();
    let (fired, callback) = counter();
    results.add_change_listener(callback).unwrap();

    // A version advance before the completion arrives must not fire the
    // pending entity; only the loaded event does.
    conn.begin_write().unwrap();
    conn.create_object("Dog").unwrap();
    conn.commit_write().unwrap();

    pump_until(&conn, || fired.get() == 1);
    assert!(results.is_loaded());
    assert_eq!(results.len(), 2);
}
