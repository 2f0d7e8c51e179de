//! Property reconciliation across clients sharing one server.

use consort_sync::{
    ConcurrencyPolicy, ErrorEvent, ErrorKind, LoopbackServer, ObjectRef, PropertyValue, SharedObject, SyncClient,
    SyncConfig, SyncError, SyncEvent, TypeDescriptor, ValueKind,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn counter() -> ObjectRef {
    SharedObject::new(
        TypeDescriptor::new("Counter")
            .property_with_policy("value", ValueKind::Int, ConcurrencyPolicy::RejectAndNotify)
            .server_applied("revision", ValueKind::Int),
    )
}

fn note() -> ObjectRef {
    SharedObject::new(TypeDescriptor::new("Note").property("title", ValueKind::Text))
}

fn open(server: &LoopbackServer, client: &mut SyncClient, name: &str, object: ObjectRef) -> ObjectRef {
    let mut request = client.open_object(name, object).unwrap();
    server.deliver(client).unwrap();
    request.try_take().expect("open reply delivered").unwrap()
}

fn errors(events: &mut UnboundedReceiver<SyncEvent>) -> Vec<ErrorEvent> {
    let mut found = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Error(error) = event {
            found.push(error);
        }
    }
    found
}

fn value(object: &ObjectRef, name: &str) -> PropertyValue {
    object.borrow().get(name).cloned().unwrap_or_default()
}

#[test]
fn test_stale_write_is_rejected_and_reported_once() {
    let server = LoopbackServer::new();
    let mut a = server.client(SyncConfig::default()).unwrap();
    let mut b = server.client(SyncConfig::default()).unwrap();
    let mut a_events = a.take_event_rx().unwrap();
    let mut b_events = b.take_event_rx().unwrap();
    let counter_a = open(&server, &mut a, "counter", counter());
    let counter_b = open(&server, &mut b, "counter", counter());

    // Neither has seen the other's write when making its own.
    b.set_property(&counter_b, "value", 2i64).unwrap();
    a.set_property(&counter_a, "value", 1i64).unwrap();
    server.settle(&mut [&mut a, &mut b]).unwrap();

    let conflicts = errors(&mut a_events);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ErrorKind::Conflict);
    let details = conflicts[0].conflict.as_ref().unwrap();
    assert_eq!(details.property, "value");
    assert_eq!(details.accepted, PropertyValue::Int(2));
    assert_eq!(details.rejected, vec![PropertyValue::Int(1)]);
    assert_eq!(conflicts[0].subject.as_ref().unwrap().name.as_deref(), Some("counter"));
    assert!(errors(&mut b_events).is_empty());

    assert_eq!(value(&counter_a, "value"), PropertyValue::Int(2));
    assert_eq!(value(&counter_b, "value"), PropertyValue::Int(2));
    assert_eq!(server.object_value("counter", "value"), Some(PropertyValue::Int(2)));
    let entry = a.objects().by_name("counter").unwrap();
    assert_eq!(entry.property("value").unwrap().pending_len(), 0);
    assert!(!a.waiting_for_acks());

    // Having seen the winner, a retry is accepted.
    a.set_property(&counter_a, "value", 5i64).unwrap();
    server.settle(&mut [&mut a, &mut b]).unwrap();
    assert!(errors(&mut a_events).is_empty());
    assert_eq!(value(&counter_b, "value"), PropertyValue::Int(5));
    assert_eq!(server.object_value("counter", "value"), Some(PropertyValue::Int(5)));
}

#[test]
fn test_overwrite_converges_on_last_sequenced_write() {
    let server = LoopbackServer::new();
    let mut a = server.client(SyncConfig::default()).unwrap();
    let mut b = server.client(SyncConfig::default()).unwrap();
    let mut a_events = a.take_event_rx().unwrap();
    let note_a = open(&server, &mut a, "note", note());
    let note_b = open(&server, &mut b, "note", note());

    a.set_property(&note_a, "title", "from a").unwrap();
    b.set_property(&note_b, "title", "from b").unwrap();
    server.settle(&mut [&mut a, &mut b]).unwrap();

    let expected = PropertyValue::Text("from b".into());
    assert_eq!(value(&note_a, "title"), expected);
    assert_eq!(value(&note_b, "title"), expected);
    assert_eq!(server.object_value("note", "title"), Some(expected));
    assert!(errors(&mut a_events).is_empty());
    assert!(!a.waiting_for_acks());
    assert!(!b.waiting_for_acks());
}

#[test]
fn test_own_writes_keep_latest_value_until_acknowledged() {
    let server = LoopbackServer::new();
    let mut a = server.client(SyncConfig::default()).unwrap();
    let mut b = server.client(SyncConfig::default()).unwrap();
    let note_a = open(&server, &mut a, "note", note());
    let note_b = open(&server, &mut b, "note", note());

    for title in ["draft 1", "draft 2", "draft 3"] {
        a.set_property(&note_a, "title", title).unwrap();
    }
    let entry = a.objects().by_name("note").unwrap();
    assert_eq!(entry.property("title").unwrap().pending_len(), 3);

    // Echoes of the older drafts must not roll the instance back.
    server.deliver(&mut a).unwrap();
    assert_eq!(value(&note_a, "title"), PropertyValue::Text("draft 3".into()));
    assert!(!a.waiting_for_acks());

    server.deliver(&mut b).unwrap();
    assert_eq!(value(&note_b, "title"), PropertyValue::Text("draft 3".into()));
}

#[test]
fn test_write_while_open_is_pending_is_rejected() {
    let server = LoopbackServer::new();
    let mut a = server.client(SyncConfig::default()).unwrap();
    let mut b = server.client(SyncConfig::default()).unwrap();
    let mut b_events = b.take_event_rx().unwrap();
    let settings = || SharedObject::new(TypeDescriptor::new("Settings").property("theme", ValueKind::Text));

    let settings_a = open(&server, &mut a, "settings", settings());
    a.set_property(&settings_a, "theme", "light").unwrap();
    server.deliver(&mut a).unwrap();

    // B's local entry has not learned the server's id yet.
    let settings_b = settings();
    let mut request = b.open_object("settings", settings_b.clone()).unwrap();
    let error = b.set_property(&settings_b, "theme", "dark").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotConnected);
    assert_eq!(value(&settings_b, "theme"), PropertyValue::Null);

    server.settle(&mut [&mut a, &mut b]).unwrap();
    let opened = request.try_take().expect("open reply delivered").unwrap();
    assert!(std::rc::Rc::ptr_eq(&opened, &settings_b));
    assert_eq!(value(&settings_b, "theme"), PropertyValue::Text("light".into()));
    assert!(errors(&mut b_events).is_empty());

    b.set_property(&settings_b, "theme", "dark").unwrap();
    server.settle(&mut [&mut a, &mut b]).unwrap();
    assert_eq!(value(&settings_a, "theme"), PropertyValue::Text("dark".into()));
    assert_eq!(server.object_value("settings", "theme"), Some(PropertyValue::Text("dark".into())));
}

#[test]
fn test_server_applied_property_cannot_be_written() {
    let server = LoopbackServer::new();
    let mut a = server.client(SyncConfig::default()).unwrap();
    let counter = open(&server, &mut a, "counter", counter());

    let error = a.set_property(&counter, "revision", 3i64).unwrap_err();
    assert!(matches!(error, SyncError::ServerAppliedProperty { .. }));
    assert_eq!(error.kind(), ErrorKind::Argument);
    assert_eq!(server.pending(a.client_id()), 0);
}

#[test]
fn test_dynamic_object_shares_undeclared_properties() {
    let server = LoopbackServer::new();
    let mut a = server.client(SyncConfig::default()).unwrap();
    let mut b = server.client(SyncConfig::default()).unwrap();
    let bag_a = open(&server, &mut a, "bag", SharedObject::dynamic("Bag"));
    a.set_property(&bag_a, "colour", "teal").unwrap();
    a.set_property(&bag_a, "size", 3i64).unwrap();
    server.deliver(&mut a).unwrap();

    let bag_b = open(&server, &mut b, "bag", SharedObject::dynamic("Bag"));
    assert_eq!(value(&bag_b, "colour"), PropertyValue::Text("teal".into()));
    assert_eq!(value(&bag_b, "size"), PropertyValue::Int(3));

    b.set_property(&bag_b, "colour", "navy").unwrap();
    server.settle(&mut [&mut a, &mut b]).unwrap();
    assert_eq!(value(&bag_a, "colour"), PropertyValue::Text("navy".into()));
}
