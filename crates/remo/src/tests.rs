use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use remowire::Body;
use remowire::Decoded;
use remowire::FrameLimits;
use remowire::Message;
use remowire::MessageType;
use remowire::Role;

use crate::access::permitted;
use crate::outbox::Outbox;
use crate::*;

fn caller() -> RemoteCaller {
    RemoteCaller::new(SessionId(1), "127.0.0.1:4000".parse().unwrap())
}

fn widget() -> DynamicObject {
    DynamicObject::builder()
        .method("add", 2, |args, _| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(Value::from(a + b))
        })
        .method("add", 3, |args, _| Ok(Value::from(args.len() as u32)))
        .property("title", "hello")
        .read_only_property("serial", 42)
        .event("changed")
        .build()
}

struct DenyAll;

impl ObjectAccessControl for DenyAll {
    fn permits(&self, _op: &Operation<'_>, _caller: &RemoteCaller) -> bool {
        false
    }
}

/// Admits the access gate and nothing else.
struct AccessOnly;

impl ObjectAccessControl for AccessOnly {
    fn permits(&self, op: &Operation<'_>, _caller: &RemoteCaller) -> bool {
        *op == Operation::Access
    }
}

struct OnlyObject(&'static str);

impl ComponentAccessControl for OnlyObject {
    fn permits_component(&self, _caller: &RemoteCaller) -> bool {
        true
    }

    fn permits_object(&self, object_name: &str, _caller: &RemoteCaller) -> bool {
        object_name == self.0
    }
}

// ============================================================================
//  ACCESS CHAIN
// ============================================================================

#[test]
fn test_permissions_flags() {
    let ro = Permissions::read_only();
    assert!(ro.allows(&Operation::Access));
    assert!(ro.allows(&Operation::GetProperty("title")));
    assert!(ro.allows(&Operation::SubscribeEvent("changed")));
    assert!(!ro.allows(&Operation::SetProperty("title")));
    assert!(!ro.allows(&Operation::InvokeMethod("add")));

    // Without the access gate nothing passes.
    let no_access = Permissions { access: false, ..Permissions::all() };
    assert!(!no_access.allows(&Operation::Access));
    assert!(!no_access.allows(&Operation::GetProperty("title")));

    assert!(!Permissions::none().allows(&Operation::Access));
    assert!(!Permissions::all().with_deliver_event(false).allows(&Operation::DeliverEvent("changed")));
}

#[test]
fn test_native_object_denial_beats_flags() {
    let component = AppComponent::new("Comp");
    let object = DynamicObject::builder().access_control(DenyAll).build();

    let ok = permitted(&component, "Widget", &object, &Permissions::all(), &Operation::Access, &caller());
    assert!(!ok);
}

#[test]
fn test_native_object_control_decides_each_operation() {
    let component = AppComponent::new("Comp");
    let object = DynamicObject::builder().access_control(AccessOnly).build();
    let perms = Permissions::all();

    assert!(permitted(&component, "Widget", &object, &perms, &Operation::Access, &caller()));
    assert!(!permitted(&component, "Widget", &object, &perms, &Operation::GetProperty("title"), &caller()));
}

#[test]
fn test_component_flag_without_native_control() {
    let object = widget();
    let perms = Permissions::all();

    let closed = AppComponent::new("Comp").with_remote_access(false);
    assert!(!permitted(&closed, "Widget", &object, &perms, &Operation::Access, &caller()));

    let open = AppComponent::new("Comp");
    assert!(permitted(&open, "Widget", &object, &perms, &Operation::Access, &caller()));
}

#[test]
fn test_native_component_control_overrides_flag() {
    let object = widget();
    let perms = Permissions::all();
    let component = AppComponent::new("Comp")
        .with_remote_access(false)
        .with_access_control(OnlyObject("Widget"));

    assert!(permitted(&component, "Widget", &object, &perms, &Operation::Access, &caller()));
    assert!(!permitted(&component, "Other", &object, &perms, &Operation::Access, &caller()));
}

#[test]
fn test_flags_decide_specific_operation() {
    let component = AppComponent::new("Comp");
    let object = widget();
    let perms = Permissions::all().with_invoke_method(false);

    assert!(!permitted(&component, "Widget", &object, &perms, &Operation::InvokeMethod("add"), &caller()));
    assert!(permitted(&component, "Widget", &object, &perms, &Operation::SetProperty("title"), &caller()));
}

// ============================================================================
//  REGISTRY
// ============================================================================

fn access_point() -> AccessPoint {
    let ap = AccessPoint::new(ServerConfig::new("demo"));
    ap.add_component(Arc::new(AppComponent::new("Comp"))).unwrap();
    ap
}

#[test]
fn test_resolve_registered_object() {
    let ap = access_point();
    let object = Arc::new(widget());
    let key = ap.register_object("Comp", &object, "Widget", Permissions::all()).unwrap();

    let resolved = ap.resolve("Comp.Widget", true).unwrap();
    assert_eq!(resolved.key, key);
    assert_eq!(resolved.key, ObjectKey::of(&object));
    assert_eq!(resolved.name, "Widget");
    assert_eq!(resolved.full_name, "Comp.Widget");
    assert_eq!(resolved.component.name(), "Comp");
}

#[test]
fn test_resolve_fails_once_object_dropped() {
    let ap = access_point();
    let object = Arc::new(widget());
    ap.register_object("Comp", &object, "Widget", Permissions::all()).unwrap();
    drop(object);

    let err = ap.resolve("Comp.Widget", true).err();
    assert_eq!(err, Some(ResolveError::NotFound("Comp.Widget".into())));
}

#[test]
fn test_resolve_unknown_names() {
    let ap = access_point();
    assert!(matches!(ap.resolve("Comp.Missing", false), Err(ResolveError::NotFound(_))));
    assert!(matches!(ap.resolve("Nope.Widget", false), Err(ResolveError::NotFound(_))));
    assert!(matches!(ap.resolve("NoDot", false), Err(ResolveError::NotFound(_))));
}

#[test]
fn test_disallow_remote_access_only_blocks_remote_resolution() {
    let ap = access_point();
    let object = Arc::new(widget());
    ap.register_object("Comp", &object, "Hidden", Permissions::all().disallow_remote_access())
        .unwrap();

    assert_eq!(
        ap.resolve("Comp.Hidden", true).err(),
        Some(ResolveError::AccessDenied("Comp.Hidden".into()))
    );
    assert!(ap.resolve("Comp.Hidden", false).is_ok());
}

#[test]
fn test_registration_errors() {
    let ap = access_point();
    let object = Arc::new(widget());

    assert_eq!(
        ap.register_object("Ghost", &object, "Widget", Permissions::all()).err(),
        Some(RegistryError::UnknownComponent("Ghost".into()))
    );
    assert_eq!(
        ap.register_object("Comp", &object, "", Permissions::all()).err(),
        Some(RegistryError::EmptyName)
    );

    ap.register_object("Comp", &object, "Widget", Permissions::all()).unwrap();
    assert_eq!(
        ap.register_object("Comp", &object, "Again", Permissions::all()).err(),
        Some(RegistryError::AlreadyRegistered("Comp.Widget".into()))
    );

    let other = Arc::new(widget());
    assert_eq!(
        ap.register_object("Comp", &other, "Widget", Permissions::all()).err(),
        Some(RegistryError::NameTaken("Comp.Widget".into()))
    );

    assert_eq!(
        ap.add_component(Arc::new(AppComponent::new("Comp"))).err(),
        Some(RegistryError::DuplicateComponent("Comp".into()))
    );
}

#[test]
fn test_name_reusable_after_object_dies() {
    let ap = access_point();
    let first = Arc::new(widget());
    ap.register_object("Comp", &first, "Widget", Permissions::all()).unwrap();
    drop(first);

    let second = Arc::new(widget());
    let key = ap.register_object("Comp", &second, "Widget", Permissions::all()).unwrap();
    assert_eq!(ap.resolve("Comp.Widget", true).unwrap().key, key);
}

#[test]
fn test_exposed_guard_revokes_on_drop() {
    let ap = access_point();
    let exposed = ap.expose("Comp", Arc::new(widget()), "Widget", Permissions::all()).unwrap();
    let kept = exposed.object().clone();
    assert_eq!(exposed.get_local("title"), Some(Value::from("hello")));

    drop(exposed);
    assert!(ap.resolve("Comp.Widget", true).is_err());
    // The object itself outlives its registration.
    assert_eq!(kept.get_local("serial"), Some(Value::from(42)));
}

#[test]
fn test_unregister_checks_owner() {
    let ap = access_point();
    ap.add_component(Arc::new(AppComponent::new("Other"))).unwrap();
    let object = Arc::new(widget());
    ap.register_object("Comp", &object, "Widget", Permissions::all()).unwrap();

    assert_eq!(ap.unregister_object("Other", &object), Err(RegistryError::NotRegistered));
    assert!(ap.resolve("Comp.Widget", true).is_ok());

    ap.unregister_object("Comp", &object).unwrap();
    assert!(ap.resolve("Comp.Widget", true).is_err());
    assert_eq!(ap.unregister_object("Comp", &object), Err(RegistryError::NotRegistered));
}

#[test]
fn test_component_markup_is_registered() {
    let ap = AccessPoint::new(ServerConfig::new("demo"));
    let object: Arc<dyn ExposedObject> = Arc::new(widget());
    let component = AppComponent::new("Shop")
        .declare("Cart", object.clone(), Permissions::read_only())
        .declare("Till", object.clone(), Permissions::all());

    // One object can only carry one registration.
    assert_eq!(
        ap.add_component(Arc::new(component)).err(),
        Some(RegistryError::AlreadyRegistered("Shop.Cart".into()))
    );
    let resolved = ap.resolve("Shop.Cart", true).unwrap();
    assert_eq!(resolved.permissions, Permissions::read_only());
}

#[test]
fn test_sessions_empty_without_listener() {
    let ap = access_point();
    assert!(!ap.is_enabled());
    assert!(ap.local_addr().is_none());
    assert!(ap.sessions().is_empty());
}

// ============================================================================
//  DYNAMIC OBJECT
// ============================================================================

#[test]
fn test_dynamic_object_methods_by_arity() {
    let object = widget();
    assert!(object.has_method("add", 2));
    assert!(object.has_method("add", 3));
    assert!(!object.has_method("add", 1));

    let sum = object.invoke("add", &[Value::from(2), Value::from(3)], &caller()).unwrap();
    assert_eq!(sum, Value::from(5i64));

    let err = object.invoke("add", &[Value::from(1)], &caller()).unwrap_err();
    assert_eq!(err, ObjectError::NoSuchMember("add".into()));
}

#[test]
fn test_dynamic_object_properties() {
    let object = widget();
    assert_eq!(object.property_names(), vec!["serial".to_string(), "title".to_string()]);

    object.set_property("title", Value::from("bye"), &caller()).unwrap();
    assert_eq!(object.property("title", &caller()), Some(Value::from("bye")));

    assert_eq!(
        object.set_property("serial", Value::from(1), &caller()),
        Err(ObjectError::ReadOnly("serial".into()))
    );
    assert_eq!(
        object.set_property("missing", Value::from(1), &caller()),
        Err(ObjectError::NoSuchMember("missing".into()))
    );

    // Local writes ignore the read-only marker.
    object.set_local("serial", 7);
    assert_eq!(object.get_local("serial"), Some(Value::from(7)));
}

#[test]
fn test_dynamic_object_events() {
    let object = widget();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink_seen = seen.clone();
    let sink: EventSink = Arc::new(move |args: &[Value]| sink_seen.lock().unwrap().push(args.to_vec()));
    assert!(object.subscribe("missing", sink.clone()).is_none());
    let sub = object.subscribe("changed", sink).unwrap();
    assert_eq!(object.subscriber_count("changed"), 1);

    assert_eq!(object.emit("changed", &[Value::from(1)]), 1);
    assert_eq!(object.emit("other", &[]), 0);

    object.unsubscribe(sub);
    assert_eq!(object.emit("changed", &[Value::from(2)]), 0);
    assert_eq!(*seen.lock().unwrap(), vec![vec![Value::from(1)]]);
}

// ============================================================================
//  OUTBOX
// ============================================================================

fn request(id: i32) -> Message {
    Message::new(id, Body::GetProperty { object_id: 1, name: format!("p{}", id) })
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<i32> {
    let mut ids = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        match remowire::decode(&frame, &FrameLimits::default()).unwrap() {
            Decoded::Message { message, consumed } => {
                assert_eq!(consumed, frame.len());
                ids.push(message.id);
            }
            Decoded::Incomplete => panic!("partial frame in outbox"),
        }
    }
    ids
}

#[tokio::test]
async fn test_outbox_sends_in_order() {
    let (outbox, mut rx) = Outbox::channel(Role::Client, "test", Duration::from_millis(500), None);
    for id in 1..=3 {
        outbox.send(&request(id)).unwrap();
    }
    assert_eq!(drain(&mut rx), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_outbox_rejects_wrong_direction() {
    let (outbox, mut rx) = Outbox::channel(Role::Client, "test", Duration::from_millis(500), None);
    let reply = Message::new(1, Body::RequestAccessRes { granted: true });
    assert_eq!(
        outbox.send(&reply),
        Err(LinkError::Misdirected(MessageType::RequestAccessRes))
    );
    assert!(drain(&mut rx).is_empty());

    let (server, _rx) = Outbox::channel(Role::Server, "test", Duration::from_millis(500), None);
    assert!(server.send(&reply).is_ok());
    assert!(server.send(&Message::new(2, Body::ReleaseObject { object_id: 4 })).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_outbox_contention_retries_after_delay() {
    let (outbox, mut rx) = Outbox::channel(Role::Client, "test", Duration::from_millis(500), None);

    let guard = outbox.hold();
    outbox.send(&request(1)).unwrap();
    outbox.send(&request(2)).unwrap();
    assert_eq!(outbox.pending_len(), 2);
    drop(guard);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut rx).is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(outbox.pending_len(), 0);
    assert_eq!(drain(&mut rx), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_outbox_flushes_queue_before_new_frame() {
    let (outbox, mut rx) = Outbox::channel(Role::Client, "test", Duration::from_millis(500), None);

    let guard = outbox.hold();
    outbox.send(&request(1)).unwrap();
    outbox.send(&request(2)).unwrap();
    drop(guard);

    // The lock is free again; the queued frames go out ahead of this one.
    outbox.send(&request(3)).unwrap();
    assert_eq!(drain(&mut rx), vec![1, 2, 3]);

    // The retry task finds nothing left to do.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_outbox_close_flushes_and_refuses() {
    let (outbox, mut rx) = Outbox::channel(Role::Client, "test", Duration::from_millis(500), None);
    outbox.send(&request(1)).unwrap();
    outbox.close();

    assert!(outbox.is_closed());
    assert_eq!(outbox.send(&request(2)), Err(LinkError::Closed));
    assert_eq!(rx.recv().await.map(|f| !f.is_empty()), Some(true));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_outbox_transcript() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let transcript: Transcript = Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_string()));

    let (outbox, _rx) = Outbox::channel(Role::Client, "peer", Duration::from_millis(500), Some(transcript));
    outbox.send(&request(1)).unwrap();
    outbox.note_received(&Message::new(1, Body::GetPropertyRes {
        object_id: 1,
        name: "p1".into(),
        value: Value::from(3),
        success: true,
    }));

    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("peer >> GetProperty[1]"), "{}", lines[0]);
    assert!(lines[1].starts_with("peer << GetPropertyRes[1]"), "{}", lines[1]);
}

// ============================================================================
//  ACCEPT LOOP
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_accept_error_backs_off() {
    let (_shutdown_tx, mut shutdown) = tokio::sync::oneshot::channel::<()>();
    let err = std::io::Error::other("too many open files");

    let start = tokio::time::Instant::now();
    let stop = crate::server::back_off_after_accept_error(&err, &mut shutdown).await;
    assert!(!stop);
    assert!(start.elapsed() >= crate::server::ACCEPT_BACKOFF);
}

#[tokio::test(start_paused = true)]
async fn test_accept_back_off_yields_to_shutdown() {
    let (shutdown_tx, mut shutdown) = tokio::sync::oneshot::channel::<()>();
    let err = std::io::Error::other("too many open files");
    shutdown_tx.send(()).unwrap();

    let start = tokio::time::Instant::now();
    assert!(crate::server::back_off_after_accept_error(&err, &mut shutdown).await);
    assert!(start.elapsed() < crate::server::ACCEPT_BACKOFF);
}
