//! Multi-peer scenarios over an in-process relay and a shared blob store.

use inksync_core::{
    CollabConfig, Element, MemoryDocument, MemoryHub, MemoryStore, RoomLinkData, Session, SessionPhase,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Instant;

fn block_on<F: Future>(f: F) -> F::Output {
    fn dummy_raw_waker() -> RawWaker {
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            dummy_raw_waker()
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }

    let waker = unsafe { Waker::from_raw(dummy_raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    let mut f = std::pin::pin!(f);

    loop {
        match f.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

struct Peer {
    session: Session<MemoryHub, MemoryStore>,
    doc: MemoryDocument,
}

impl Peer {
    fn new(hub: &MemoryHub, store: &Arc<MemoryStore>, elements: Vec<Element>) -> Self {
        let config = CollabConfig {
            ws_server_url: Some("ws://relay.test/ws".to_string()),
            ..CollabConfig::default()
        };
        Self {
            session: Session::with_shared_store(config, hub.clone(), Arc::clone(store), "https://ink.test"),
            doc: MemoryDocument::with_elements(elements),
        }
    }

    fn start(&mut self, room: Option<RoomLinkData>, now: Instant) {
        block_on(self.session.start_collaboration(&mut self.doc, room, now)).unwrap();
    }

    fn sync(&mut self, now: Instant) {
        block_on(self.session.sync_elements(&mut self.doc, false, now));
    }

    fn stop(&mut self, now: Instant) {
        block_on(self.session.stop_collaboration(&mut self.doc, true, || true, now));
    }

    /// Scene keyed by id, so peers can be compared regardless of z-order.
    fn scene(&self) -> BTreeMap<String, Element> {
        self.doc
            .elements
            .iter()
            .map(|el| (el.id.clone(), el.clone()))
            .collect()
    }
}

fn exchange(peers: &mut [&mut Peer], now: Instant) {
    for _ in 0..4 {
        for peer in peers.iter_mut() {
            block_on(peer.session.poll(&mut peer.doc, now));
        }
    }
}

/// A opens a room holding one rectangle; B and C join it in turn.
fn three_peers(now: Instant) -> (MemoryHub, Arc<MemoryStore>, Element, [Peer; 3]) {
    let hub = MemoryHub::new();
    let store = Arc::new(MemoryStore::new());
    let rect = Element::new("rectangle");

    let mut a = Peer::new(&hub, &store, vec![rect.clone()]);
    a.start(None, now);
    exchange(&mut [&mut a], now);
    let room = a.session.room().cloned();

    let mut b = Peer::new(&hub, &store, Vec::new());
    b.start(room.clone(), now);
    exchange(&mut [&mut a, &mut b], now);

    let mut c = Peer::new(&hub, &store, Vec::new());
    c.start(room, now);
    exchange(&mut [&mut a, &mut b, &mut c], now);

    (hub, store, rect, [a, b, c])
}

#[test]
fn test_joiners_get_the_room_scene() {
    let now = Instant::now();
    let (hub, _, rect, [a, b, c]) = three_peers(now);

    for peer in [&a, &b, &c] {
        assert_eq!(peer.session.phase(), SessionPhase::Active);
        assert_eq!(peer.doc.elements, vec![rect.clone()]);
        assert_eq!(peer.session.collaborators().len(), 3);
    }
    let room = a.session.room().unwrap();
    assert_eq!(hub.members(&room.room_id).len(), 3);
}

#[test]
fn test_concurrent_edits_converge() {
    let now = Instant::now();
    let (_, _, rect, [mut a, mut b, mut c]) = three_peers(now);

    // every peer edits before anyone hears from the others
    a.doc.mutate(&rect.id, |el| {
        el.data.insert("x".into(), Value::from(10));
    });
    a.doc.mutate(&rect.id, |el| {
        el.data.insert("x".into(), Value::from(20));
    });
    b.doc.mutate(&rect.id, |el| {
        el.data.insert("x".into(), Value::from(30));
    });
    c.doc.mutate(&rect.id, |el| el.is_deleted = true);
    a.doc.add(Element::new("ellipse"));
    b.doc.add(Element::new("diamond"));
    c.doc.add(Element::new("arrow"));
    for peer in [&mut a, &mut b, &mut c] {
        peer.sync(now);
    }

    exchange(&mut [&mut a, &mut b, &mut c], now);

    let scene = a.scene();
    assert_eq!(scene.len(), 4);
    assert_eq!(b.scene(), scene);
    assert_eq!(c.scene(), scene);

    // A made two edits, so its version of the rectangle wins everywhere
    let merged = &scene[&rect.id];
    assert_eq!(merged.version, 3);
    assert_eq!(merged.data.get("x"), Some(&Value::from(20)));
    assert!(!merged.is_deleted);
}

#[test]
fn test_element_being_edited_keeps_local_version() {
    let now = Instant::now();
    let (_, _, rect, [mut a, mut b, _c]) = three_peers(now);

    a.doc.app_state.editing_element_ids.insert(rect.id.clone());
    b.doc.mutate(&rect.id, |el| el.is_deleted = true);
    b.sync(now);
    exchange(&mut [&mut a, &mut b], now);

    assert_eq!(a.doc.element(&rect.id), Some(&rect));
    assert!(b.doc.element(&rect.id).is_some_and(|el| el.is_deleted));
}

#[test]
fn test_scene_survives_everyone_leaving() {
    let now = Instant::now();
    let (hub, store, rect, [mut a, mut b, mut c]) = three_peers(now);
    let room = a.session.room().cloned();

    let ellipse = Element::new("ellipse");
    b.doc.add(ellipse.clone());
    b.sync(now);
    exchange(&mut [&mut a, &mut b, &mut c], now);

    for peer in [&mut a, &mut b, &mut c] {
        peer.stop(now);
    }

    let mut late = Peer::new(&hub, &store, Vec::new());
    late.start(room, now);
    exchange(&mut [&mut late], now);

    assert_eq!(late.session.phase(), SessionPhase::Active);
    let scene = late.scene();
    assert_eq!(scene.get(&rect.id), Some(&rect));
    assert_eq!(scene.get(&ellipse.id), Some(&ellipse));
}
