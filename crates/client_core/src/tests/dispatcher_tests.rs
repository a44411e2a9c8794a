use super::*;
use crate::test_support::{notification_event, post_event};
use std::sync::Mutex;

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&ServerEvent) + Send + Sync>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_for_factory = Arc::clone(&log);
    let factory = move |label: &str| -> Box<dyn Fn(&ServerEvent) + Send + Sync> {
        let log = Arc::clone(&log_for_factory);
        let label = label.to_string();
        Box::new(move |_event: &ServerEvent| log.lock().unwrap().push(label.clone()))
    };
    (log, factory)
}

#[test]
fn callbacks_run_in_registration_order() {
    let dispatcher = EventDispatcher::new();
    let (log, handler) = recorder();
    dispatcher.subscribe(EventKind::PostNew, handler("first"));
    dispatcher.subscribe(EventKind::PostNew, handler("second"));
    dispatcher.subscribe(EventKind::PostNew, handler("third"));

    let invoked = dispatcher.dispatch(&post_event("d1", "p1"));

    assert_eq!(invoked, 3);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn removed_callback_is_never_invoked() {
    let dispatcher = EventDispatcher::new();
    let (log, handler) = recorder();
    let keep = dispatcher.subscribe(EventKind::PostNew, handler("keep"));
    let gone = dispatcher.subscribe(EventKind::PostNew, handler("gone"));

    assert!(dispatcher.unsubscribe(gone));
    dispatcher.dispatch(&post_event("d1", "p1"));

    assert_eq!(*log.lock().unwrap(), vec!["keep"]);
    assert_eq!(keep.kind(), EventKind::PostNew);
    assert_eq!(dispatcher.handler_count(EventKind::PostNew), 1);
}

#[test]
fn removal_is_a_noop_when_nothing_is_registered() {
    let dispatcher = EventDispatcher::new();
    let handle = dispatcher.subscribe(EventKind::CommentNew, |_| {});
    assert!(dispatcher.unsubscribe(handle));
    assert!(!dispatcher.unsubscribe(handle));
    assert_eq!(dispatcher.unsubscribe_all(EventKind::CommentNew), 0);
    assert_eq!(dispatcher.unsubscribe_all(EventKind::TypingStopped), 0);
}

#[test]
fn unsubscribe_all_only_clears_that_kind() {
    let dispatcher = EventDispatcher::new();
    let (log, handler) = recorder();
    dispatcher.subscribe(EventKind::PostNew, handler("post-a"));
    dispatcher.subscribe(EventKind::PostNew, handler("post-b"));
    dispatcher.subscribe(EventKind::NotificationNew, handler("notify"));

    assert_eq!(dispatcher.unsubscribe_all(EventKind::PostNew), 2);
    dispatcher.dispatch(&post_event("d1", "p1"));
    dispatcher.dispatch(&notification_event("n1"));

    assert_eq!(*log.lock().unwrap(), vec!["notify"]);
}

#[test]
fn callback_removed_mid_delivery_is_skipped() {
    let dispatcher = EventDispatcher::new();
    let (log, handler) = recorder();
    let victim: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

    let dispatcher_for_cb = Arc::clone(&dispatcher);
    let victim_for_cb = Arc::clone(&victim);
    dispatcher.subscribe(EventKind::PostNew, move |_| {
        if let Some(handle) = victim_for_cb.lock().unwrap().take() {
            dispatcher_for_cb.unsubscribe(handle);
        }
    });
    let handle = dispatcher.subscribe(EventKind::PostNew, handler("victim"));
    *victim.lock().unwrap() = Some(handle);

    assert_eq!(dispatcher.dispatch(&post_event("d1", "p1")), 1);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn discussion_scoped_subscriber_only_sees_its_discussion() {
    let dispatcher = EventDispatcher::new();
    let (log, handler) = recorder();
    dispatcher.subscribe_discussion(EventKind::PostNew, DiscussionId::new("d1"), handler("d1"));
    dispatcher.subscribe_discussion(EventKind::PostNew, DiscussionId::new("d2"), handler("d2"));

    dispatcher.dispatch(&post_event("d1", "p1"));

    assert_eq!(*log.lock().unwrap(), vec!["d1"]);
}

#[tokio::test]
async fn stream_mirrors_dispatched_events_in_order() {
    let dispatcher = EventDispatcher::new();
    let mut stream = dispatcher.stream();

    dispatcher.dispatch(&post_event("d1", "p1"));
    dispatcher.dispatch(&notification_event("n1"));

    assert_eq!(stream.recv().await.expect("first"), post_event("d1", "p1"));
    assert_eq!(stream.recv().await.expect("second"), notification_event("n1"));
}
