// Publication lifecycle against the memory hub: no-subscriber puts, delivery, and stale handles.
use std::time::Duration;

use keyplane::api::config::{PEER, WORKERS};
use keyplane::api::{
    Attachment, Config, CongestionControl, Encoding, ErrorKind, FullPolicy, Priority,
    PublicationOptions, PutOptions, SampleKind, Session, TryRecv, bounded,
};

fn open(hub: &str) -> Session {
    let config = Config::new()
        .with(PEER, format!("mem/{hub}"))
        .and_then(|config| config.with(WORKERS, "1"))
        .expect("config");
    Session::open(config).expect("open")
}

#[test]
fn put_without_subscribers_succeeds() {
    let session = open("flow-no-subscriber");
    let id = session.declare_keyexpr("/demo/example").expect("declare");
    assert_eq!(id.get(), 1);
    let publication = session
        .declare_publication(id, PublicationOptions::default())
        .expect("publication");
    assert!(!publication.matching_status().expect("status").matching);
    for n in 0..3 {
        publication
            .put(format!("[{n:4}] Pub from Rust!"), PutOptions::default())
            .expect("put without subscribers");
    }
    publication.undeclare().expect("undeclare publication");
    session.undeclare_keyexpr(id).expect("undeclare id");
    session.close().expect("close");
}

#[test]
fn subscriber_in_another_session_receives_samples_in_order() {
    let publisher = open("flow-delivery");
    let subscriber_session = open("flow-delivery");
    let (sender, receiver) = bounded(16, FullPolicy::Block).expect("channel");
    let subscriber = subscriber_session
        .declare_subscriber("/demo/example/**", sender)
        .expect("subscriber");

    let id = publisher
        .declare_keyexpr("/demo/example/keyplane-pub")
        .expect("declare");
    let publication = publisher
        .declare_publication(
            id,
            PublicationOptions {
                congestion_control: CongestionControl::Block,
                priority: Priority::DataHigh,
            },
        )
        .expect("publication");
    assert!(publication.matching_status().expect("status").matching);

    publication
        .put(
            "first",
            PutOptions {
                encoding: Some(Encoding::text_plain()),
                attachment: Some(Attachment::encode([("trace", "abc")])),
            },
        )
        .expect("put");
    publication.put("second", PutOptions::default()).expect("put");
    publication.delete().expect("delete");

    let mut samples = Vec::new();
    while samples.len() < 3 {
        match receiver.recv_timeout(Duration::from_secs(5)) {
            TryRecv::Item(sample) => samples.push(sample),
            other => panic!("expected three samples, stopped at {other:?}"),
        }
    }
    assert_eq!(samples[0].payload, "first");
    assert_eq!(samples[0].encoding.as_str(), Encoding::TEXT_PLAIN);
    assert_eq!(samples[0].qos.priority, Priority::DataHigh);
    assert_eq!(samples[0].source, Some(publisher.id()));
    let pairs = samples[0]
        .attachment
        .as_ref()
        .expect("attachment")
        .to_pairs()
        .expect("decode");
    assert_eq!(pairs.len(), 1);
    assert_eq!(samples[1].payload, "second");
    assert!(samples[1].attachment.is_none());
    assert_eq!(samples[2].kind, SampleKind::Delete);

    subscriber.undeclare().expect("undeclare subscriber");
    assert!(!publication.matching_status().expect("status").matching);
}

#[test]
fn publication_is_stale_after_undeclare_and_close() {
    let session = open("flow-stale");
    let id = session.declare_keyexpr("/demo/example").expect("declare");
    let first = session
        .declare_publication(id, PublicationOptions::default())
        .expect("first");
    let second = session
        .declare_publication(id, PublicationOptions::default())
        .expect("second");

    first.put("ok", PutOptions::default()).expect("put before undeclare");
    session.close().expect("close");

    let err = second
        .put("late", PutOptions::default())
        .expect_err("stale after close");
    assert_eq!(err.kind(), ErrorKind::StaleHandle);
    assert_eq!(
        first.undeclare().expect_err("already revoked").kind(),
        ErrorKind::StaleHandle
    );
}

#[test]
fn session_level_put_validates_key_expression() {
    let session = open("flow-invalid");
    let err = session
        .put("/demo/ex?ample", "x", PutOptions::default())
        .expect_err("invalid");
    assert_eq!(err.kind(), ErrorKind::InvalidExpression);
    session
        .put("/demo/example", "x", PutOptions::default())
        .expect("valid put");
    session.delete("/demo/example").expect("valid delete");
}
