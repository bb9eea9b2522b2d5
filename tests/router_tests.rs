mod common;

use std::sync::Arc;
use std::thread;

use hush::contact::Contact;
use hush::identity::Identity;
use hush::protocol::{CatchUpReply, ContactSet, Request, RequestData, Status};
use hush::router::{Action, Outcome, Rejection, Router};

use common::{fast_config, node};

fn contact_set(addr: &str) -> Request {
    let addr: std::net::SocketAddr = addr.parse().expect("address");
    Request::new(RequestData::Csp(ContactSet {
        contacts: vec![Contact::from(addr)],
    }))
}

#[test]
fn concurrent_copies_are_accepted_once() {
    let ctx = node(fast_config(), 9401);
    let bytes = contact_set("127.0.0.1:9499").to_bytes().expect("encode");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let router = Router::new(ctx.clone());
            let bytes = bytes.clone();
            thread::spawn(move || router.process(&bytes).expect("process"))
        })
        .collect();

    let accepted = handles
        .into_iter()
        .map(|h| h.join().expect("worker"))
        .filter(|outcome| matches!(outcome, Outcome::Accepted { .. }))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(ctx.contacts().all().expect("contacts").len(), 1);
}

#[test]
fn forged_key_part_is_dropped_and_genuine_one_accepted() {
    let ours = node(fast_config(), 9402);
    let theirs = node(fast_config(), 9403);
    let members = vec![theirs.identity().node().clone(), ours.identity().node().clone()];
    let (conversation, requests) = theirs.kep().initiate(&members).expect("initiate");
    let genuine = requests.into_iter().next().expect("one part for us");

    let mut forged = genuine.clone();
    if let RequestData::Kep(exchange) = &mut forged.data {
        exchange.sig = "00".repeat(64);
    }
    let router = Router::new(ours.clone());

    let forged_id = forged.id().expect("id");
    let outcome = router.process_request(forged, 0, false).expect("process");
    assert!(matches!(outcome.rejection(), Some(Rejection::InvalidPart(_))));
    assert!(ours.conversation(&conversation).is_err());
    assert!(!ours.store().has_request(&forged_id).expect("log"));

    let outcome = router.process_request(genuine, 0, false).expect("process");
    assert!(matches!(outcome, Outcome::Accepted { status: Status::Kep, .. }));
    assert!(ours.conversation(&conversation).expect("stored").is_complete());
}

#[test]
fn part_resigned_under_a_claimed_identity_is_dropped() {
    let ours = node(fast_config(), 9405);
    let theirs = node(fast_config(), 9406);
    let mallory = Identity::generate().expect("identity");
    let members = vec![theirs.identity().node().clone(), ours.identity().node().clone()];
    let (conversation, requests) = theirs.kep().initiate(&members).expect("initiate");

    let mut impersonated = requests.into_iter().next().expect("one part for us");
    if let RequestData::Kep(exchange) = &mut impersonated.data {
        exchange.author.signing_key = mallory.node().signing_key.clone();
        exchange.sig = mallory.sign(exchange.hash.as_bytes()).expect("sign");
    }
    let id = impersonated.id().expect("id");

    let outcome = Router::new(ours.clone())
        .process_request(impersonated, 0, false)
        .expect("process");
    assert!(matches!(outcome.rejection(), Some(Rejection::Invalid(_))));
    assert!(outcome.actions().is_empty());
    assert!(ours.conversation(&conversation).is_err());
    assert!(!ours.store().has_request(&id).expect("log"));
}

#[test]
fn bundled_requests_are_applied_without_rebroadcast() {
    let ctx = node(fast_config(), 9404);
    let router = Router::new(ctx.clone());

    let inner = Request::new(RequestData::WupRep(CatchUpReply {
        requests: vec![contact_set("127.0.0.1:9501")],
    }));
    let outer = Request::new(RequestData::WupRep(CatchUpReply {
        requests: vec![inner, contact_set("127.0.0.1:9502")],
    }));

    let outcome = router
        .process(&outer.to_bytes().expect("encode"))
        .expect("process");
    assert!(matches!(outcome, Outcome::Accepted { .. }));
    assert!(
        !outcome.actions().iter().any(|a| matches!(a, Action::Relay(_))),
        "replayed requests must not be relayed"
    );
    assert_eq!(ctx.contacts().all().expect("contacts").len(), 2);

    // A live copy of a replayed request is already logged.
    let again = router
        .process(&contact_set("127.0.0.1:9502").to_bytes().expect("encode"))
        .expect("process");
    assert!(matches!(again.rejection(), Some(Rejection::Duplicate)));
}
