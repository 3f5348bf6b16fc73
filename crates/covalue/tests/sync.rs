//! Multi-node sync scenarios through the local node API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use covalue::core::{list_append, map_set};
use covalue::sync::SyncMessage;
use covalue::{AggregateState, CoValueType, Privacy, Ruleset};
use covalue_testkit::{connect_pair, deliver_all, step, TestNode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_hello_world_reaches_new_peer() -> anyhow::Result<()> {
    init_tracing();
    let mut a = TestNode::new("a", 1);
    let mut b = TestNode::new("b", 2);
    connect_pair(&mut a, &mut b);

    let id = a.create_map()?;
    a.node
        .make_transaction(&id, &[map_set("hello", json!("world"))], Privacy::Trusting)?;

    assert_eq!(b.node.load(id), AggregateState::Loading);
    deliver_all(&mut [&mut a, &mut b]);

    let known = b.node.known_state(&id);
    assert!(known.header);
    assert_eq!(known.sessions.len(), 1);
    assert_eq!(known.count(&a.node.session()), 1);
    assert_eq!(known, a.node.known_state(&id));

    let content = b.node.content(&id)?;
    assert_eq!(content.as_map().unwrap().get("hello"), Some(&json!("world")));
    assert_eq!(b.manager().aggregate_state(&id), AggregateState::Available);
    Ok(())
}

#[test]
fn test_writes_flow_both_ways_after_load() -> anyhow::Result<()> {
    let mut server = TestNode::new("server", 1);
    let mut client = TestNode::new("client", 2);
    connect_pair(&mut server, &mut client);

    let id = server.create_list()?;
    client.node.load(id);
    deliver_all(&mut [&mut server, &mut client]);

    server
        .node
        .make_transaction(&id, &[list_append(json!("from server"))], Privacy::Trusting)?;
    client
        .node
        .make_transaction(&id, &[list_append(json!("from client"))], Privacy::Trusting)?;
    deliver_all(&mut [&mut server, &mut client]);

    assert_eq!(server.node.known_state(&id), client.node.known_state(&id));
    let items = server.node.content(&id)?.as_list().unwrap().items().to_vec();
    assert_eq!(items.len(), 2);
    assert!(items.contains(&json!("from client")));
    Ok(())
}

#[test]
fn test_relay_through_server() -> anyhow::Result<()> {
    let mut server = TestNode::new("server", 1);
    let mut alice = TestNode::new("alice", 2);
    let mut bob = TestNode::new("bob", 3);
    connect_pair(&mut server, &mut alice);
    connect_pair(&mut server, &mut bob);

    let id = alice.create_map()?;
    alice
        .node
        .make_transaction(&id, &[map_set("from", json!("alice"))], Privacy::Trusting)?;
    deliver_all(&mut [&mut server, &mut alice, &mut bob]);
    assert!(server.manager().registry().is_available(&id));

    bob.node.load(id);
    deliver_all(&mut [&mut server, &mut alice, &mut bob]);
    let content = bob.node.content(&id)?;
    assert_eq!(content.as_map().unwrap().get("from"), Some(&json!("alice")));
    Ok(())
}

#[test]
fn test_missing_group_gates_validity() -> anyhow::Result<()> {
    init_tracing();
    let mut admin = TestNode::new("admin", 1);
    let mut reader = TestNode::new("reader", 2);
    connect_pair(&mut admin, &mut reader);

    let group = admin.node.create_group()?;
    let doc = admin
        .node
        .create_covalue(CoValueType::Map, Ruleset::OwnedByGroup { group }, None)?;
    admin
        .node
        .make_transaction(&doc, &[map_set("title", json!("draft"))], Privacy::Trusting)?;

    reader.node.load(doc);
    step(&mut [&mut admin, &mut reader]);

    // Hold the group back and hand over the document alone.
    let (group_msgs, doc_msgs): (Vec<_>, Vec<_>) = admin
        .node
        .sync_mut()
        .take_outgoing()
        .into_iter()
        .partition(|(_, message)| message.id() == &group);
    assert!(!group_msgs.is_empty());
    for (_, message) in doc_msgs {
        reader.node.sync_mut().handle_message(&admin.peer, message)?;
    }

    {
        let core = reader.manager().registry().get(&doc).unwrap();
        assert!(core.is_available());
        assert!(core.missing_dependencies().contains(&group));
        assert!(!core.is_complete());
    }
    assert_eq!(reader.node.content(&doc)?.as_map().unwrap().get("title"), None);

    for (_, message) in group_msgs {
        reader.node.sync_mut().handle_message(&admin.peer, message)?;
    }
    deliver_all(&mut [&mut admin, &mut reader]);

    let core = reader.manager().registry().get(&doc).unwrap();
    assert!(core.missing_dependencies().is_empty());
    assert!(core.is_complete());
    assert_eq!(
        reader.node.content(&doc)?.as_map().unwrap().get("title"),
        Some(&json!("draft"))
    );
    Ok(())
}

#[test]
fn test_remote_writes_coalesce_into_one_notification() -> anyhow::Result<()> {
    let mut server = TestNode::new("server", 1);
    let mut client = TestNode::new("client", 2);
    connect_pair(&mut server, &mut client);

    let id = server.create_list()?;
    client.node.load(id);
    deliver_all(&mut [&mut server, &mut client]);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    client.node.subscribe(
        id,
        Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    for n in 0..3 {
        server
            .node
            .make_transaction(&id, &[list_append(json!(n))], Privacy::Trusting)?;
    }
    let delivered = step(&mut [&mut server, &mut client]);
    let contents = delivered
        .iter()
        .filter(|d| matches!(d.message, SyncMessage::Content(_)))
        .count();
    assert_eq!(contents, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    deliver_all(&mut [&mut server, &mut client]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.node.content(&id)?.as_list().unwrap().items().len(), 3);
    Ok(())
}

#[test]
fn test_unknown_covalue_settles_unavailable() {
    let mut server = TestNode::new("server", 1);
    let mut client = TestNode::new("client", 2);
    connect_pair(&mut server, &mut client);

    let missing = covalue::CoValueId::from_bytes([0x5A; 32]);
    assert_eq!(client.node.load(missing), AggregateState::Loading);
    deliver_all(&mut [&mut server, &mut client]);
    assert_eq!(
        client.manager().aggregate_state(&missing),
        AggregateState::Unavailable
    );
}
