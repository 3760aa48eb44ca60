mod common;

use common::drain;
use common::items;
use common::next_event;
use common::store;
use common::things;
use common::UnopenableStorage;
use common::MockFetcher;
use common::MockPush;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use swr_cache::error::FetchError;
use swr_cache::error::SwrError;
use swr_cache::realtime::PushMessage;
use swr_cache::storage::LocalStorage;
use swr_cache::storage::MemoryStorage;
use swr_cache::table::FieldIndex;
use swr_cache::table::KeyField;
use swr_cache::table::TableDescriptor;
use swr_cache::table::TableSet;
use swr_cache::types::BlockReason;
use swr_cache::types::GetOptions;
use swr_cache::types::StoreEvent;
use swr_cache::Store;

#[tokio::test]
async fn reordered_payload_is_not_a_change() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"label": "old", "UID": "A"}]));
    let (store, memory) = store(vec![things()], fetcher.clone());
    memory
        .put("things", "A", json!({"UID": "A", "label": "old"}))
        .await
        .unwrap();

    let mut events = store.subscribe();
    let records = store.refresh_all("things", false).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(fetcher.calls("rest/things"), 1);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn single_change_is_reported_per_item() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"UID": "A", "label": "new"}]));
    let (store, memory) = store(vec![things()], fetcher);
    memory
        .put("things", "A", json!({"UID": "A", "label": "old"}))
        .await
        .unwrap();

    let mut events = store.subscribe();
    store.refresh_all("things", false).await.unwrap();

    assert_eq!(drain(&mut events), vec![StoreEvent::ItemChanged {
        table: "things".into(),
        value: json!({"UID": "A", "label": "new"}),
    }]);
    assert_eq!(
        store.cached("things", Some("A")).await.unwrap(),
        Some(json!({"UID": "A", "label": "new"}))
    );
}

#[tokio::test]
async fn count_change_replaces_the_table() {
    let fetcher = MockFetcher::new();
    let fresh = json!([{"UID": "A", "label": "old"}, {"UID": "B", "label": "x"}]);
    fetcher.respond("rest/things", fresh.clone());
    let (store, memory) = store(vec![things()], fetcher);
    memory
        .put("things", "A", json!({"UID": "A", "label": "old"}))
        .await
        .unwrap();

    let mut events = store.subscribe();
    store.refresh_all("things", false).await.unwrap();

    let received = drain(&mut events);
    assert_eq!(received.len(), 1);
    let StoreEvent::ResourceChanged { ref table, ref items } = received[0]
    else {
        panic!("Expected resourceChanged, got {:?}", received[0]);
    };
    assert_eq!(table, "things");
    assert_eq!(json!(items), fresh);
    assert_eq!(store.cached_all("things").await.len(), 2);
}

#[tokio::test]
async fn too_many_changes_trip_the_comparator() {
    let fetcher = MockFetcher::new();
    fetcher.respond(
        "rest/things",
        json!((0..5).map(|i| json!({"UID": i.to_string(), "v": 1})).collect::<Vec<_>>()),
    );
    let (store, memory) = store(vec![things()], fetcher);
    for i in 0..5 {
        memory
            .put("things", &i.to_string(), json!({"UID": i.to_string(), "v": 0}))
            .await
            .unwrap();
    }

    let mut events = store.subscribe();
    store.refresh_all("things", false).await.unwrap();

    let received = drain(&mut events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind(), "resourceChanged");
}

#[tokio::test]
async fn duplicate_keys_are_rejected() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"UID": "A", "v": 1}, {"UID": "A", "v": 1}]));
    let (store, memory) = store(vec![things()], fetcher);
    memory.put("things", "A", json!({"UID": "A", "v": 1})).await.unwrap();
    memory.put("things", "B", json!({"UID": "B", "v": 1})).await.unwrap();

    let mut events = store.subscribe();
    let err = store.refresh_all("things", false).await.unwrap_err();

    assert_eq!(err, SwrError::DuplicateKey("A".into()));
    assert!(drain(&mut events).is_empty());
    assert_eq!(store.cached_all("things").await.len(), 2);
}

#[tokio::test]
async fn cache_first_reads_and_deduplication() {
    let fetcher = MockFetcher::with_delay(Duration::from_millis(50));
    fetcher.respond("rest/things", json!([{"UID": "A"}]));
    let (store, _) = store(vec![things()], fetcher.clone());
    store.configure(Duration::from_millis(300), Duration::ZERO);

    // Nothing cached yet: both calls return immediately and share one background fetch.
    assert!(store.get_all("things", &GetOptions::default()).await.unwrap().is_empty());
    assert!(store.get_all("things", &GetOptions::default()).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fetcher.calls("rest/things"), 1);

    // Within the expiry window.
    assert_eq!(store.get_all("things", &GetOptions::default()).await.unwrap().len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls("rest/things"), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let (a, b) = tokio::join!(
        store.refresh_all("things", false),
        store.refresh_all("things", false)
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(fetcher.calls("rest/things"), 2);
}

#[tokio::test]
async fn reconfiguring_forgets_freshness() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"UID": "A"}]));
    let (store, _) = store(vec![things()], fetcher.clone());

    store.refresh_all("things", false).await.unwrap();
    store.refresh_all("things", false).await.unwrap();
    assert_eq!(fetcher.calls("rest/things"), 1);

    store.configure(Duration::from_millis(50), Duration::ZERO);
    store.refresh_all("things", false).await.unwrap();
    assert_eq!(fetcher.calls("rest/things"), 2);

    // The new, shorter expiry applies.
    store.refresh_all("things", false).await.unwrap();
    assert_eq!(fetcher.calls("rest/things"), 2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.refresh_all("things", false).await.unwrap();
    assert_eq!(fetcher.calls("rest/things"), 3);
}

#[tokio::test]
async fn throttle_limits_attempts() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"UID": "A"}]));
    let (store, _) = store(vec![things()], fetcher.clone());
    store.configure(Duration::from_millis(1), Duration::from_secs(60));

    store.refresh_all("things", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.refresh_all("things", false).await.unwrap();
    assert_eq!(fetcher.calls("rest/things"), 1);

    store.refresh_all("things", true).await.unwrap();
    assert_eq!(fetcher.calls("rest/things"), 2);
}

#[tokio::test]
async fn forced_read_of_empty_cache_waits_for_network() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"UID": "A"}, {"UID": "B"}]));
    let (store, _) = store(vec![things()], fetcher);

    let records = store.get_all("things", &GetOptions::forced()).await.unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn single_record_fetch() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things/A", json!({"UID": "A", "label": "Lamp"}));
    let (store, _) = store(vec![things()], fetcher.clone());
    let mut events = store.subscribe();

    assert_eq!(store.get("things", Some("A"), &GetOptions::default()).await.unwrap(), None);
    assert_eq!(next_event(&mut events).await, StoreEvent::ItemAdded {
        table: "things".into(),
        value: json!({"UID": "A", "label": "Lamp"}),
    });
    // Let the refresh settle into the ledger.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cached = store.get("things", Some("A"), &GetOptions::default()).await.unwrap();
    assert_eq!(cached, Some(json!({"UID": "A", "label": "Lamp"})));
    assert_eq!(fetcher.calls("rest/things/A"), 1);

    let err = store.get("things", None, &GetOptions::default()).await.unwrap_err();
    assert_eq!(err, SwrError::MissingKey {
        table: "things".into(),
    });
}

#[tokio::test]
async fn bulk_only_tables_extract_records() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/links", json!([{"id": "x", "item": "Lamp"}, {"id": "y", "item": "Fan"}]));
    let links = TableDescriptor::rest("links", "rest/links").key("id").bulk_only();
    let (store, _) = store(vec![links], fetcher.clone());

    let record = store.get("links", Some("y"), &GetOptions::forced()).await.unwrap();
    assert_eq!(record, Some(json!({"id": "y", "item": "Fan"})));

    let err = store
        .get("links", Some("zzz"), &GetOptions::forced())
        .await
        .unwrap_err();
    assert_eq!(err, SwrError::NotFound {
        table: "links".into(),
        id:    "zzz".into(),
    });
    assert_eq!(fetcher.calls("rest/links"), 2);
}

#[tokio::test]
async fn wrapped_values() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things/A/status", json!({"status": "ONLINE"}));
    let status = TableDescriptor::rest("thing-status", "rest/things")
        .key("UID")
        .suffix("/status")
        .wrap("status");
    let (store, memory) = store(vec![status], fetcher);

    let value = store
        .get("thing-status", Some("A"), &GetOptions::forced())
        .await
        .unwrap();
    assert_eq!(value, Some(json!({"status": "ONLINE"})));
    assert_eq!(
        memory.get("thing-status", "A").await.unwrap(),
        Some(json!({"UID": "A", "status": {"status": "ONLINE"}}))
    );
}

#[tokio::test]
async fn unknown_table() {
    let (store, _) = store(vec![things()], MockFetcher::new());
    assert_eq!(
        store.get_all("nope", &GetOptions::default()).await.unwrap_err(),
        SwrError::UnknownTable("nope".into())
    );
}

#[tokio::test]
async fn demo_mode_serves_the_fixture() {
    let fetcher = MockFetcher::new();
    let about = TableDescriptor::rest("about", "rest/");
    let (store, _) = store(vec![things(), about.clone()], fetcher.clone());
    let mut events = store.subscribe();

    store.enable_demo_mode(json!({
        "things": [{"UID": "A"}, {"UID": "B"}],
        "about": {"version": "4.1"}
    }));
    store.reconnect("demo").await.unwrap();

    assert!(store.is_connected());
    let received = drain(&mut events);
    assert_eq!(received.last(), Some(&StoreEvent::ConnectionEstablished));
    assert_eq!(received.iter().filter(|e| e.kind() == "resourceChanged").count(), 2);

    assert_eq!(store.get_all("things", &GetOptions::forced()).await.unwrap().len(), 2);
    assert_eq!(store.cached("about", None).await.unwrap(), Some(json!({"version": "4.1"})));
    assert_eq!(store.block_reason(&about, None), Some(BlockReason::Offline));
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test]
async fn singleton_reads_share_one_fetch() {
    let fetcher = MockFetcher::with_delay(Duration::from_millis(50));
    fetcher.respond("rest/", json!({"version": "4"}));
    let (store, _) = store(vec![TableDescriptor::rest("about", "rest/")], fetcher.clone());

    let (all, one) = tokio::join!(
        store.refresh_all("about", true),
        store.refresh("about", None, true)
    );
    assert_eq!(all.unwrap(), vec![json!({"version": "4"})]);
    assert_eq!(one.unwrap(), Some(json!({"version": "4"})));
    assert_eq!(fetcher.calls("rest/"), 1);

    assert_eq!(
        store.get("about", None, &GetOptions::default()).await.unwrap(),
        Some(json!({"version": "4"}))
    );
}

#[tokio::test]
async fn virtual_tables_resolve_locally() {
    let fetcher = MockFetcher::new();
    let tags = TableDescriptor::virtual_table("tags", KeyField::from("name"), Arc::new(FieldIndex::new("items", "tags")));
    let (store, memory) = store(vec![items(), tags.clone()], fetcher.clone());
    memory
        .put("items", "A", json!({"name": "A", "tags": ["Light", "Indoor"]}))
        .await
        .unwrap();
    memory
        .put("items", "B", json!({"name": "B", "tags": ["Light"]}))
        .await
        .unwrap();

    assert_eq!(
        store.get_all("tags", &GetOptions::forced()).await.unwrap(),
        vec![json!({"name": "Indoor", "count": 1}), json!({"name": "Light", "count": 2})]
    );
    assert_eq!(
        store.get("tags", Some("Light"), &GetOptions::default()).await.unwrap(),
        Some(json!({"name": "Light", "count": 2}))
    );
    assert_eq!(store.get("tags", Some("Outdoor"), &GetOptions::default()).await.unwrap(), None);
    assert_eq!(store.block_reason(&tags, None), Some(BlockReason::Virtual));
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test]
async fn injected_rows_block_refresh_until_removed() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([]));
    let (store, _) = store(vec![things()], fetcher.clone());
    let mut events = store.subscribe();

    store
        .inject_row("things", json!({"UID": "tutorial", "label": "Demo"}))
        .await
        .unwrap();
    assert_eq!(store.block_reason(&things(), None), Some(BlockReason::Injected));
    assert_eq!(store.block_reason(&things(), Some("other")), None);

    let records = store.get_all("things", &GetOptions::forced()).await.unwrap();
    assert_eq!(records, vec![json!({"UID": "tutorial", "label": "Demo"})]);
    assert_eq!(fetcher.total_calls(), 0);

    store.remove_injected_rows().await.unwrap();
    assert_eq!(store.block_reason(&things(), None), None);
    assert!(store.cached_all("things").await.is_empty());

    let kinds = drain(&mut events).iter().map(|e| e.kind().to_string()).collect::<Vec<_>>();
    assert_eq!(kinds, vec!["itemAdded", "itemRemoved"]);
}

#[tokio::test]
async fn push_ingestion() {
    let (store, memory) = store(vec![items(), things()], MockFetcher::new());
    memory
        .put("items", "Lamp", json!({"name": "Lamp", "state": "OFF"}))
        .await
        .unwrap();
    let mut events = store.subscribe();

    store
        .ingest(&PushMessage::new(
            "openhab/items/Lamp/statechanged",
            "ItemStateChangedEvent",
            r#"{"type":"OnOff","value":"ON","oldValue":"OFF"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(drain(&mut events), vec![StoreEvent::ItemChanged {
        table: "items".into(),
        value: json!({"name": "Lamp", "state": "ON"}),
    }]);

    // Patching a record that hasn't arrived yet is a no-op.
    store
        .ingest(&PushMessage::new(
            "openhab/items/Ghost/statechanged",
            "ItemStateChangedEvent",
            r#"{"value":"ON"}"#,
        ))
        .await
        .unwrap();
    assert!(drain(&mut events).is_empty());

    store
        .ingest(&PushMessage::new(
            "openhab/things/B/added",
            "ThingAddedEvent",
            r#"{"UID":"B","label":"Fan"}"#,
        ))
        .await
        .unwrap();
    store
        .ingest(&PushMessage::new(
            "openhab/things/B/updated",
            "ThingUpdatedEvent",
            r#"[{"UID":"B","label":"Fan"},{"UID":"B","label":"Fan"}]"#,
        ))
        .await
        .unwrap();
    store
        .ingest(&PushMessage::new(
            "openhab/things/B/removed",
            "ThingRemovedEvent",
            r#"{"UID":"B"}"#,
        ))
        .await
        .unwrap();
    store
        .ingest(&PushMessage::new("openhab/items/Lamp/triggered", "ChannelTriggeredEvent", "{}"))
        .await
        .unwrap();
    store.ingest(&PushMessage::default()).await.unwrap();

    // The identical update is a no-op.
    let kinds = drain(&mut events).iter().map(|e| e.kind().to_string()).collect::<Vec<_>>();
    assert_eq!(kinds, vec!["itemAdded", "itemRemoved"]);
    assert_eq!(memory.get("things", "B").await.unwrap(), None);
}

#[tokio::test]
async fn reconnect_preloads_and_listens() {
    let fetcher = MockFetcher::new();
    fetcher.respond("rest/things", json!([{"UID": "A", "label": "old"}]));
    let push = MockPush {
        messages: vec![PushMessage::new(
            "openhab/things/A/updated",
            "ThingUpdatedEvent",
            r#"[{"UID":"A","label":"pushed"},{"UID":"A","label":"old"}]"#,
        )],
    };
    let memory: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
    let store = Store::builder()
        .tables(TableSet::new(vec![things().preload(), items()]).unwrap())
        .fetcher(fetcher.clone())
        .storage(memory)
        .push_source(Arc::new(push))
        .build()
        .unwrap();
    let mut events = store.subscribe();

    store.reconnect("http://openhab:8080").await.unwrap();
    assert!(store.is_connected());
    assert_eq!(fetcher.calls("rest/things"), 1);
    assert_eq!(fetcher.calls("rest/items"), 0);

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        let done = matches!(event, StoreEvent::ItemChanged { .. });
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(seen.contains(&StoreEvent::ConnectionEstablished));
    assert_eq!(
        store.cached("things", Some("A")).await.unwrap(),
        Some(json!({"UID": "A", "label": "pushed"}))
    );

    store.dispose();
}

#[tokio::test]
async fn reconnect_failure_is_classified() {
    let fetcher = MockFetcher::new();
    fetcher.fail("rest/things", FetchError::new("TypeError: cross-origin request blocked"));
    let (store, _) = store(vec![things().preload()], fetcher);
    let mut events = store.subscribe();

    let err = store.reconnect("http://elsewhere").await.unwrap_err();
    assert!(matches!(err, SwrError::Fetch(_)));
    assert!(!store.is_connected());

    let StoreEvent::ConnectionLost { code, .. } = next_event(&mut events).await
    else {
        panic!("Expected connectionLost");
    };
    assert_eq!(code, 403);
}

#[tokio::test]
async fn storage_failure_on_reconnect_is_reported() {
    let storage: Arc<dyn LocalStorage> = Arc::new(UnopenableStorage::default());
    let store = Store::builder()
        .tables(TableSet::new(vec![things().preload()]).unwrap())
        .fetcher(MockFetcher::new())
        .storage(storage)
        .build()
        .unwrap();
    let mut events = store.subscribe();

    let err = store.reconnect("http://openhab:8080").await.unwrap_err();
    assert_eq!(err, SwrError::Storage("quota exceeded".into()));
    assert!(!store.is_connected());

    let StoreEvent::ConnectionLost { code, message } = next_event(&mut events).await
    else {
        panic!("Expected connectionLost");
    };
    assert_eq!(code, 404);
    assert!(message.contains("quota exceeded"));
}

#[tokio::test]
async fn dump_refreshes_and_exports() {
    let fetcher = MockFetcher::with_delay(Duration::from_millis(20));
    fetcher.respond("rest/things", json!([{"UID": "A"}]));
    fetcher.respond("rest/items", json!([{"name": "Lamp"}, {"name": "Fan"}]));
    let (store, _) = store(vec![things(), items()], fetcher);
    let mut events = store.subscribe();

    let (first, second) = tokio::join!(store.dump(), store.dump());
    assert_eq!(second.unwrap_err(), SwrError::DumpInProgress);

    let dump = first.unwrap();
    assert_eq!(dump.layout_version, 1);
    assert_eq!(dump.tables["things"].len(), 1);
    assert_eq!(dump.tables["items"].len(), 2);

    let progress = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            StoreEvent::DumpProgress { done, total, .. } => Some((done, total)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(progress, vec![(1, 2), (2, 2)]);

    // Guard is released.
    assert!(store.dump().await.is_ok());
}

#[tokio::test]
async fn dispose_discards_in_flight_results() {
    let fetcher = MockFetcher::with_delay(Duration::from_millis(100));
    fetcher.respond("rest/things", json!([{"UID": "A"}]));
    let (store, memory) = store(vec![things()], fetcher);

    let in_flight = tokio::spawn({
        let store = store.clone();
        async move { store.refresh_all("things", true).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.dispose();

    assert_eq!(in_flight.await.unwrap().unwrap_err(), SwrError::Disposed);
    assert!(memory.get_all("things").await.unwrap().is_empty());
    assert_eq!(
        store.get_all("things", &GetOptions::default()).await.unwrap_err(),
        SwrError::Disposed
    );
    assert!(store.is_disposed());
}

#[tokio::test]
async fn abandoned_dump_releases_the_guard() {
    let fetcher = MockFetcher::with_delay(Duration::from_millis(200));
    fetcher.respond("rest/things", json!([{"UID": "A"}]));
    let (store, _) = store(vec![things()], fetcher);

    assert!(tokio::time::timeout(Duration::from_millis(10), store.dump()).await.is_err());

    let dump = store.dump().await.unwrap();
    assert_eq!(dump.tables["things"].len(), 1);
}
