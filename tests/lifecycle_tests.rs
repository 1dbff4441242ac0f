mod helpers;

use helpers::*;
use iot_monitor::lifecycle::{bootstrap, shutdown};
use iot_monitor::models::{NewBroker, NewTopic};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn bootstrap_registers_every_stored_broker() {
    let (db, _dir) = setup_store();
    let mut ids = Vec::new();
    for host in ["a.local", "b.local"] {
        let broker = db
            .create_broker(&NewBroker {
                host: host.to_string(),
                port: 1883,
                ..Default::default()
            })
            .unwrap();
        db.create_topic(&NewTopic {
            topic: format!("{}/temp", host),
            broker_id: broker.id.clone(),
            is_active: true,
        })
        .unwrap();
        ids.push(broker.id);
    }

    let connector = ScriptedConnector::always(Outcome::Accept);
    let (registry, _) = setup_registry(&connector, &db, None);

    let registered = bootstrap(db.clone(), registry.clone(), Duration::from_millis(50)).await;
    assert_eq!(registered, 2);

    assert!(eventually(WAIT, || async {
        let statuses = registry.status().await;
        statuses.len() == 2 && statuses.iter().all(|s| s.subscribed_topics.len() == 1)
    })
    .await);

    // A second pass finds everything already registered.
    assert_eq!(bootstrap(db.clone(), registry.clone(), Duration::from_millis(50)).await, 0);

    shutdown(&registry).await;
    assert!(registry.status().await.is_empty());
    assert!(eventually(WAIT, || async { connector.live_links() == 0 }).await);
}

#[tokio::test]
async fn bootstrap_with_empty_store_registers_nothing() {
    let (db, _dir) = setup_store();
    let connector = ScriptedConnector::always(Outcome::Accept);
    let (registry, _) = setup_registry(&connector, &db, None);

    assert_eq!(bootstrap(db, registry.clone(), Duration::from_millis(50)).await, 0);
    assert!(registry.status().await.is_empty());
    assert_eq!(connector.open_count(), 0);
}

#[tokio::test]
async fn bootstrap_retries_until_the_store_answers() {
    let (db, _dir) = setup_uninitialized_store();
    let connector = ScriptedConnector::always(Outcome::Accept);
    let (registry, _) = setup_registry(&connector, &db, None);

    let loading = tokio::spawn(bootstrap(db.clone(), registry.clone(), Duration::from_millis(300)));

    // The first load hits the missing schema; repair the store before the retry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!loading.is_finished());
    db.initialize_db().unwrap();
    let broker = db
        .create_broker(&NewBroker {
            host: "late.local".to_string(),
            port: 1883,
            ..Default::default()
        })
        .unwrap();

    let registered = tokio::time::timeout(WAIT, loading).await.unwrap().unwrap();
    assert_eq!(registered, 1);

    let statuses = registry.status().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].broker_id, broker.id);
    assert!(eventually(WAIT, || async { registry.status().await[0].is_connected }).await);
}
