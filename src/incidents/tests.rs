use super::*;
use crate::messaging::lifecycle::CollectingSink;
use crate::store::MemoryStore;

fn manager() -> (IncidentManager, Arc<MemoryStore>, Arc<CollectingSink>) {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let manager = IncidentManager::new(store.clone(), LifecycleEvents::new(sink.clone()));
    (manager, store, sink)
}

fn manual(title: &str) -> NewIncident {
    NewIncident {
        title: title.to_string(),
        description: None,
        severity: Severity::High,
        source: SourceRef::Manual,
        media_refs: vec![],
        actor: "operator@site".to_string(),
    }
}

fn rule_source(rule_id: Uuid, subject: &str) -> SourceRef {
    SourceRef::Rule {
        rule_id,
        subject: subject.to_string(),
        alert_event_id: Uuid::new_v4(),
        cooldown: Duration::seconds(60),
    }
}

#[tokio::test]
async fn create_sets_sla_and_emits_event() -> Result<()> {
    let (manager, store, sink) = manager();
    let at = Utc::now();
    let outcome = manager.create(manual("Door forced"), at).await?;

    let incident = outcome.incident().clone();
    assert!(outcome.is_created());
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.sla_minutes, 60);
    assert_eq!(incident.due_at, at + Duration::minutes(60));
    assert_eq!(store.incidents().await.len(), 1);
    assert_eq!(sink.of_type(&EventType::IncidentCreated).len(), 1);

    let transitions = manager.transitions(incident.id).await?;
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from_status, None);
    assert_eq!(transitions[0].actor, "operator@site");
    Ok(())
}

#[tokio::test]
async fn lifecycle_moves_forward_only() -> Result<()> {
    let (manager, _store, sink) = manager();
    let id = manager.create(manual("Tailgating"), Utc::now()).await?.incident().id;

    let acked = manager.acknowledge(id, "alice", Some("on it".to_string())).await?;
    assert_eq!(acked.status, IncidentStatus::Acknowledged);
    assert_eq!(acked.acknowledged_by.as_deref(), Some("alice"));

    let resolved = manager.resolve(id, "bob", None).await?;
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    let err = manager.acknowledge(id, "alice", None).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTransition(_))));
    let err = manager.resolve(id, "alice", None).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTransition(_))));

    let transitions = manager.transitions(id).await?;
    let path: Vec<_> = transitions.iter().map(|t| (t.from_status, t.to_status)).collect();
    assert_eq!(
        path,
        vec![
            (None, IncidentStatus::Open),
            (Some(IncidentStatus::Open), IncidentStatus::Acknowledged),
            (Some(IncidentStatus::Acknowledged), IncidentStatus::Resolved),
        ]
    );
    assert_eq!(sink.of_type(&EventType::IncidentResolved).len(), 1);
    Ok(())
}

#[tokio::test]
async fn open_can_resolve_directly_but_not_acknowledge_twice() -> Result<()> {
    let (manager, _store, _sink) = manager();
    let id = manager.create(manual("Glass break"), Utc::now()).await?.incident().id;
    manager.acknowledge(id, "alice", None).await?;
    assert!(manager.acknowledge(id, "alice", None).await.is_err());

    let other = manager.create(manual("Smoke"), Utc::now()).await?.incident().id;
    let resolved = manager.resolve(other, "bob", None).await?;
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    Ok(())
}

#[tokio::test]
async fn media_is_append_only_until_resolved() -> Result<()> {
    let (manager, _store, sink) = manager();
    let id = manager.create(manual("Intruder"), Utc::now()).await?.incident().id;

    manager.attach_media(id, "s3://bucket/a.jpg", "alice").await?;
    manager.acknowledge(id, "alice", None).await?;
    let incident = manager.attach_media(id, "s3://bucket/b.jpg", "alice").await?;
    assert_eq!(incident.media_refs, vec!["s3://bucket/a.jpg", "s3://bucket/b.jpg"]);
    assert_eq!(sink.of_type(&EventType::IncidentMediaAttached).len(), 2);

    manager.resolve(id, "alice", None).await?;
    let err = manager.attach_media(id, "s3://bucket/c.jpg", "alice").await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTransition(_))));
    assert!(manager.attach_media(id, "  ", "alice").await.is_err());
    Ok(())
}

#[tokio::test]
async fn rule_incidents_are_deduplicated_within_cooldown() -> Result<()> {
    let (manager, store, _sink) = manager();
    let rule_id = Uuid::new_v4();
    let t0 = Utc::now();

    let mut new = manual("[AUTO] weak signal");
    new.source = rule_source(rule_id, "pair:A@B");
    let first = manager.create(new.clone(), t0).await?;
    assert!(first.is_created());

    new.source = rule_source(rule_id, "pair:A@B");
    let second = manager.create(new.clone(), t0 + Duration::seconds(30)).await?;
    assert!(matches!(second, CreateOutcome::Duplicate(ref i) if i.id == first.incident().id));

    new.source = rule_source(rule_id, "pair:C@B");
    assert!(manager.create(new.clone(), t0 + Duration::seconds(30)).await?.is_created());

    // outside the window a new incident is allowed even while the old one is open
    new.source = rule_source(rule_id, "pair:A@B");
    assert!(manager.create(new.clone(), t0 + Duration::seconds(61)).await?.is_created());

    assert_eq!(store.incidents().await.len(), 3);
    Ok(())
}

#[tokio::test]
async fn resolved_rule_incident_does_not_block_new_one() -> Result<()> {
    let (manager, _store, _sink) = manager();
    let rule_id = Uuid::new_v4();
    let t0 = Utc::now();

    let mut new = manual("[AUTO] absent");
    new.source = rule_source(rule_id, "tag:A");
    let first = manager.create(new.clone(), t0).await?;
    manager.resolve(first.incident().id, "alice", None).await?;

    new.source = rule_source(rule_id, "tag:A");
    assert!(manager.create(new, t0 + Duration::seconds(5)).await?.is_created());
    Ok(())
}

#[tokio::test]
async fn face_capture_is_deduplicated_per_camera_event() -> Result<()> {
    let (manager, _store, _sink) = manager();
    let camera_event_id = Uuid::new_v4();
    let mut new = manual("[AUTO] Face capture");
    new.source = SourceRef::FaceCapture { camera_event_id };

    assert!(manager.create(new.clone(), Utc::now()).await?.is_created());
    assert!(!manager.create(new, Utc::now()).await?.is_created());
    Ok(())
}

#[tokio::test]
async fn concurrent_rule_creation_yields_single_incident() -> Result<()> {
    let (manager, store, _sink) = manager();
    let manager = Arc::new(manager);
    let rule_id = Uuid::new_v4();
    let at = Utc::now();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        let mut new = manual("[AUTO] burst");
        new.source = rule_source(rule_id, "gateway:GW");
        handles.push(tokio::spawn(async move { manager.create(new, at).await }));
    }
    let mut created = 0;
    for handle in handles {
        if handle.await??.is_created() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(store.incidents().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_incident_is_not_found() {
    let (manager, _store, _sink) = manager();
    let err = manager.acknowledge(Uuid::new_v4(), "alice", None).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
}

#[tokio::test]
async fn empty_title_is_rejected() {
    let (manager, _store, _sink) = manager();
    assert!(manager.create(manual("   "), Utc::now()).await.is_err());
}
