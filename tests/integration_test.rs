//! Integration tests for deskbase against the embedded backend.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::too_many_lines,
    clippy::doc_markdown
)]

use deskbase::config::{ENV_DB_TYPE, EnvSource};
use deskbase::notify::{
    MailSender, Notification, NotificationKind, Notifier, OutboundEmail, TemplateStore,
};
use deskbase::pipeline::DEFAULT_QUEUE_CAPACITY;
use deskbase::{
    AuditEntry, AuditLogger, ConfigDescriptor, ConfigLoader, ConnectionManager, Error, HitCount,
    QueryResult, RateLimitPolicy, RateLimiter, SettingsStore, SideEffectWorker,
    SqlValue,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

async fn embedded_manager(dir: &TempDir) -> (ConfigLoader, Arc<ConnectionManager>) {
    let loader = ConfigLoader::with_env(dir.path(), EnvSource::empty());
    let manager = Arc::new(ConnectionManager::with_env(
        loader.paths().clone(),
        EnvSource::empty(),
    ));
    loader
        .save(&ConfigDescriptor::embedded(), &manager)
        .await
        .expect("save embedded config");
    (loader, manager)
}

#[test]
fn test_error_types() {
    let err = Error::ConfigValidation {
        cause: "connection refused".to_string(),
    };
    assert!(err.to_string().contains("configuration validation failed"));
    assert!(err.to_string().contains("connection refused"));

    let err = Error::FeatureNotEnabled("postgres".to_string());
    assert!(err.to_string().contains("--features postgres"));
}

#[tokio::test]
async fn test_saved_config_survives_restart() {
    let dir = TempDir::new().expect("temp dir");
    let (loader, manager) = embedded_manager(&dir).await;
    assert!(manager.is_initialized());
    assert!(loader.paths().data_file().exists());

    let backend = manager.active().expect("active");
    backend
        .execute(
            "INSERT INTO settings (key, value) VALUES (?, ?)",
            &["site_name".into(), "Main Library".into()],
        )
        .await
        .expect("insert");
    manager.shutdown().await;

    // A fresh process reads the persisted descriptor.
    let reloaded = ConfigLoader::with_env(dir.path(), EnvSource::empty());
    let descriptor = reloaded.load().expect("load").expect("descriptor");
    let manager = ConnectionManager::with_env(reloaded.paths().clone(), EnvSource::empty());
    manager.initialize(&descriptor).await.expect("initialize");

    let rows = manager
        .active()
        .expect("active")
        .query_rows("SELECT value FROM settings WHERE key = ?", &["site_name".into()])
        .await
        .expect("select");
    assert_eq!(rows[0]["value"], json!("Main Library"));
}

#[tokio::test]
async fn test_environment_overrides_persisted_file() {
    let dir = TempDir::new().expect("temp dir");
    embedded_manager(&dir).await;

    let env = EnvSource::from_pairs([
        ("DB_HOST", "db.internal"),
        ("DB_USER", "desk"),
        ("DB_NAME", "feedback"),
    ]);
    let loader = ConfigLoader::with_env(dir.path(), env);
    let descriptor = loader.load().expect("load").expect("descriptor");
    assert_eq!(descriptor.host.as_deref(), Some("db.internal"));
    assert_eq!(descriptor.port_or_default(), 5432);
}

#[tokio::test]
async fn test_query_contract() {
    let dir = TempDir::new().expect("temp dir");
    let (_, manager) = embedded_manager(&dir).await;
    let backend = manager.active().expect("active");

    let write = backend
        .query(
            "INSERT INTO audit_logs (action, target_type, target_id, created_at) VALUES (?, ?, ?, ?)",
            &[
                "ticket.create".into(),
                "ticket".into(),
                "42".into(),
                "2026-03-01T08:00:00+00:00".into(),
            ],
        )
        .await
        .expect("insert");
    let QueryResult::Write(summary) = write else {
        panic!("expected write summary");
    };
    assert_eq!(summary.affected_count, 1);
    assert!(summary.inserted_id.is_some());
    assert_eq!(summary.warning_count, 0);

    let read = backend
        .query(
            "SELECT action, actor_id FROM audit_logs WHERE target_id = ?",
            &["42".into()],
        )
        .await
        .expect("select");
    let rows = read.rows().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["action"], json!("ticket.create"));
    assert_eq!(rows[0]["actor_id"], json!(null));

    let empty = backend
        .query("SELECT * FROM audit_logs WHERE target_id = ?", &[SqlValue::from("missing")])
        .await
        .expect("select");
    assert_eq!(empty.rows().map(<[_]>::len), Some(0));

    let err = backend.query("SELECT * FROM no_such_table", &[]).await;
    assert!(matches!(err, Err(Error::Sqlite(_))));
}

#[tokio::test]
async fn test_scoped_transaction_rolls_back_on_drop() {
    let dir = TempDir::new().expect("temp dir");
    let (_, manager) = embedded_manager(&dir).await;
    let backend = manager.active().expect("active");

    {
        let mut conn = backend.connection().await.expect("checkout");
        conn.begin().await.expect("begin");
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?, ?)",
            &["draft".into(), "1".into()],
        )
        .await
        .expect("insert");
    }

    let rows = backend
        .query_rows("SELECT key FROM settings WHERE key = ?", &["draft".into()])
        .await
        .expect("select");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_rate_limit_window() {
    let dir = TempDir::new().expect("temp dir");
    let (_, manager) = embedded_manager(&dir).await;
    let policy = RateLimitPolicy::default()
        .with_max_hits(5)
        .with_window_secs(60);
    let limiter = RateLimiter::new(Arc::clone(&manager), policy);
    let store = limiter.store().clone();

    for expected_remaining in (0..5).rev() {
        let decision = limiter.check("ip:192.0.2.7").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
    }
    let blocked = limiter.check("ip:192.0.2.7").await;
    assert!(!blocked.allowed);
    assert!(blocked.counted);

    store.reset_key("ip:192.0.2.7").await;
    let after_reset = store.increment("ip:192.0.2.7").await;
    assert_eq!(after_reset.total_hits(), 1);

    store.decrement("ip:192.0.2.7").await;
    store.decrement("ip:192.0.2.7").await;
    let record = store.get("ip:192.0.2.7").await.expect("get").expect("record");
    assert_eq!(record.hit_count, 0);
}

#[tokio::test]
async fn test_rate_limit_fails_open_without_backend() {
    let dir = TempDir::new().expect("temp dir");
    let manager = Arc::new(ConnectionManager::with_env(
        deskbase::ConfigPaths::new(dir.path()),
        EnvSource::empty(),
    ));
    let policy = RateLimitPolicy::default();
    let limiter = RateLimiter::new(manager, policy);

    let decision = limiter.check("ip:198.51.100.1").await;
    assert!(decision.allowed);
    assert!(!decision.counted);

    let hit = limiter.store().increment("ip:198.51.100.1").await;
    assert!(matches!(hit, HitCount::Unavailable { .. }));
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
}

impl MailSender for RecordingMailer {
    fn send(&self, email: &OutboundEmail) -> deskbase::Result<()> {
        self.sent.lock().expect("lock").push(email.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_side_effects_are_delivered_after_enqueue() {
    let dir = TempDir::new().expect("temp dir");
    let (_, manager) = embedded_manager(&dir).await;
    let settings = SettingsStore::new(Arc::clone(&manager));
    settings
        .set_setting(
            &NotificationKind::TicketReply.setting_key(),
            &json!({"subject": "Re: {title}", "body": "{replier} wrote: {content}"}),
        )
        .await
        .expect("set template");

    let mailer = Arc::new(RecordingMailer::default());
    let notifier = Notifier::new(TemplateStore::new(settings))
        .with_mailer(Arc::clone(&mailer) as Arc<dyn MailSender>);
    let audit = AuditLogger::new(Arc::clone(&manager));
    let (effects, worker) =
        SideEffectWorker::start(audit.clone(), Some(notifier), DEFAULT_QUEUE_CAPACITY);

    assert!(effects.audit(
        AuditEntry::new("ticket.reply")
            .with_actor(3, "circulation desk")
            .with_target("ticket", 42)
            .with_details(json!({"status": "in_progress"}))
            .with_ip("::FFFF:203.0.113.9"),
    ));
    assert!(effects.notify(
        Notification::new(NotificationKind::TicketReply)
            .to("reader@lib.example.edu")
            .var("title", "Broken scanner")
            .var("replier", "Circulation")
            .var("content", "{title} is fixed"),
    ));
    drop(effects);

    let processed = tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("worker finished")
        .expect("worker joined");
    assert_eq!(processed, 2);

    let entries = audit.for_target("ticket", "42").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ip_address.as_deref(), Some("203.0.113.9"));
    assert_eq!(entries[0].details, json!({"status": "in_progress"}));

    let sent = mailer.sent.lock().expect("lock");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Re: Broken scanner");
    assert_eq!(sent[0].body, "Circulation wrote: {title} is fixed");
}

#[tokio::test]
async fn test_reinitialize_swaps_handle() {
    let dir = TempDir::new().expect("temp dir");
    let (loader, manager) = embedded_manager(&dir).await;
    let before = manager.generation();
    let old = manager.active().expect("active");

    loader
        .save(&ConfigDescriptor::embedded(), &manager)
        .await
        .expect("save again");

    assert_eq!(manager.generation(), before + 1);
    assert!(old.probe().await.is_err());
    manager
        .active()
        .expect("active")
        .probe()
        .await
        .expect("new handle answers");
}

#[tokio::test]
async fn test_env_selected_embedded_backend() {
    let dir = TempDir::new().expect("temp dir");
    let env = EnvSource::from_pairs([(ENV_DB_TYPE, "sqlite")]);
    let loader = ConfigLoader::with_env(dir.path(), env.clone());
    assert!(loader.is_configured());

    let manager = ConnectionManager::with_env(loader.paths().clone(), env);
    let descriptor = loader.load().expect("load").expect("descriptor");
    manager.initialize(&descriptor).await.expect("initialize");
    assert!(manager.is_initialized());
}

#[cfg(feature = "postgres")]
#[tokio::test]
async fn test_unreachable_relational_target_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let (loader, manager) = embedded_manager(&dir).await;
    let generation = manager.generation();

    let descriptor = ConfigDescriptor::relational("127.0.0.1", "desk", "feedback")
        .with_port(1)
        .with_password("secret");
    let result = loader.save(&descriptor, &manager).await;

    assert!(matches!(result, Err(Error::ConfigValidation { .. })));
    // The previous embedded configuration stays in force.
    let stored = loader.load().expect("load").expect("descriptor");
    assert_eq!(stored.kind, deskbase::BackendKind::Embedded);
    assert_eq!(manager.generation(), generation);
    assert!(manager.is_initialized());
}
