use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use reservd::auth::CredentialStore;
use reservd::engine::{Engine, EngineSettings};
use reservd::notify::NotifyHub;
use reservd::server::{self, ServerContext};
use reservd::store::InMemoryStore;

const H: i64 = 3_600_000; // 1 hour in ms

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let engine = Arc::new(Engine::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(NotifyHub::new()),
        EngineSettings::default(),
    ));
    let credentials = Arc::new(CredentialStore::new([
        ("alice".to_string(), "alice-pw".to_string()),
        ("bob".to_string(), "bob-pw".to_string()),
    ]));
    let ctx = ServerContext::new(engine.clone(), credentials, None, 64);
    tokio::spawn(server::serve(listener, ctx, std::future::pending()));

    (addr, engine)
}

async fn try_connect(addr: SocketAddr, user: &str, password: &str) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("reservd")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    try_connect(addr, user, &format!("{user}-pw")).await.unwrap()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Result<Vec<SimpleQueryRow>, tokio_postgres::Error> {
    Ok(client
        .simple_query(sql)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect())
}

fn insert_sql(resource: &str, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO reservations (resource, start, "end") VALUES ('{resource}', {start}, {end})"#)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_then_list() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    alice.batch_execute(&insert_sql("RoomA", 10 * H, 11 * H)).await.unwrap();

    let listed = rows(&alice, "SELECT * FROM reservations").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("resource"), Some("RoomA"));
    assert_eq!(listed[0].get("start"), Some((10 * H).to_string().as_str()));
    assert_eq!(listed[0].get("end"), Some((11 * H).to_string().as_str()));
    assert_eq!(listed[0].get("owner"), Some("alice"));
    assert_eq!(listed[0].get("id").map(str::len), Some(26));
}

#[tokio::test]
async fn returning_yields_committed_row() {
    let (addr, engine) = start_test_server().await;
    let bob = connect(addr, "bob").await;

    let sql = format!("{} RETURNING *", insert_sql("RoomA", 10 * H, 11 * H));
    let returned = rows(&bob, &sql).await.unwrap();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].get("owner"), Some("bob"));

    let committed = engine
        .list_reservations(&reservd::engine::ReservationFilter::default())
        .await
        .unwrap();
    assert_eq!(returned[0].get("id"), Some(committed[0].id.to_string().as_str()));
}

#[tokio::test]
async fn overlap_is_exclusion_violation() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;

    alice.batch_execute(&insert_sql("RoomA", 10 * H, 11 * H)).await.unwrap();
    let err = bob
        .batch_execute(&insert_sql("RoomA", 10 * H + H / 2, 11 * H + H / 2))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains("RoomA"));
    assert!(!message.contains("alice"));

    // Touching is fine.
    bob.batch_execute(&insert_sql("RoomA", 11 * H, 12 * H)).await.unwrap();
}

#[tokio::test]
async fn invalid_interval_rejected() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let err = alice
        .batch_execute(&insert_sql("RoomA", 11 * H, 10 * H))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let listed = rows(&alice, "SELECT * FROM reservations").await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn owner_cannot_be_supplied() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let err = alice
        .batch_execute(r#"INSERT INTO reservations (resource, start, "end", owner) VALUES ('RoomA', 0, 10, 'bob')"#)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
}

#[tokio::test]
async fn syntax_error_reported() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let err = alice.batch_execute("INSERT INTO").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn wrong_password_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(try_connect(addr, "alice", "not-it").await.is_err());
    assert!(try_connect(addr, "mallory", "anything").await.is_err());
    assert!(try_connect(addr, "alice", "alice-pw").await.is_ok());
}

#[tokio::test]
async fn listing_filters() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;

    alice.batch_execute(&insert_sql("RoomA", 10 * H, 11 * H)).await.unwrap();
    bob.batch_execute(&insert_sql("RoomA", 11 * H, 12 * H)).await.unwrap();
    bob.batch_execute(&insert_sql("RoomB", 10 * H, 11 * H)).await.unwrap();

    let room_a = rows(&alice, "SELECT * FROM reservations WHERE resource = 'RoomA'").await.unwrap();
    assert_eq!(room_a.len(), 2);
    assert_eq!(room_a[0].get("owner"), Some("alice"));
    assert_eq!(room_a[1].get("owner"), Some("bob"));

    let bobs = rows(&alice, "SELECT * FROM reservations WHERE owner = 'bob'").await.unwrap();
    assert_eq!(bobs.len(), 2);

    let both = rows(
        &alice,
        "SELECT * FROM reservations WHERE resource = 'RoomB' AND owner = 'bob'",
    )
    .await
    .unwrap();
    assert_eq!(both.len(), 1);
}

#[tokio::test]
async fn extended_protocol_insert() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let start = (10 * H).to_string();
    let end = (11 * H).to_string();
    let inserted = alice
        .execute(
            r#"INSERT INTO reservations (resource, start, "end") VALUES ($1, $2, $3)"#,
            &[&"RoomA", &start.as_str(), &end.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let err = alice
        .execute(
            r#"INSERT INTO reservations (resource, start, "end") VALUES ($1, $2, $3)"#,
            &[&"RoomA", &start.as_str(), &end.as_str()],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_exactly_one_wins() {
    let (addr, engine) = start_test_server().await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let user = if i % 2 == 0 { "alice" } else { "bob" };
        handles.push(tokio::spawn(async move {
            let client = connect(addr, user).await;
            client.batch_execute(&insert_sql("RoomA", 14 * H, 15 * H)).await
        }));
    }

    let mut committed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => committed += 1,
            Err(e) => assert_eq!(e.code(), Some(&SqlState::EXCLUSION_VIOLATION)),
        }
    }
    assert_eq!(committed, 1);

    let listed = engine
        .list_reservations(&reservd::engine::ReservationFilter::resource("RoomA"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}
