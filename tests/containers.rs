//! Per-class environments against a real PostgreSQL container.
//!
//! Needs a running Docker daemon: `cargo test --features container-tests`.

#![cfg(feature = "container-tests")]

mod common;

use std::time::Duration;

use common::accepts_connections;
use dbharness::{
    run_class, AppContext, HarnessConfig, HarnessError, Provisioner, ProvisioningError,
    Testcontainers,
};

#[tokio::test]
async fn test_application_boots_against_ephemeral_postgres() {
    let _ = env_logger::builder().is_test(true).try_init();

    let endpoint = run_class::<AppContext, _, _, _>(
        "postgres-smoke",
        Testcontainers,
        HarnessConfig::default(),
        |env| {
            Box::pin(async move {
                let endpoint = env.endpoint().unwrap();
                assert!(endpoint.database.starts_with("harness_"));

                let client = env.app().pool.get().await.unwrap();
                let row = client
                    .query_one("SELECT current_database()", &[])
                    .await
                    .unwrap();
                let database: String = row.get(0);
                assert_eq!(database, endpoint.database);

                client
                    .batch_execute("CREATE TABLE orders (id BIGINT PRIMARY KEY, item TEXT NOT NULL)")
                    .await
                    .unwrap();
                client
                    .execute("INSERT INTO orders (id, item) VALUES ($1, $2)", &[&1i64, &"book"])
                    .await
                    .unwrap();
                let row = client
                    .query_one("SELECT item FROM orders WHERE id = $1", &[&1i64])
                    .await
                    .unwrap();
                assert_eq!(row.get::<_, String>(0), "book");
                drop(client);

                let response = reqwest::get(format!("{}/health", env.app().base_url()))
                    .await
                    .unwrap();
                assert_eq!(response.status(), reqwest::StatusCode::OK);
                assert_eq!(response.text().await.unwrap(), "UP");

                endpoint
            })
        },
    )
    .await
    .unwrap();

    assert!(!accepts_connections(endpoint.port));
}

#[tokio::test]
async fn test_classes_do_not_share_state() {
    let config = HarnessConfig::default();

    for class in ["first", "second"] {
        run_class::<AppContext, _, _, _>(class, Testcontainers, config.clone(), |env| {
            Box::pin(async move {
                let client = env.app().pool.get().await.unwrap();
                // Fails if a previous class's table survived
                client
                    .batch_execute("CREATE TABLE marker (id INT)")
                    .await
                    .unwrap();
            })
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_unknown_image_tag_fails_provisioning() {
    let config = HarnessConfig {
        image: "postgres:no-such-tag-for-dbharness".to_string(),
        startup_timeout_secs: 30,
        ..Default::default()
    };

    let mut body_ran = false;
    let result = run_class::<AppContext, _, _, _>("missing-image", Testcontainers, config, |_env| {
        body_ran = true;
        Box::pin(async {})
    })
    .await;

    assert!(
        matches!(result, Err(HarnessError::Provisioning(_))),
        "unexpected result: {result:?}"
    );
    assert!(!body_ran);
}

#[tokio::test]
async fn test_provisioner_start_and_stop() {
    let provisioner = Provisioner::new(Testcontainers, HarnessConfig::default());
    let endpoint = provisioner.start().await.unwrap();

    let (client, connection) = tokio_postgres::connect(
        &format!(
            "host={} port={} user={} password={} dbname={}",
            endpoint.host, endpoint.port, endpoint.username, endpoint.password, endpoint.database
        ),
        tokio_postgres::NoTls,
    )
    .await
    .unwrap();
    tokio::spawn(connection);
    client.simple_query("SELECT 1").await.unwrap();
    drop(client);

    provisioner.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!accepts_connections(endpoint.port));
    assert!(matches!(provisioner.endpoint(), Err(ProvisioningError::Stopped)));
}
