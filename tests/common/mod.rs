#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use clinflow::Store;
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

/// A migrated store on a throwaway Postgres. Keep the container alive for the
/// duration of the test.
pub async fn start_store() -> Result<(ContainerAsync<GenericImage>, Store)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let url = database_url(&container).await?;

    let store = Store::connect(&url).await?;
    clinflow::testing::migrate_core_schema(store.pool()).await?;
    Ok((container, store))
}

pub async fn database_url(container: &ContainerAsync<GenericImage>) -> Result<String> {
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    Ok(format!(
        "postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable"
    ))
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}
