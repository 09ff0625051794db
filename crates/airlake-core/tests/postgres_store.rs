use std::env;

use airlake_core::config::CurationConfig;
use airlake_core::db::{self, quote_ident, PostgresSink, PostgresSource};
use airlake_core::engine::CurationEngine;
use airlake_core::store::{TableSink, TableSource, WriteMode};
use anyhow::Result;
use polars::prelude::*;

#[tokio::test]
async fn curates_staging_schema_into_postgres_when_database_available() -> Result<()> {
    let database_url = match env::var("AIRLAKE_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping postgres test because AIRLAKE_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let pool = db::connect(&database_url, 2).await?;
    let staging = "airlake_test_staging";
    let curated = "airlake_test_curated";
    for schema in [staging, curated] {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
            .execute(&pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {}", quote_ident(schema)))
            .execute(&pool)
            .await?;
    }
    sqlx::query(&format!(
        "CREATE TABLE {}.o3 (code_site TEXT, date_de_debut TIMESTAMP, date_de_fin TIMESTAMP, \
         polluant TEXT, valeur DOUBLE PRECISION, unite_de_mesure TEXT)",
        quote_ident(staging)
    ))
    .execute(&pool)
    .await?;
    sqlx::query(&format!(
        "INSERT INTO {}.o3 VALUES \
         ('FR01', '2024-03-08 00:00:00', '2024-03-08 01:00:00', 'O3', 40.0, 'µg-m3'), \
         ('FR01', '2024-03-08 01:00:00', '2024-03-08 02:00:00', 'O3', NULL, 'µg-m3'), \
         ('FR02', '2024-03-08 00:00:00', '2024-03-08 01:00:00', 'O3', 42.5, 'µg-m3')",
        quote_ident(staging)
    ))
    .execute(&pool)
    .await?;

    let source = PostgresSource::new(pool.clone(), staging);
    assert_eq!(source.list_table_names().await?, vec!["o3"]);

    let sink = PostgresSink::new(pool.clone(), curated);
    let engine = CurationEngine::new(CurationConfig::default());
    let report = engine.run(&source, &sink).await?;
    assert_eq!(report.rows, 2);

    // a second run replaces rather than appends
    engine.run(&source, &sink).await?;
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {}.curated",
        quote_ident(curated)
    ))
    .fetch_one(&pool)
    .await?;
    assert_eq!(count, 2);

    let reread = PostgresSource::new(pool.clone(), curated)
        .load_table("curated")
        .await?;
    assert_eq!(reread.height(), 2);
    assert_eq!(
        reread.column("date_de_debut")?.dtype(),
        &DataType::Datetime(TimeUnit::Microseconds, None)
    );
    assert_eq!(reread.column("o3_valeur")?.f64()?.get(1), Some(42.5));

    let wide = df!["v" => (0..20_000).map(|i| i as f64).collect::<Vec<_>>()]?;
    sink.write_table("batched", &wide, WriteMode::Replace).await?;
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {}.batched",
        quote_ident(curated)
    ))
    .fetch_one(&pool)
    .await?;
    assert_eq!(count, 20_000);

    for schema in [staging, curated] {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", quote_ident(schema)))
            .execute(&pool)
            .await?;
    }
    Ok(())
}
