//! Per-test PostgreSQL databases carrying the stageflow schema.
//!
//! `STAGEFLOW_TEST_DATABASE_URL` names a server connection whose role may
//! create and drop databases; a `.env` file in the working directory is read
//! first. Every test gets its own database, migrated with
//! `crates/stageflow/migrations` and dropped after a passing run unless
//! `STAGEFLOW_KEEP_TEST_DB` is set.

use std::{future::Future, pin::Pin};

use anyhow::{Context, Result, ensure};
use sqlx::{Connection, Executor, PgConnection, PgPool, postgres::PgPoolOptions};
use url::Url;
use uuid::Uuid;

const ADMIN_URL_VAR: &str = "STAGEFLOW_TEST_DATABASE_URL";
const KEEP_VAR: &str = "STAGEFLOW_KEEP_TEST_DB";

const NAME_PREFIX: &str = "stageflow_";
/// Postgres truncates identifiers longer than this.
const MAX_IDENT: usize = 63;

/// Tables the store reads and writes, all under the `stageflow` schema.
const STORE_TABLES: [&str; 3] = ["records", "mutations", "narrations"];

/// A migrated database owned by one test.
struct TestDatabase {
    name: String,
    admin: PgConnection,
    pool: PgPool,
}

impl TestDatabase {
    async fn create(test_name: &str) -> Result<Self> {
        dotenvy::dotenv().ok();
        let admin_url =
            std::env::var(ADMIN_URL_VAR).with_context(|| format!("{ADMIN_URL_VAR} is not set"))?;
        let mut admin = PgConnection::connect(&admin_url)
            .await
            .with_context(|| format!("cannot connect to {ADMIN_URL_VAR}"))?;

        let name = database_name(test_name);
        admin
            .execute(format!(r#"CREATE DATABASE "{name}""#).as_str())
            .await?;

        let mut url = Url::parse(&admin_url)?;
        url.set_path(&format!("/{name}"));
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url.as_str())
            .await?;

        // Relative to this crate's manifest directory.
        sqlx::migrate!("../stageflow/migrations").run(&pool).await?;

        let db = Self { name, admin, pool };
        db.check_schema().await?;
        Ok(db)
    }

    async fn check_schema(&self) -> Result<()> {
        let present: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = 'stageflow'",
        )
        .fetch_all(&self.pool)
        .await?;
        let missing: Vec<&str> = STORE_TABLES
            .into_iter()
            .filter(|table| !present.iter().any(|p| p == table))
            .collect();
        ensure!(
            missing.is_empty(),
            "database `{}` lacks stageflow tables {missing:?} after migrating",
            self.name
        );
        Ok(())
    }

    async fn destroy(mut self) -> Result<()> {
        self.pool.close().await;
        self.admin
            .execute(format!(r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#, self.name).as_str())
            .await?;
        Ok(())
    }
}

/// Run `f` against a fresh stageflow database.
///
/// A failing or panicking body keeps its database for inspection.
pub async fn with_test_db<F, T>(test_name: &str, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a PgPool) -> Pin<Box<dyn Future<Output = Result<T>> + 'a>>,
{
    let db = TestDatabase::create(test_name).await?;
    let result = f(&db.pool).await;

    if result.is_err() || std::env::var_os(KEEP_VAR).is_some() {
        eprintln!("stageflow test database `{}` kept", db.name);
        return result;
    }
    let name = db.name.clone();
    if let Err(err) = db.destroy().await {
        eprintln!("stageflow test database `{name}` not dropped: {err:#}");
    }
    result
}

/// `stageflow_<slug>_<uuid v7>`, where the slug is the lowercased test name
/// with runs of other characters collapsed to `_`.
fn database_name(test_name: &str) -> String {
    let suffix = Uuid::now_v7().simple().to_string();
    let budget = MAX_IDENT - NAME_PREFIX.len() - suffix.len() - 1;

    let mut slug = String::with_capacity(budget);
    for c in test_name.chars().map(|c| c.to_ascii_lowercase()) {
        if slug.len() == budget {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    format!("{NAME_PREFIX}{}_{suffix}", slug.trim_end_matches('_'))
}

/// Declare a multi-threaded tokio test that receives a migrated `&PgPool`.
///
/// ```ignore
/// use test_utils::db_test;
///
/// db_test!(loads_committed_workflow, |pool| {
///     let store = stageflow::PgStore::new(pool.clone());
///     // ...
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! db_test {
    ($name:ident, |$pool:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            $crate::db::with_test_db(stringify!($name), |$pool| Box::pin(async move { $body }))
                .await
        }
    };
}
