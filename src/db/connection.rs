use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("ORCA_DB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("ORCA_DB_NAMESPACE").unwrap_or_else(|_| "orca".to_string()),
            database: env::var("ORCA_DB_DATABASE").unwrap_or_else(|_| "coordinator".to_string()),
            username: env::var("ORCA_DB_USERNAME").ok(),
            password: env::var("ORCA_DB_PASSWORD").ok(),
        }
    }
}

impl DatabaseConfig {
    /// A private in-process store, used by tests and the `memory` default.
    pub fn in_memory() -> Self {
        Self {
            url: "memory".to_string(),
            namespace: "orca".to_string(),
            database: "coordinator".to_string(),
            username: None,
            password: None,
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = [
        // One row per algorithm result delivered by a processor; payload fields are untyped
        "DEFINE TABLE IF NOT EXISTS result SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS window_id ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS window_type_name ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS window_type_version ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS time_from ON TABLE result TYPE int;
         DEFINE FIELD IF NOT EXISTS time_to ON TABLE result TYPE int;
         DEFINE FIELD IF NOT EXISTS origin ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS algorithm_name ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS algorithm_version ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS status ON TABLE result TYPE string;
         DEFINE FIELD IF NOT EXISTS timestamp ON TABLE result TYPE int;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE result VALUE time::now();",
        "DEFINE INDEX IF NOT EXISTS result_algorithm ON TABLE result COLUMNS algorithm_name, algorithm_version;
         DEFINE INDEX IF NOT EXISTS result_window ON TABLE result COLUMNS window_id;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}
