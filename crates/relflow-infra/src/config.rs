//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.relflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use anyhow::Context as _;
use relflow_types::config::EngineConfig;

use crate::sqlite::pool::{DatabasePool, database_url_in};
use crate::sqlite::workflow::SqliteWorkflowRepository;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Values that would stall the engine are raised to their floor
///   (`max_attempts >= 1`, `attempt_timeout_secs >= 1`).
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => apply_floors(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

fn apply_floors(mut config: EngineConfig) -> EngineConfig {
    config.max_attempts = config.max_attempts.max(1);
    config.attempt_timeout_secs = config.attempt_timeout_secs.max(1);
    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        config.backoff_multiplier = 1.0;
    }
    config
}

/// Resolve the SQLite URL for the store.
///
/// Priority:
/// 1. `database_url` from `config.toml`
/// 2. `relflow.db` inside `data_dir`
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir))
}

/// Open (and migrate) the SQLite store described by `config`.
pub async fn open_repository(
    config: &EngineConfig,
    data_dir: &Path,
) -> anyhow::Result<SqliteWorkflowRepository> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let url = resolve_database_url(config, data_dir);
    let pool = DatabasePool::new(&url)
        .await
        .with_context(|| format!("opening workflow store at {url}"))?;

    tracing::info!(database_url = %url, "workflow store opened");
    Ok(SqliteWorkflowRepository::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relflow_core::repository::workflow::WorkflowRepository;
    use relflow_core::workflow::{Definition, DefinitionRegistry, Engine, NoopListener};
    use relflow_types::workflow::{NodeStatus, RunStatus};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.attempt_timeout_secs, 600);
        assert!(config.database_url.is_none());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_attempts = 5
initial_backoff_ms = 250
max_concurrent_nodes = 2
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_backoff_ms, 250);
        assert_eq!(config.max_concurrent_nodes, Some(2));
        assert_eq!(config.max_backoff_ms, 60_000);
    }

    #[tokio::test]
    async fn load_engine_config_malformed_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_attempts = \"many\"")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_attempts, 3);
    }

    #[tokio::test]
    async fn load_engine_config_applies_floors() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "max_attempts = 0\nattempt_timeout_secs = 0\nbackoff_multiplier = 0.5\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.attempt_timeout_secs, 1);
        assert_eq!(config.backoff_multiplier, 1.0);
    }

    #[test]
    fn resolve_database_url_prefers_config() {
        let data_dir = Path::new("/srv/relflow");
        let mut config = EngineConfig::default();
        assert_eq!(
            resolve_database_url(&config, data_dir),
            "sqlite:///srv/relflow/relflow.db"
        );

        config.database_url = Some("sqlite:///tmp/other.db".to_string());
        assert_eq!(resolve_database_url(&config, data_dir), "sqlite:///tmp/other.db");
    }

    #[tokio::test]
    async fn engine_state_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let config = EngineConfig {
            initial_backoff_ms: 1,
            ..EngineConfig::default()
        };

        let definition = {
            let mut b = Definition::builder("release");
            let version = b
                .task("next-version", (), |_ctx, ()| async move { Ok("v0.17.0".to_string()) })
                .unwrap();
            b.action("announce", (&version,), |ctx, (v,): (String,)| async move {
                ctx.log(format!("announcing {v}"));
                Ok(())
            })
            .unwrap();
            b.output("version", &version).unwrap();
            b.build()
        };

        let run_id = {
            let repo = open_repository(&config, &data_dir).await.unwrap();
            let engine = Engine::new(repo.clone(), config.clone());
            let handle = engine.start(&definition, HashMap::new()).await.unwrap();
            let outputs = engine.run(&handle, Arc::new(NoopListener)).await.unwrap();
            assert_eq!(outputs.get("version"), Some(&json!("v0.17.0")));
            repo.pool().close().await;
            handle.run_id()
        };

        let repo = open_repository(&config, &data_dir).await.unwrap();
        let engine = Engine::new(repo.clone(), config);
        let snapshot = engine.query(run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Succeeded);
        assert_eq!(snapshot.count(NodeStatus::Succeeded), 2);
        assert_eq!(repo.list_runs("release", 10).await.unwrap().len(), 1);

        // Running a finished run again returns its stored outputs.
        let registry = DefinitionRegistry::new();
        registry.register(definition).unwrap();
        let handle = engine.resume(run_id, &registry).await.unwrap();
        let outputs = engine.run(&handle, Arc::new(NoopListener)).await.unwrap();
        assert_eq!(outputs.get("version"), Some(&json!("v0.17.0")));
    }
}
