//! Wiring: configuration and secrets into a running reconciler

use crate::config::MedicConfig;
use crate::error::{ConfigError, MedicError, Result};
use medic_backends::{
    ChatClassifier, Credentials, FactoryClient, LogNotifier, WebhookNotifier, API_KEY_ENV,
    CLIENT_ID_ENV, CLIENT_SECRET_ENV, FACTORY_TOKEN_ENV, TENANT_ID_ENV,
};
use medic_core::{
    Collaborators, Notifier, Reconciler, RetryStore, RunRecord, SqliteRetryStore, TickReport,
};
use std::sync::Arc;

/// Secrets read from the environment
#[derive(Clone, Default)]
pub struct Secrets {
    /// Pre-issued token; wins over the service principal
    pub factory_token: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
}

impl Secrets {
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            factory_token: var(FACTORY_TOKEN_ENV),
            tenant_id: var(TENANT_ID_ENV),
            client_id: var(CLIENT_ID_ENV),
            client_secret: var(CLIENT_SECRET_ENV),
            api_key: var(API_KEY_ENV),
        }
    }

    /// Static token if given, the service principal otherwise
    pub fn factory_credentials(&self) -> Result<Credentials, ConfigError> {
        if let Ok(token) = secret(self.factory_token.as_ref(), FACTORY_TOKEN_ENV) {
            return Ok(Credentials::Static(token));
        }
        Ok(Credentials::ClientSecret {
            tenant_id: secret(self.tenant_id.as_ref(), TENANT_ID_ENV)?,
            client_id: secret(self.client_id.as_ref(), CLIENT_ID_ENV)?,
            client_secret: secret(self.client_secret.as_ref(), CLIENT_SECRET_ENV)?,
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("factory_token", &self.factory_token.as_ref().map(|_| "***"))
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn secret(value: Option<&String>, name: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::MissingSecret(name))
}

/// Build the external collaborators; needs `[factory]`, `[classifier]` and their secrets
pub fn collaborators(config: &MedicConfig, secrets: &Secrets) -> Result<Collaborators> {
    let factory_settings = config
        .factory
        .clone()
        .ok_or(ConfigError::MissingSection("factory"))?;
    let classifier_settings = config
        .classifier
        .clone()
        .ok_or(ConfigError::MissingSection("classifier"))?;
    let credentials = secrets.factory_credentials()?;
    let api_key = secret(secrets.api_key.as_ref(), API_KEY_ENV)?;
    let timeout = config.call_timeout();

    let factory = Arc::new(
        FactoryClient::new(factory_settings, credentials, timeout)
            .map_err(MedicError::adapter("factory client"))?,
    );
    let classifier = Arc::new(
        ChatClassifier::new(classifier_settings, api_key, timeout)
            .map_err(MedicError::adapter("classifier"))?,
    );
    let recipient = config.notification.recipient.clone();
    let notifier: Arc<dyn Notifier> = match &config.notification.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.as_str(), recipient, timeout)
                .map_err(MedicError::adapter("webhook notifier"))?,
        ),
        None => Arc::new(LogNotifier::new(recipient)),
    };

    Ok(Collaborators::new(factory.clone(), classifier, factory, notifier))
}

/// Open the configured database
pub fn open_store(config: &MedicConfig) -> Result<SqliteRetryStore> {
    Ok(SqliteRetryStore::open(&config.database_path)?)
}

/// Store plus collaborators plus tunables
pub fn build_reconciler(
    config: &MedicConfig,
    secrets: &Secrets,
) -> Result<Reconciler<SqliteRetryStore>> {
    let ports = collaborators(config, secrets)?;
    let store = open_store(config)?;
    tracing::info!(
        database = %config.database_path.display(),
        pipelines = config.pipelines.len(),
        initial_budget = config.initial_budget,
        "reconciler ready"
    );
    Ok(Reconciler::new(store, ports, config.reconcile_config()))
}

/// Render persisted records as a text table or a JSON array
pub fn render_records(records: &[RunRecord], json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(records)?);
    }
    if records.is_empty() {
        return Ok("no tracked runs".to_string());
    }

    let header = format!(
        "{:<24} {:<38} {:<8} {:>7} {:<38} {}",
        "PIPELINE", "RUN", "STATUS", "BUDGET", "ATTEMPT", "NOTIFIED"
    );
    let rows = records.iter().map(|record| {
        let notified = record
            .last_notification_time
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        format!(
            "{:<24} {:<38} {:<8} {:>7} {:<38} {}",
            record.pipeline_name,
            record.original_run_id,
            record.status.as_str(),
            record.retry_count,
            record.last_attempt_run_id.as_deref().unwrap_or("-"),
            notified
        )
    });
    Ok(std::iter::once(header).chain(rows).collect::<Vec<_>>().join("\n"))
}

/// `list` subcommand
pub fn list_records(store: &impl RetryStore, json: bool) -> Result<String> {
    let records = store.list()?;
    render_records(&records, json)
}

/// `clear` subcommand; returns whether a record existed
pub fn clear_record(store: &impl RetryStore, pipeline: &str, run_id: &str) -> Result<bool> {
    let existed = store.get(pipeline, run_id)?.is_some();
    store.delete(pipeline, run_id)?;
    if existed {
        tracing::info!(pipeline, run_id, "record cleared by operator");
    }
    Ok(existed)
}

/// One-line summary of a tick
#[must_use]
pub fn render_report(report: &TickReport) -> String {
    format!(
        "tracked={} resolved={} triggered={} waiting={} requeued={} escalated={} \
         suppressed={} skipped_settled={} fetch_errors={} notify_failures={}",
        report.tracked,
        report.resolved,
        report.triggered,
        report.waiting,
        report.requeued,
        report.escalated,
        report.suppressed,
        report.skipped_settled,
        report.fetch_errors,
        report.notify_failures
    )
}
