//! Data Factory management REST adapter
//!
//! Implements both the run source and the rerun executor against
//! `management.azure.com`. Every call carries a bearer token from the
//! client's [`TokenProvider`].

use crate::auth::{Credentials, TokenProvider};
use crate::http;
use chrono::{DateTime, Utc};
use medic_core::{
    ExecutionStatus, FailedRun, PortError, RemediationExecutor, RerunReceipt, RerunRequest,
    RunStatusSource, StatusReport, SucceededRun,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding a pre-issued bearer token; overrides the
/// service principal when set
pub const FACTORY_TOKEN_ENV: &str = "MEDIC_FACTORY_TOKEN";

/// Upper bound on continuation pages followed per query
const MAX_PAGES: usize = 50;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Location of the factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorySettings {
    pub subscription_id: String,
    pub resource_group: String,
    pub factory_name: String,
    pub api_version: String,
    pub management_url: String,
    /// Identity authority issuing management tokens
    pub authority_url: String,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            resource_group: String::new(),
            factory_name: String::new(),
            api_version: "2018-06-01".to_string(),
            management_url: "https://management.azure.com".to_string(),
            authority_url: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl FactorySettings {
    /// Names of required fields that are blank
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("subscription_id", &self.subscription_id),
            ("resource_group", &self.resource_group),
            ("factory_name", &self.factory_name),
            ("api_version", &self.api_version),
            ("management_url", &self.management_url),
            ("authority_url", &self.authority_url),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunQuery {
    last_updated_after: String,
    last_updated_before: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filters: Vec<RunQueryFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunQueryFilter {
    operand: &'static str,
    operator: &'static str,
    values: Vec<String>,
}

impl RunQuery {
    fn new(after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        Self {
            last_updated_after: after.format(TIME_FORMAT).to_string(),
            last_updated_before: before.format(TIME_FORMAT).to_string(),
            filters: Vec::new(),
            continuation_token: None,
        }
    }

    fn with_status(mut self, status: &str) -> Self {
        self.filters.push(RunQueryFilter {
            operand: "Status",
            operator: "Equals",
            values: vec![status.to_string()],
        });
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    continuation_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineRun {
    run_id: String,
    pipeline_name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityRun {
    activity_name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<ActivityError>,
}

#[derive(Debug, Clone, Deserialize)]
struct ActivityError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunResponse {
    #[serde(default)]
    run_id: Option<String>,
}

/// Map a factory run status onto the three states the loop knows
fn map_status(status: &str) -> Option<ExecutionStatus> {
    match status {
        "Queued" | "InProgress" | "Canceling" => Some(ExecutionStatus::InProgress),
        "Succeeded" => Some(ExecutionStatus::Succeeded),
        "Failed" | "Cancelled" => Some(ExecutionStatus::Failed),
        _ => None,
    }
}

fn first_failed_activity(activities: &[ActivityRun]) -> Option<&ActivityRun> {
    activities.iter().find(|a| a.status == "Failed")
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

/// Run message first, failed activity's error second
fn failure_text(run: &PipelineRun, activity: Option<&ActivityRun>) -> String {
    non_blank(run.message.as_deref())
        .or_else(|| {
            activity
                .and_then(|a| a.error.as_ref())
                .and_then(|e| non_blank(e.message.as_deref()))
        })
        .unwrap_or_default()
        .to_string()
}

/// Data Factory client
#[derive(Debug)]
pub struct FactoryClient {
    http: reqwest::Client,
    settings: FactorySettings,
    auth: TokenProvider,
}

impl FactoryClient {
    /// Create a client; fails when a credential is blank
    pub fn new(
        settings: FactorySettings,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        let resource = format!("{}/", settings.management_url.trim_end_matches('/'));
        let auth = TokenProvider::new(credentials, &settings.authority_url, resource, timeout)?;
        Ok(Self {
            http: http::client(timeout)?,
            settings,
            auth,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    /// Factory-scoped URL with the api-version query parameter
    fn factory_url(&self, segments: &[&str]) -> Result<Url, PortError> {
        let mut url = Url::parse(&self.settings.management_url)
            .map_err(|e| PortError::Malformed(format!("invalid management url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| PortError::Malformed("management url cannot carry a path".into()))?
            .pop_if_empty()
            .extend([
                "subscriptions",
                self.settings.subscription_id.as_str(),
                "resourceGroups",
                self.settings.resource_group.as_str(),
                "providers",
                "Microsoft.DataFactory",
                "factories",
                self.settings.factory_name.as_str(),
            ])
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("api-version", &self.settings.api_version);
        Ok(url)
    }

    fn window(window: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let before = Utc::now();
        let span = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(2));
        (before - span, before)
    }

    async fn query_runs(
        &self,
        status: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<PipelineRun>, PortError> {
        let url = self.factory_url(&["queryPipelineRuns"])?;
        let mut query = RunQuery::new(after, before).with_status(status);
        let mut runs = Vec::new();

        for _ in 0..MAX_PAGES {
            let token = self.auth.token().await?;
            let page: QueryPage<PipelineRun> = http::send_json(
                self.http
                    .post(url.clone())
                    .bearer_auth(&token)
                    .json(&query),
            )
            .await?;
            runs.extend(page.value);
            match page.continuation_token.filter(|t| !t.is_empty()) {
                Some(token) => query.continuation_token = Some(token),
                None => {
                    tracing::debug!(status, count = runs.len(), "pipeline runs queried");
                    return Ok(runs);
                }
            }
        }
        tracing::warn!(status, pages = MAX_PAGES, "run query truncated at page limit");
        Ok(runs)
    }

    /// First failed activity of a run; lookup errors only cost the step name
    async fn failed_activity(
        &self,
        run_id: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Option<ActivityRun> {
        let url = match self.factory_url(&["pipelineruns", run_id, "queryActivityruns"]) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!(run_id, error = %e, "activity query skipped");
                return None;
            }
        };
        let result: Result<QueryPage<ActivityRun>, PortError> = match self.auth.token().await {
            Ok(token) => {
                http::send_json(
                    self.http
                        .post(url)
                        .bearer_auth(&token)
                        .json(&RunQuery::new(after, before)),
                )
                .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(page) => first_failed_activity(&page.value).cloned(),
            Err(e) => {
                tracing::debug!(run_id, error = %e, "activity query failed");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl RunStatusSource for FactoryClient {
    async fn failed_runs(&self, window: Duration) -> Result<Vec<FailedRun>, PortError> {
        let (after, before) = Self::window(window);
        let runs = self.query_runs("Failed", after, before).await?;

        let mut failed = Vec::with_capacity(runs.len());
        for run in runs {
            let activity = self.failed_activity(&run.run_id, after, before).await;
            let mut entry = FailedRun::new(
                &run.pipeline_name,
                &run.run_id,
                failure_text(&run, activity.as_ref()),
            );
            if let Some(activity) = activity {
                entry = entry.with_step(activity.activity_name);
            }
            failed.push(entry);
        }
        Ok(failed)
    }

    async fn succeeded_runs(&self, window: Duration) -> Result<Vec<SucceededRun>, PortError> {
        let (after, before) = Self::window(window);
        let runs = self.query_runs("Succeeded", after, before).await?;
        Ok(runs
            .into_iter()
            .map(|run| SucceededRun::new(run.pipeline_name, run.run_id))
            .collect())
    }

    async fn run_status(&self, run_id: &str) -> Result<Option<StatusReport>, PortError> {
        let url = self.factory_url(&["pipelineruns", run_id])?;
        let token = self.auth.token().await?;
        let run: PipelineRun =
            match http::send_json(self.http.get(url).bearer_auth(&token)).await {
                Ok(run) => run,
                Err(PortError::Rejected { status: 404, .. }) => return Ok(None),
                Err(e) => return Err(e),
            };

        let Some(status) = map_status(&run.status) else {
            tracing::debug!(run_id, status = %run.status, "unrecognised run status");
            return Ok(None);
        };
        let mut report = StatusReport::new(status);
        if let Some(message) = non_blank(run.message.as_deref()) {
            report = report.with_message(message);
        }
        Ok(Some(report))
    }
}

#[async_trait::async_trait]
impl RemediationExecutor for FactoryClient {
    async fn trigger(&self, request: &RerunRequest) -> Result<RerunReceipt, PortError> {
        let mut url = self.factory_url(&["pipelines", request.pipeline_name(), "createRun"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("referencePipelineRunId", request.original_run_id());
            if let Some(step) = request.step() {
                query
                    .append_pair("isRecovery", "true")
                    .append_pair("startActivityName", step);
            }
        }

        let token = self.auth.token().await?;
        let response: CreateRunResponse = http::send_json(
            self.http
                .post(url)
                .bearer_auth(&token)
                .json(&serde_json::json!({})),
        )
        .await?;
        tracing::debug!(run_id = ?response.run_id, "createRun answered");
        Ok(RerunReceipt {
            new_run_id: response.run_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings() -> FactorySettings {
        FactorySettings {
            subscription_id: "sub-1".into(),
            resource_group: "rg-data".into(),
            factory_name: "adf-prod".into(),
            ..FactorySettings::default()
        }
    }

    fn client() -> FactoryClient {
        FactoryClient::new(
            settings(),
            Credentials::Static("token".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn blank_token_is_rejected() {
        let err = FactoryClient::new(
            settings(),
            Credentials::Static(" ".into()),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err, PortError::MissingCredential(FACTORY_TOKEN_ENV));
    }

    #[test]
    fn principal_needs_every_field() {
        let credentials = Credentials::ClientSecret {
            tenant_id: "tenant".into(),
            client_id: "app".into(),
            client_secret: String::new(),
        };
        let err = FactoryClient::new(settings(), credentials, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, PortError::MissingCredential(crate::auth::CLIENT_SECRET_ENV));
    }

    #[test]
    fn missing_fields_are_reported() {
        assert_eq!(
            FactorySettings::default().missing_fields(),
            vec!["subscription_id", "resource_group", "factory_name"]
        );
        assert!(settings().missing_fields().is_empty());
    }

    #[test]
    fn factory_url_is_scoped_and_encoded() {
        let url = client()
            .factory_url(&["pipelines", "Load Orders", "createRun"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-data/providers/\
             Microsoft.DataFactory/factories/adf-prod/pipelines/Load%20Orders/createRun\
             ?api-version=2018-06-01"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("Queued"), Some(ExecutionStatus::InProgress));
        assert_eq!(map_status("InProgress"), Some(ExecutionStatus::InProgress));
        assert_eq!(map_status("Canceling"), Some(ExecutionStatus::InProgress));
        assert_eq!(map_status("Succeeded"), Some(ExecutionStatus::Succeeded));
        assert_eq!(map_status("Failed"), Some(ExecutionStatus::Failed));
        assert_eq!(map_status("Cancelled"), Some(ExecutionStatus::Failed));
        assert_eq!(map_status("Paused"), None);
    }

    #[test]
    fn run_query_serializes_window_and_filter() {
        let after = DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let before = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let json = serde_json::to_value(RunQuery::new(after, before).with_status("Failed")).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "lastUpdatedAfter": "2024-05-01T08:00:00Z",
                "lastUpdatedBefore": "2024-05-01T10:00:00Z",
                "filters": [{"operand": "Status", "operator": "Equals", "values": ["Failed"]}]
            })
        );
    }

    #[test]
    fn query_page_decodes_runs() {
        let page: QueryPage<PipelineRun> = serde_json::from_value(serde_json::json!({
            "value": [{
                "runId": "R1",
                "pipelineName": "Ingest",
                "status": "Failed",
                "message": "Operation on target CopyOrders failed",
                "durationInMs": 1200
            }],
            "continuationToken": "abc"
        }))
        .unwrap();

        assert_eq!(page.value.len(), 1);
        assert_eq!(page.value[0].run_id, "R1");
        assert_eq!(page.continuation_token.as_deref(), Some("abc"));
    }

    #[test]
    fn failed_activity_supplies_step_and_fallback_text() {
        let activities: Vec<ActivityRun> = serde_json::from_value(serde_json::json!([
            {"activityName": "Lookup", "status": "Succeeded"},
            {"activityName": "CopyOrders", "status": "Failed",
             "error": {"errorCode": "2200", "message": "Login failed for user 'etl'"}}
        ]))
        .unwrap();
        let run = PipelineRun {
            run_id: "R1".into(),
            pipeline_name: "Ingest".into(),
            status: "Failed".into(),
            message: Some("  ".into()),
        };

        let activity = first_failed_activity(&activities);

        assert_eq!(activity.map(|a| a.activity_name.as_str()), Some("CopyOrders"));
        assert_eq!(failure_text(&run, activity), "Login failed for user 'etl'");
    }

    #[test]
    fn run_message_wins_over_activity_error() {
        let run = PipelineRun {
            run_id: "R1".into(),
            pipeline_name: "Ingest".into(),
            status: "Failed".into(),
            message: Some("Pipeline timed out".into()),
        };
        assert_eq!(failure_text(&run, None), "Pipeline timed out");
    }

    #[test]
    fn create_run_response_without_id() {
        let response: CreateRunResponse = serde_json::from_str("{}").unwrap();
        assert!(response.run_id.is_none());
    }
}
