// REST-shaped entry points
//
// The HTTP layer is external. These calls map the `/tests` routes onto the
// job manager and render results and errors as status code plus JSON body.
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::EngineError;
use crate::job::JobManager;
use crate::spec::{TestSpec, TestType};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(&EngineError::Protocol(format!(
                "response encoding failed: {}",
                e
            ))),
        }
    }

    fn error(err: &EngineError) -> Self {
        Self {
            status: err.status_code(),
            body: json!({ "error": err.kind(), "message": err.to_string() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<EngineError> for ApiResponse {
    fn from(err: EngineError) -> Self {
        ApiResponse::error(&err)
    }
}

#[derive(Clone)]
pub struct EngineApi {
    manager: Arc<JobManager>,
}

impl EngineApi {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// `POST /tests/{testType}`
    pub fn create(&self, test_type: &str, body: &str) -> ApiResponse {
        match self.try_create(test_type, body) {
            Ok(job_id) => ApiResponse {
                status: 202,
                body: json!({
                    "jobId": job_id,
                    "status": "pending",
                    "message": format!("{} test accepted", test_type),
                }),
            },
            Err(e) => e.into(),
        }
    }

    fn try_create(&self, test_type: &str, body: &str) -> Result<String, EngineError> {
        let test_type = TestType::from_path(test_type)
            .ok_or_else(|| EngineError::Validation(format!("unknown test type '{}'", test_type)))?;
        let spec = TestSpec::from_json(body)?;
        if spec.test_type != test_type && body_names_test_type(body) {
            return Err(EngineError::Validation(format!(
                "body testType '{}' does not match path '{}'",
                spec.test_type, test_type
            )));
        }
        self.manager.create_job(spec.with_type_overrides(test_type))
    }

    /// `GET /tests`
    pub fn list(&self) -> ApiResponse {
        ApiResponse::json(200, &self.manager.list_jobs())
    }

    /// `GET /tests/{jobId}`
    pub fn get(&self, job_id: &str) -> ApiResponse {
        match self.manager.get_status(job_id) {
            Ok(view) => ApiResponse::json(200, &view),
            Err(e) => e.into(),
        }
    }

    /// `DELETE /tests/{jobId}`: stop request.
    pub async fn delete(&self, job_id: &str) -> ApiResponse {
        match self.manager.stop_job(job_id).await {
            Ok(view) => ApiResponse::json(200, &view),
            Err(e) => e.into(),
        }
    }

    /// `GET /health`
    pub fn health(&self) -> ApiResponse {
        ApiResponse::json(200, &self.manager.health())
    }
}

fn body_names_test_type(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("testType").cloned())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::transport::sim::SimBroker;

    fn api() -> EngineApi {
        let broker = SimBroker::new();
        EngineApi::new(Arc::new(JobManager::new(
            EngineConfig::default(),
            Arc::new(broker.connector()),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_returns_accepted_with_job_id() {
        let api = api();
        let response = api.create("telemetry", r#"{"brokerUrl":"mqtt://sim","devices":2}"#);
        assert_eq!(response.status, 202);
        let job_id = response.body["jobId"].as_str().unwrap().to_string();

        let status = api.get(&job_id);
        assert_eq!(status.status, 200);
        assert_eq!(status.body["jobId"], job_id.as_str());
        assert_eq!(status.body["testType"], "telemetry");
        assert_eq!(api.list().body.as_array().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_path_overrides_applied() {
        let api = api();
        let response = api.create("offline", r#"{"brokerUrl":"mqtt://sim","devices":1}"#);
        assert_eq!(response.status, 202);
        let job_id = response.body["jobId"].as_str().unwrap();
        assert_eq!(api.get(job_id).body["testType"], "offline");
    }

    #[tokio::test]
    async fn test_validation_errors_are_400() {
        let api = api();
        let response = api.create("telemetry", r#"{"brokerUrl":"mqtt://sim","devices":100001}"#);
        assert_eq!(response.status, 400);
        assert_eq!(response.body["error"], "validation_error");

        assert_eq!(api.create("bogus", "{}").status, 400);
        assert_eq!(api.create("telemetry", "not json").status, 400);
        let mismatch = api.create(
            "burst",
            r#"{"brokerUrl":"mqtt://sim","testType":"churn"}"#,
        );
        assert_eq!(mismatch.status, 400);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let api = api();
        assert_eq!(api.get("missing").status, 404);
        assert_eq!(api.delete("missing").await.status, 404);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_stops_then_conflicts() {
        let api = api();
        let created = api.create("telemetry", r#"{"brokerUrl":"mqtt://sim","devices":2}"#);
        let job_id = created.body["jobId"].as_str().unwrap().to_string();
        assert_eq!(api.delete(&job_id).await.status, 200);
        api.manager().wait_for_completion(&job_id).await.unwrap();
        let again = api.delete(&job_id).await;
        assert_eq!(again.status, 409);
        assert_eq!(again.body["error"], "already_terminal");
    }

    #[tokio::test]
    async fn test_health() {
        let response = api().health();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], "healthy");
        assert_eq!(response.body["availableSlots"], 5);
    }
}
