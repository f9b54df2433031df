use super::{JobState, JobToken, ProviderClient, ProviderRequest};
use crate::error::{Result, VolumeError};
use crate::models::OperationType;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Per-operation completion budgets. Creates allocate storage and get the
/// longest budget; attach/detach are hypervisor hot-plug calls; deletes sit
/// in between.
#[derive(Debug, Clone)]
pub struct GatewayTimeouts {
    pub create: Duration,
    pub attach: Duration,
    pub detach: Duration,
    pub delete: Duration,
    pub poll_interval: Duration,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(600),
            attach: Duration::from_secs(120),
            detach: Duration::from_secs(120),
            delete: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl GatewayTimeouts {
    pub fn for_op(&self, op_type: OperationType) -> Duration {
        match op_type {
            OperationType::Create => self.create,
            OperationType::Attach => self.attach,
            OperationType::Detach => self.detach,
            OperationType::Delete => self.delete,
        }
    }
}

/// Fire-and-forget front to the provider control plane: submit returns as
/// soon as the provider accepts the job, await_completion polls the job
/// API until it settles or the budget runs out.
pub struct ProviderGateway {
    client: Arc<dyn ProviderClient>,
    timeouts: GatewayTimeouts,
}

impl ProviderGateway {
    pub fn new(client: Arc<dyn ProviderClient>, timeouts: GatewayTimeouts) -> Self {
        Self { client, timeouts }
    }

    pub fn timeouts(&self) -> &GatewayTimeouts {
        &self.timeouts
    }

    pub async fn submit(&self, request: &ProviderRequest) -> Result<JobToken> {
        let token = self.client.submit(request).await.map_err(|e| match e {
            VolumeError::ProviderSubmitFailure(_) => e,
            other => VolumeError::ProviderSubmitFailure(other.to_string()),
        })?;
        debug!(
            job_id = %token.job_id,
            request = request.describe(),
            "provider accepted job"
        );
        Ok(token)
    }

    /// Poll until the job settles. A timeout here means the job's outcome
    /// is unknown, not that it failed; callers must reconcile before
    /// retrying anything non-idempotent.
    pub async fn await_completion(
        &self,
        token: &JobToken,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let deadline = Instant::now() + timeout;
        let mut interval = tokio::time::interval(self.timeouts.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.client.query_job(token).await {
                Ok(JobState::Success(result)) => return Ok(result),
                Ok(JobState::Failure(detail)) => {
                    return Err(VolumeError::ProviderJobFailure(detail));
                }
                Ok(JobState::Pending) => {}
                // Transient poll errors don't settle the job either way.
                Err(e) => warn!(job_id = %token.job_id, error = %e, "job poll failed"),
            }

            if Instant::now() >= deadline {
                return Err(VolumeError::ProviderTimeout {
                    job_id: token.job_id.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
    }

    /// submit + await_completion with the configured per-op budget.
    pub async fn execute(
        &self,
        op_type: OperationType,
        request: &ProviderRequest,
    ) -> Result<serde_json::Value> {
        let token = self.submit(request).await?;
        self.await_completion(&token, self.timeouts.for_op(op_type))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted client: pops one JobState per poll, holding the last.
    struct ScriptedClient {
        accept: bool,
        states: Mutex<Vec<JobState>>,
    }

    impl ScriptedClient {
        fn new(accept: bool, mut states: Vec<JobState>) -> Self {
            states.reverse();
            Self {
                accept,
                states: Mutex::new(states),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn submit(&self, request: &ProviderRequest) -> Result<JobToken> {
            if self.accept {
                Ok(JobToken {
                    job_id: format!("job-{}", request.describe()),
                })
            } else {
                Err(VolumeError::ProviderSubmitFailure(
                    "invalid disk offering".to_string(),
                ))
            }
        }

        async fn query_job(&self, _token: &JobToken) -> Result<JobState> {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                Ok(states.pop().unwrap())
            } else {
                Ok(states.last().cloned().unwrap_or(JobState::Pending))
            }
        }
    }

    fn fast_timeouts() -> GatewayTimeouts {
        GatewayTimeouts {
            create: Duration::from_millis(200),
            attach: Duration::from_millis(200),
            detach: Duration::from_millis(200),
            delete: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn attach_request() -> ProviderRequest {
        ProviderRequest::AttachVolume {
            volume_id: "vol-1".to_string(),
            vm_id: "vm-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_job_success_after_pending() {
        let client = Arc::new(ScriptedClient::new(
            true,
            vec![
                JobState::Pending,
                JobState::Pending,
                JobState::Success(serde_json::json!({"device_slot": 1})),
            ],
        ));
        let gateway = ProviderGateway::new(client, fast_timeouts());

        let result = gateway
            .execute(OperationType::Attach, &attach_request())
            .await
            .unwrap();
        assert_eq!(result["device_slot"], 1);
    }

    #[tokio::test]
    async fn test_submit_rejection_is_not_a_job_failure() {
        let client = Arc::new(ScriptedClient::new(false, vec![]));
        let gateway = ProviderGateway::new(client, fast_timeouts());

        let err = gateway
            .execute(OperationType::Create, &attach_request())
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::ProviderSubmitFailure(_)));
    }

    #[tokio::test]
    async fn test_job_failure_carries_provider_detail() {
        let client = Arc::new(ScriptedClient::new(
            true,
            vec![JobState::Failure("no capacity in zone".to_string())],
        ));
        let gateway = ProviderGateway::new(client, fast_timeouts());

        let err = gateway
            .execute(OperationType::Attach, &attach_request())
            .await
            .unwrap_err();
        match err {
            VolumeError::ProviderJobFailure(detail) => {
                assert_eq!(detail, "no capacity in zone");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unresolved_job_times_out() {
        let client = Arc::new(ScriptedClient::new(true, vec![JobState::Pending]));
        let gateway = ProviderGateway::new(client, fast_timeouts());

        let err = gateway
            .execute(OperationType::Attach, &attach_request())
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::ProviderTimeout { .. }));
    }
}
