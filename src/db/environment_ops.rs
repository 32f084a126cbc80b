use crate::db::mappers::EnvironmentRow;
use crate::db::RunStore;
use crate::error::{EngineError, Result};
use crate::timing::dt_to_ms;
use crate::types::{
    ActivationFailure, ActivationState, ConfigurationEnvironment, ConfigurationVersionId,
};

impl RunStore {
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn activation_state(
        &self,
        configuration_version_id: &ConfigurationVersionId,
    ) -> Result<Option<ActivationState>> {
        sqlx::query_as::<_, EnvironmentRow>(
            "SELECT configuration_version_id, status, environment_path, installed_packages,
                    install_log, dependency_digest, activation_hook_result, failed_step,
                    detail, updated_at
             FROM configuration_environments
             WHERE configuration_version_id = ?",
        )
        .bind(configuration_version_id.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| EngineError::Database(format!("Failed to load environment: {e}")))?
        .map(ActivationState::try_from)
        .transpose()
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn record_environment_ready(&self, environment: &ConfigurationEnvironment) -> Result<()> {
        sqlx::query(
            "INSERT INTO configuration_environments
                 (configuration_version_id, status, environment_path, installed_packages,
                  install_log, dependency_digest, activation_hook_result, failed_step, detail, updated_at)
             VALUES (?, 'ready', ?, ?, ?, ?, ?, NULL, NULL, ?)
             ON CONFLICT (configuration_version_id) DO UPDATE SET
                 status = 'ready',
                 environment_path = excluded.environment_path,
                 installed_packages = excluded.installed_packages,
                 install_log = excluded.install_log,
                 dependency_digest = excluded.dependency_digest,
                 activation_hook_result = excluded.activation_hook_result,
                 failed_step = NULL,
                 detail = NULL,
                 updated_at = excluded.updated_at",
        )
        .bind(environment.configuration_version_id.value())
        .bind(environment.environment_path.to_string_lossy().into_owned())
        .bind(serde_json::to_string(&environment.installed_packages)?)
        .bind(&environment.install_log)
        .bind(environment.dependency_digest.as_deref())
        .bind(serde_json::to_string(&environment.activation_hook_result)?)
        .bind(dt_to_ms(environment.built_at))
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| EngineError::Database(format!("Failed to record environment: {e}")))
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn record_environment_failure(&self, failure: &ActivationFailure) -> Result<()> {
        let hook_result = failure
            .activation_hook_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO configuration_environments
                 (configuration_version_id, status, environment_path, installed_packages,
                  install_log, dependency_digest, activation_hook_result, failed_step, detail, updated_at)
             VALUES (?, 'failed', NULL, '[]', ?, NULL, ?, ?, ?, ?)
             ON CONFLICT (configuration_version_id) DO UPDATE SET
                 status = 'failed',
                 environment_path = NULL,
                 installed_packages = '[]',
                 install_log = excluded.install_log,
                 dependency_digest = NULL,
                 activation_hook_result = excluded.activation_hook_result,
                 failed_step = excluded.failed_step,
                 detail = excluded.detail,
                 updated_at = excluded.updated_at",
        )
        .bind(failure.configuration_version_id.value())
        .bind(&failure.install_log)
        .bind(hook_result)
        .bind(failure.step.as_str())
        .bind(&failure.detail)
        .bind(dt_to_ms(failure.failed_at))
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| EngineError::Database(format!("Failed to record environment failure: {e}")))
    }
}
