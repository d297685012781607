use std::{env, str::FromStr, time::Duration};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Config {
    pub enable_keyvalue_reconciler: bool,
    pub data_root: String,
    pub system_storage_namespace: String,
    pub user_storage_namespace_prefix: String,
    pub storage_workload_name: String,
    pub storage_path_annotation: String,
    pub storage_cache_ttl: Duration,
    pub job_poll_interval: Duration,
    pub job_poll_timeout: Duration,
    pub delete_confirm_timeout: Duration,
    pub workload_wait_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub scale_timeout: Duration,
    pub resubscribe_delay: Duration,
    pub conflict_retries: usize,
    pub keyvalue_container: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_keyvalue_reconciler: from_env_parse("ENABLE_KEYVALUE_RECONCILER", true),
            data_root: from_env_default("DATA_ROOT", "/middleware-data"),
            system_storage_namespace: from_env_default(
                "SYSTEM_STORAGE_NAMESPACE",
                "middleware-system",
            ),
            user_storage_namespace_prefix: from_env_default(
                "USER_STORAGE_NAMESPACE_PREFIX",
                "user-space-",
            ),
            storage_workload_name: from_env_default("STORAGE_WORKLOAD_NAME", "storage-agent"),
            storage_path_annotation: from_env_default(
                "STORAGE_PATH_ANNOTATION",
                "middleware.io/storage-path",
            ),
            storage_cache_ttl: from_env_secs("STORAGE_CACHE_TTL_SECONDS", 300),
            job_poll_interval: from_env_secs("JOB_POLL_INTERVAL_SECONDS", 5),
            job_poll_timeout: from_env_secs("JOB_POLL_TIMEOUT_SECONDS", 3600),
            delete_confirm_timeout: from_env_secs("DELETE_CONFIRM_TIMEOUT_SECONDS", 3600),
            workload_wait_timeout: from_env_secs("WORKLOAD_WAIT_TIMEOUT_SECONDS", 1800),
            snapshot_timeout: from_env_secs("SNAPSHOT_TIMEOUT_SECONDS", 1800),
            scale_timeout: from_env_secs("SCALE_TIMEOUT_SECONDS", 300),
            resubscribe_delay: from_env_secs("RESUBSCRIBE_DELAY_SECONDS", 1),
            conflict_retries: from_env_parse("CONFLICT_RETRIES", 5),
            keyvalue_container: from_env_default("KEYVALUE_CONTAINER", "keyvalue"),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    match env::var(var) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_owned(),
    }
}

fn from_env_parse<T>(var: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(var) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using {:?}", var, value, default);
            default
        }),
        _ => default,
    }
}

fn from_env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(from_env_parse(var, default))
}
