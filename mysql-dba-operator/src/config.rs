use std::time::Duration;

/// Runtime settings shared by every controller
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Upper bound for each SQL statement, connect and ping
    pub sql_timeout: Duration,
    /// Requeue interval after a successful pass
    pub resync_interval: Duration,
    /// Requeue interval after a failed pass
    pub error_requeue: Duration,
    /// Requeue interval between lifecycle phases
    pub phase_requeue: Duration,
    pub password_policy: PasswordPolicy,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            sql_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            error_requeue: Duration::from_secs(60),
            phase_requeue: Duration::from_secs(1),
            password_policy: PasswordPolicy::default(),
        }
    }
}

/// Complexity rules for generated passwords
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub length: usize,
    pub min_special: usize,
    pub min_numeric: usize,
    pub min_upper: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: 16,
            min_special: 1,
            min_numeric: 1,
            min_upper: 1,
        }
    }
}
