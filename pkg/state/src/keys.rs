use pkg_constants::state::{HEARTBEAT_KEY_PREFIX, LEASE_KEY_PREFIX, SESSION_KEY_PREFIX};

/// Key layout in the shared store, optionally namespaced so several fleets
/// can share one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn heartbeat_prefix(&self) -> String {
        format!("{}{}", self.namespace, HEARTBEAT_KEY_PREFIX)
    }

    pub fn heartbeat(&self, instance_id: &str) -> String {
        format!("{}{}", self.heartbeat_prefix(), instance_id)
    }

    pub fn lease_prefix(&self) -> String {
        format!("{}{}", self.namespace, LEASE_KEY_PREFIX)
    }

    pub fn lease(&self, session_id: &str) -> String {
        format!("{}{}", self.lease_prefix(), session_id)
    }

    pub fn session_prefix(&self) -> String {
        format!("{}{}", self.namespace, SESSION_KEY_PREFIX)
    }

    pub fn session(&self, session_id: &str) -> String {
        format!("{}{}", self.session_prefix(), session_id)
    }
}
