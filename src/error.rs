//! ==============================================================================
//! error.rs - fault taxonomy shared by the edge and relay sides
//! ==============================================================================
//!
//! purpose:
//!     one error type for every component boundary. the variant decides what
//!     the caller does with it:
//!
//!     - Config       fatal at startup, the process exits with a diagnostic
//!     - TransientIo  bus or broker hiccup, retried on the next natural cycle
//!     - Upstream     generation provider failed, surfaced as degraded text
//!     - Delivery     one live client could not be reached, isolated
//!
//! relationships:
//!     - used by: every module; main.rs converts into anyhow at the top
//!
//! ==============================================================================

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("configuration fault: {0}")]
    Config(String),

    #[error("transient i/o fault: {0}")]
    TransientIo(String),

    #[error("upstream fault: {0}")]
    Upstream(String),

    #[error("delivery fault: {0}")]
    Delivery(String),
}

impl Fault {
    /// Only configuration faults stop a process; everything else heals by retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Config(_))
    }

    /// The cause without the taxonomy prefix, for user-visible messages.
    pub fn cause(&self) -> &str {
        match self {
            Fault::Config(c) | Fault::TransientIo(c) | Fault::Upstream(c) | Fault::Delivery(c) => c,
        }
    }
}

impl From<rumqttc::ClientError> for Fault {
    fn from(e: rumqttc::ClientError) -> Self {
        Fault::TransientIo(format!("broker request rejected: {}", e))
    }
}

impl From<rumqttc::ConnectionError> for Fault {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Fault::TransientIo(format!("broker connection: {}", e))
    }
}

impl From<reqwest::Error> for Fault {
    fn from(e: reqwest::Error) -> Self {
        // the request url may carry credentials, never echo it
        Fault::Upstream(format!("API call error ({}).", e.without_url()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_is_fatal() {
        assert!(Fault::Config("sensor 0x44 absent".into()).is_fatal());
        assert!(!Fault::TransientIo("nack".into()).is_fatal());
        assert!(!Fault::Upstream("503".into()).is_fatal());
        assert!(!Fault::Delivery("closed".into()).is_fatal());
    }

    #[test]
    fn test_cause_strips_prefix() {
        let fault = Fault::Upstream("timed out".into());
        assert_eq!(fault.cause(), "timed out");
        assert_eq!(fault.to_string(), "upstream fault: timed out");
    }
}
