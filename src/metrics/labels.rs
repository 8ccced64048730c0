//! Label names and fixed label values

/// Authentication mode label
pub const MODE: &str = "mode";
/// Error classification label
pub const KIND: &str = "kind";
/// Transport label
pub const TRANSPORT: &str = "transport";
/// Outcome label
pub const OUTCOME: &str = "outcome";

/// Successful outcome
pub const OUTCOME_SUCCESS: &str = "success";
/// Failed outcome
pub const OUTCOME_FAILURE: &str = "failure";
