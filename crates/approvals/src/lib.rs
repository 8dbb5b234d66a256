//! Approval Store + Approval Socket (spec §4.D, §4.E): the allowlist
//! file that backs `security`/`ask` decisions, and the local line
//! protocol that lets a human answer a pending exec approval.

pub mod file;
pub mod glob;
pub mod pending;
pub mod socket;

pub use file::{
    generate_token, AgentApprovals, ApprovalsFile, ApprovalsStore, Defaults, ResolvedDefaults,
    ResolvedExecApprovals, SocketConfig, WILDCARD_AGENT,
};
pub use glob::{glob_match, glob_matches_resolution, match_allowlist, AllowlistEntry, Resolution};
pub use pending::{ApprovalDecision, ApprovalInfo, ApprovalStore};
pub use socket::{ask_fallback_decision, token_eq, ApprovalSocket, RequestPayload};
