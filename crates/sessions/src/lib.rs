pub mod entry;
pub mod key;
pub mod store;

pub use entry::{AuthProfileOverride, ChatType, DropPolicy, GroupActivation, SessionEntry};
pub use key::{alias, build_agent_main_session_key, compute_session_key};
pub use store::SessionStore;
