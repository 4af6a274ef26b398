// 分发侧：接入、会话状态机、实时蜡烛、回放
pub mod messages;
pub mod replay;
pub mod server;
pub mod session;
pub mod sink;
pub mod updater;

pub use server::{run_server, AppState, ServerSessionCtx, VendorAcquisition};
pub use session::{Session, SessionCtx, SessionEvent, SessionPhase};
