pub mod agent;
pub mod audit;
pub mod config;
pub mod event;
pub mod iptables;
pub mod lifecycle;
pub mod procnet;
pub mod sampler;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod tui;
pub mod utils;
pub mod worthiness;

pub use agent::{AgentError, CancelToken, GuestAgent, IntervalTicker, Ticker, TickerFactory};
pub use event::{ChangeEvent, Endpoint, Info, SocketPath, StateSnapshot};
pub use lifecycle::{LifecycleError, LifecycleEvent, LifecycleOutcome, WatchOptions};
pub use session::{SessionError, SessionRecord, SessionStore};
pub use supervisor::{StartedSession, Supervisor, SupervisorError, SupervisorOptions};
