pub mod cache;
pub mod command;
pub mod config;
pub mod frame;
pub mod link;
pub mod nextion;
pub mod ota;
pub mod protocol;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
mod test_support;

pub use cache::{CacheError, CachedAttr, PageCache, PageStats};
pub use command::{AttrCommand, Dispatch};
pub use config::{ConfigError, NetworkConfig, NextionConfig, RuntimeConfig, TransferConfig};
pub use frame::{Frame, Framer};
pub use link::{Clock, LinkError, PanelLink};
pub use nextion::{HmiEvent, InputStatus, Nextion};
pub use ota::{FirmwareTransfer, NetworkQuiesce, OtaError, OtaSession, TransferReport};
pub use protocol::{InboundMessage, TouchState};
pub use supervisor::{ConnectionState, ConnectionSupervisor, LinkStatus, SupervisorAction};
pub use topics::Topics;
pub use types::{PlateCommand, PlateStatus, Publication};
