//! Write-ahead log
//!
//! - `record`: line codec (`log_id|version|operation|payload`)
//! - `mode`: durability modes (Cache, Flush, Always)
//! - `config`: WAL configuration (WalConfig)
//! - `writer`: appending writer with torn-tail repair (WalWriter)
//! - `reader`: forward-only replay cursor (WalReader)
//! - `manager`: log id counter tying writer and cursor together (WalManager)

pub mod config;
pub mod manager;
pub mod mode;
pub mod reader;
pub mod record;
pub mod writer;

pub use config::{WalConfig, DEFAULT_WAL_FILE};
pub use manager::WalManager;
pub use mode::DurabilityMode;
pub use reader::{ReadStopReason, WalReader};
pub use record::WalRecord;
pub use writer::{WalCounters, WalWriter};
