pub mod bus;
pub mod db;
pub mod entities;
pub mod memory;
pub mod rows;
pub mod seaorm;
pub mod store;

pub use bus::{BillingEvent, StorageBus, StorageBusConfig};
pub use memory::MemoryStore;
pub use rows::{
    AbilityRow, ChannelRow, ChannelSetting, LogInsert, LogKind, QuotaDelta, StatusCodeMapping,
    StorageSnapshot, TaskInsert, TaskPatch, TaskRow, TaskStatus, TokenRow, UserRow,
};
pub use seaorm::SeaOrmStore;
pub use store::{Store, StoreError, StoreResult};
