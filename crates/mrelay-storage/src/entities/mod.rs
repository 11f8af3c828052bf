pub mod abilities;
pub mod channels;
pub mod global_config;
pub mod logs;
pub mod tasks;
pub mod tokens;
pub mod users;

pub use abilities::Entity as Abilities;
pub use channels::Entity as Channels;
pub use global_config::Entity as GlobalConfig;
pub use logs::Entity as Logs;
pub use tasks::Entity as Tasks;
pub use tokens::Entity as Tokens;
pub use users::Entity as Users;
