pub mod directory;
pub mod gateway;

pub use directory::HttpDirectory;
pub use gateway::GatewayNetwork;
