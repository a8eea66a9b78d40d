pub mod asset;
pub mod config;
pub mod driver;
pub mod events;
pub mod exec;
pub mod external;
pub mod nodes;
pub mod pool;
pub mod signal;
pub mod smart_objects;
pub mod telemetry;
pub mod time;
pub mod world;

pub use world::BehaviorWorld;
