pub mod config;
pub mod energy;
pub mod error;
pub mod feed;
pub mod meter;
pub mod mqtt;
pub mod normalize;
pub mod power;
pub mod runner;
pub mod session;
pub mod sink;
pub mod thermal;
pub mod warning;

pub use config::Config;
pub use error::{AppError, Result};
pub use feed::{FeedRouter, ReadingBus, Subscription};
pub use normalize::NormalizedReading;
pub use session::{ReadingListener, SessionSettings, UnitKind, UnitSession};
