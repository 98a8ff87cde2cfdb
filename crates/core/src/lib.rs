pub mod config;
pub mod error;
pub mod payload;
pub mod task;

pub use config::{load_dotenv, DroverConfig, PoolConfig, TaskSpec, TimingConfig};
pub use error::*;
pub use payload::{Execute, Payload, TaskOutput, XmlFilter, XslFilter};
pub use task::{Task, TaskId, TaskStatus};
