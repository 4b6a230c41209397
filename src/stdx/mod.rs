pub mod queue;

pub use queue::{Queue, QueueLink, QueueNode};
