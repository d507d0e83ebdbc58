pub mod index;
pub mod turns;
pub mod types;

pub use index::{MemoryIndex, Neighbor, Query};
pub use turns::{RecalledTurn, TurnLog};
