// ============================================================================
// Post Events
// ============================================================================
//
// Typed messages on top of the broker transport in src/messaging/.
//
// ============================================================================

mod core;
mod store;

pub use self::core::*;
pub use self::store::*;
