pub mod payment;
pub mod pending;
pub mod rollout;
pub mod sweep;

pub use payment::*;
pub use pending::*;
pub use rollout::*;
pub use sweep::*;
