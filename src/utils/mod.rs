pub use cancel_token::*;
pub use counting_gate::*;

mod cancel_token;
mod counting_gate;
pub mod logger;
