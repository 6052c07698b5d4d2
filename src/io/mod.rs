mod bundle;
mod channel;

pub use bundle::*;
pub use channel::*;
