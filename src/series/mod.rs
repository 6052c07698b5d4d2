mod reader;
mod record;

pub use reader::*;
pub use record::*;
