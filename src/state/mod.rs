pub mod identity;
pub mod report;
pub mod result;

pub use identity::*;
pub use report::*;
pub use result::*;
