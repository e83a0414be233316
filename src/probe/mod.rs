pub mod correlate;
pub mod exchange;
pub mod icmp;
pub mod socket;

pub use correlate::*;
pub use exchange::*;
pub use icmp::*;
pub use socket::*;
