pub mod bus;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod event;
pub mod mtc;
pub mod poller;
pub mod readout;
pub mod registers;
pub mod session;
pub mod sim;
pub mod utils;
pub mod writer;

pub use bus::*;
pub use catalog::*;
pub use config::*;
pub use convert::*;
pub use device::*;
pub use error::*;
pub use event::*;
pub use mtc::*;
pub use poller::*;
pub use readout::*;
pub use registers::*;
pub use session::*;
pub use sim::*;
pub use utils::*;
pub use writer::*;
