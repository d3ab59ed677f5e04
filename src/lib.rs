pub mod acquisition;
pub mod config;
pub mod device;
#[cfg(feature = "dwf")]
pub mod dwf;
pub mod error;
pub mod logbook;
pub mod pattern;
pub mod sequence;
pub mod sim;
pub mod sweep;
pub mod utils;
pub mod writer;

pub use acquisition::*;
pub use config::*;
pub use device::*;
#[cfg(feature = "dwf")]
pub use dwf::DwfDevice;
pub use error::*;
pub use logbook::*;
pub use pattern::*;
pub use sequence::*;
pub use sim::*;
pub use sweep::*;
pub use utils::*;
pub use writer::*;
