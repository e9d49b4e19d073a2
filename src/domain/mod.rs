pub mod column;
pub mod table;
pub mod types;
pub mod window;

pub use column::*;
pub use table::*;
pub use types::*;
pub use window::*;
