pub mod space;
pub mod objective;
pub mod trial;
pub mod session;
pub mod errors;

pub use space::*;
pub use objective::*;
pub use trial::*;
pub use session::*;
pub use errors::*;
