pub mod general;
pub mod macros;
pub mod traits;
