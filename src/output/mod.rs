// Output module for spot

pub mod errors;
pub mod terminal;

pub use errors::*;
pub use terminal::*;
