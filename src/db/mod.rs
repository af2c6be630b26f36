pub mod connection;
pub mod results;

pub use connection::*;
pub use results::*;
