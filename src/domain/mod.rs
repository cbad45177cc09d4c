pub mod entities;
pub mod errors;
pub mod oracles;
pub mod services;
