pub mod agent;
pub mod decision;
pub mod position;
