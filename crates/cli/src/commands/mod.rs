pub mod explain;
pub mod nodes;
pub mod requests;
