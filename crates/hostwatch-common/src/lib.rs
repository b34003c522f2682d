pub mod alert;
pub mod id;
pub mod incident;
pub mod types;
