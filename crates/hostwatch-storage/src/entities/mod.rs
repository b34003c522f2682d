pub mod alert;
pub mod host;
pub mod incident;
