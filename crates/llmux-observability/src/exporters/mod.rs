pub mod log;
pub mod otlp;
