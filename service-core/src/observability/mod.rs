pub mod logging;

pub use logging::{init_cli_tracing, init_tracing};
