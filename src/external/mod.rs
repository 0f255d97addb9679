mod api_server;
mod logger;

pub use api_server::ApiServer;
pub use logger::init_tracing;
