// API module
//
// HTTP surface of a node: mining templates and share submission, chain
// inspection for operators and peers, and the coin endpoints.

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use handlers::AppState;
pub use routes::configure_routes;
