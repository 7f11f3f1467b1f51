mod handlers;
mod middleware;
mod routes;
mod static_files;

pub use handlers::StatusInfo;
pub use routes::create_router;
pub use static_files::StaticAssets;
