pub mod handlers;
pub mod handlers_face;
pub mod routes;
