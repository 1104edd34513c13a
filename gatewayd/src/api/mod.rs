pub mod query;
pub mod registry;
pub mod routes;
