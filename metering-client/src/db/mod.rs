pub mod client_queries;
pub mod reading_queries;
