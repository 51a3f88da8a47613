pub mod aggregate;
pub mod archive;
pub mod cnpj;
pub mod config;
pub mod consolidate;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod model;
pub mod pipeline;
pub mod reports;
pub mod warehouse;
