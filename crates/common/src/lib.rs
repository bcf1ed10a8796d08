pub mod bus;
pub mod crypto;
pub mod error;
pub mod rate_limit;
pub mod stream_parser;
